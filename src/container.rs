//! A container whose release kills every process placed in it.
//!
//! On Windows this is a job object with `JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE`.
//! On Unix it is the set of process groups of its members: the launcher makes
//! every child the leader of a fresh group before it runs, so anything the
//! child spawns lands in the same group, and releasing the container sends
//! `SIGKILL` to each group.

#![allow(unsafe_code)]

use crate::error::Result;
use crate::launch::{ChildProcess, LaunchState};

/// Owns the kill-on-release guarantee for a supervised launch.
#[derive(Debug)]
pub struct ProcessContainer {
    members: Vec<u32>,
    released: bool,
    os: imp::Container,
}

impl ProcessContainer {
    pub fn create() -> Result<Self> {
        let os = imp::Container::create()?;
        debug!("Created process container");
        Ok(Self {
            members: Vec::new(),
            released: false,
            os,
        })
    }

    /// Places a parked or running child in the container.
    ///
    /// A parked child becomes [`LaunchState::Contained`] and may be resumed.
    pub fn add_process(&mut self, child: &ChildProcess) -> Result<()> {
        if self.released {
            return Err(imp::released_error());
        }

        self.os.add(child)?;
        self.members.push(child.pid());
        child.advance(LaunchState::Created, LaunchState::Contained);
        debug!("Added process {} to container", child.pid());
        Ok(())
    }

    /// Pids of every process ever added.
    pub fn members(&self) -> &[u32] {
        &self.members
    }

    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Closes the container, killing whatever is still alive in it. Calling
    /// this again does nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        debug!("Releasing process container ({} members)", self.members.len());
        self.os.release();
    }
}

impl Drop for ProcessContainer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
mod imp {
    use std::io;

    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::{getpgid, getpgrp, Pid};

    use crate::error::Error;
    use crate::launch::ChildProcess;

    #[derive(Debug, Default)]
    pub(super) struct Container {
        groups: Vec<Pid>,
    }

    pub(super) fn released_error() -> Error {
        Error::Os {
            about: "add process to container",
            err: io::Error::from_raw_os_error(Errno::EBADF as i32),
        }
    }

    impl Container {
        pub(super) fn create() -> Result<Self, Error> {
            Ok(Self::default())
        }

        pub(super) fn add(&mut self, child: &ChildProcess) -> Result<(), Error> {
            if child.exit_status().is_some() {
                return Err(Error::Os {
                    about: "add process to container",
                    err: io::Error::from_raw_os_error(Errno::ESRCH as i32),
                });
            }

            let group = getpgid(Some(Pid::from_raw(child.pid() as i32))).map_err(|errno| {
                Error::Os {
                    about: "add process to container",
                    err: errno.into(),
                }
            })?;

            // killing our own group on release would take the supervisor down too
            if group == getpgrp() {
                return Err(Error::Os {
                    about: "add process to container",
                    err: io::Error::from_raw_os_error(Errno::EPERM as i32),
                });
            }

            if !self.groups.contains(&group) {
                self.groups.push(group);
            }
            Ok(())
        }

        pub(super) fn release(&mut self) {
            for group in self.groups.drain(..) {
                match killpg(group, Signal::SIGKILL) {
                    Ok(()) => debug!("Killed process group {}", group),
                    Err(Errno::ESRCH) => trace!("Process group {} already gone", group),
                    Err(errno) => warn!("Failed to kill process group {}: {}", group, errno),
                }
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::mem;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
    use std::ptr;

    use winapi::{
        shared::{minwindef::DWORD, minwindef::LPVOID, winerror::ERROR_INVALID_HANDLE},
        um::{
            jobapi2::{AssignProcessToJobObject, CreateJobObjectW, SetInformationJobObject},
            winnt::{
                JobObjectExtendedLimitInformation, HANDLE, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
                JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
            },
        },
    };

    use crate::error::Error;
    use crate::launch::ChildProcess;

    #[derive(Debug)]
    pub(super) struct Container {
        job: Option<OwnedHandle>,
    }

    pub(super) fn released_error() -> Error {
        Error::Os {
            about: "add process to container",
            err: io::Error::from_raw_os_error(ERROR_INVALID_HANDLE as i32),
        }
    }

    impl Container {
        pub(super) fn create() -> Result<Self, Error> {
            let raw = unsafe { CreateJobObjectW(ptr::null_mut(), ptr::null()) };
            if raw.is_null() {
                return Err(Error::last_os("create job object"));
            }
            let job = unsafe { OwnedHandle::from_raw_handle(raw as RawHandle) };

            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            let set = unsafe {
                SetInformationJobObject(
                    job.as_raw_handle() as HANDLE,
                    JobObjectExtendedLimitInformation,
                    &mut info as *mut _ as LPVOID,
                    mem::size_of_val(&info) as DWORD,
                )
            };
            if set == 0 {
                return Err(Error::last_os("configure job object"));
            }

            Ok(Self { job: Some(job) })
        }

        pub(super) fn add(&mut self, child: &ChildProcess) -> Result<(), Error> {
            let job = self.job.as_ref().ok_or_else(released_error)?;
            let assigned = unsafe {
                AssignProcessToJobObject(
                    job.as_raw_handle() as HANDLE,
                    child.os().process_handle() as HANDLE,
                )
            };
            if assigned == 0 {
                return Err(Error::last_os("add process to container"));
            }
            Ok(())
        }

        pub(super) fn release(&mut self) {
            // closing the last handle to the job kills its processes
            drop(self.job.take());
        }
    }
}

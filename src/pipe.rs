//! Anonymous pipes carrying the child's standard output and error.
//!
//! The supervisor keeps the read end as a [`File`]; the write end is a
//! [`ChildEnd`] which is handed to the launcher and closed in this process as
//! soon as the child has its own copy. If the supervisor held on to a write
//! end, the reader would never see end-of-stream after the child exits.

#![allow(unsafe_code)]

use std::{fs::File, io};

pub use self::imp::ChildEnd;
#[cfg(unix)]
pub(crate) use self::imp::pipe_cloexec;

/// Creates a pipe whose write end is destined for a child process.
pub fn output_channel() -> io::Result<(File, ChildEnd)> {
    self::imp::output_channel()
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

    /// The child's (write) end of an output pipe.
    #[derive(Debug)]
    pub struct ChildEnd(OwnedFd);

    impl ChildEnd {
        pub(crate) fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    impl AsFd for ChildEnd {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.0.as_fd()
        }
    }

    pub fn output_channel() -> io::Result<(File, ChildEnd)> {
        let (read, write) = pipe_cloexec()?;
        Ok((File::from(read), ChildEnd(write)))
    }

    /// A pipe with both ends close-on-exec, so that only descriptors explicitly
    /// duplicated onto stdio survive into a child.
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    pub(crate) fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
        use nix::{fcntl::OFlag, unistd::pipe2};

        Ok(pipe2(OFlag::O_CLOEXEC)?)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    pub(crate) fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};
        use nix::unistd::pipe;

        let (read, write) = pipe()?;
        for fd in [&read, &write] {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        Ok((read, write))
    }
}

#[cfg(windows)]
mod imp {
    use std::fs::File;
    use std::io;
    use std::mem;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
    use std::ptr;
    use winapi::{
        shared::minwindef::{DWORD, TRUE},
        um::{
            handleapi::SetHandleInformation, minwinbase::SECURITY_ATTRIBUTES,
            namedpipeapi::CreatePipe, winbase::HANDLE_FLAG_INHERIT, winnt::HANDLE,
        },
    };

    /// The child's (write) end of an output pipe. Inheritable.
    #[derive(Debug)]
    pub struct ChildEnd(OwnedHandle);

    impl ChildEnd {
        pub(crate) fn as_raw_handle(&self) -> RawHandle {
            self.0.as_raw_handle()
        }
    }

    pub fn output_channel() -> io::Result<(File, ChildEnd)> {
        let mut attributes = SECURITY_ATTRIBUTES {
            nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
            lpSecurityDescriptor: ptr::null_mut(),
            bInheritHandle: TRUE,
        };

        let mut read: HANDLE = ptr::null_mut();
        let mut write: HANDLE = ptr::null_mut();
        if unsafe { CreatePipe(&mut read, &mut write, &mut attributes, 0) } == 0 {
            return Err(io::Error::last_os_error());
        }

        let (read, write) = unsafe {
            (
                OwnedHandle::from_raw_handle(read as RawHandle),
                OwnedHandle::from_raw_handle(write as RawHandle),
            )
        };

        // only the write end may leak into the child
        if unsafe { SetHandleInformation(read.as_raw_handle() as HANDLE, HANDLE_FLAG_INHERIT, 0) }
            == 0
        {
            return Err(io::Error::last_os_error());
        }

        Ok((File::from(read), ChildEnd(write)))
    }
}

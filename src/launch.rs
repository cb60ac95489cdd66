//! Suspended launch of the server process.
//!
//! A child is created in a parked state ([`LaunchState::Created`]), must be
//! added to a [`ProcessContainer`](crate::container::ProcessContainer)
//! ([`LaunchState::Contained`]) and only then is allowed to run with
//! [`ChildProcess::resume`]. Until it runs it cannot have spawned anything,
//! so nothing it starts can escape the container.

#![allow(unsafe_code)]

use std::{
    env, fmt, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex,
    },
};

use crate::error::{Error, Result};
use crate::lock;
use crate::pipe::ChildEnd;

/// Lifecycle of a supervised child.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LaunchState {
    /// The process exists but its primary thread has not run yet.
    Created,
    /// Added to a container, still parked.
    Contained,
    Running,
    /// A graceful stop was sent; waiting for the exit.
    Stopping,
    Exited,
    /// The process never got to run the requested program.
    LaunchFailed,
}

/// How a child ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    Exited(i32),
    /// Killed by this signal number (Unix only).
    Signalled(i32),
}

impl ExitStatus {
    pub const fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Signalled(_) => None,
        }
    }

    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {}", code),
            Self::Signalled(signo) => write!(f, "signal {}", signo),
        }
    }
}

#[derive(Debug)]
enum Exit {
    Pending,
    Waiting,
    /// `None` if the OS wait failed and the status is unknowable.
    Known(Option<ExitStatus>),
}

/// A launched child. Owned by the supervisor, shared with its exit monitor.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    state: Mutex<LaunchState>,
    stop_requested: AtomicBool,
    exit: Mutex<Exit>,
    exited: Condvar,
    reaped: AtomicBool,
    os: imp::Inner,
}

impl ChildProcess {
    fn new(pid: u32, os: imp::Inner) -> Self {
        Self {
            pid,
            state: Mutex::new(LaunchState::Created),
            stop_requested: AtomicBool::new(false),
            exit: Mutex::new(Exit::Pending),
            exited: Condvar::new(),
            reaped: AtomicBool::new(false),
            os,
        }
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> LaunchState {
        *lock(&self.state)
    }

    #[cfg(windows)]
    pub(crate) const fn os(&self) -> &imp::Inner {
        &self.os
    }

    /// Moves from `from` to `to`; returns false (and changes nothing) if the
    /// child was not in `from`.
    pub(crate) fn advance(&self, from: LaunchState, to: LaunchState) -> bool {
        let mut state = lock(&self.state);
        if *state == from {
            trace!("child {}: {:?} -> {:?}", self.pid, from, to);
            *state = to;
            true
        } else {
            false
        }
    }

    fn set_state(&self, to: LaunchState) {
        *lock(&self.state) = to;
    }

    /// Lets a contained child run.
    pub fn resume(&self) -> Result<()> {
        let state = self.state();
        if state != LaunchState::Contained {
            return Err(Error::NotContained(state));
        }

        match self.os.resume(self.pid) {
            Ok(()) => {
                self.advance(LaunchState::Contained, LaunchState::Running);
                debug!("Resumed child process {}", self.pid);
                Ok(())
            }
            Err(err) => {
                if self.os.resume_left_zombie() {
                    if let Err(wait_err) = self.reap() {
                        debug!("Reaping failed child {}: {}", self.pid, wait_err);
                    }
                }
                self.set_state(LaunchState::LaunchFailed);
                Err(err)
            }
        }
    }

    /// Blocks until the child has exited.
    ///
    /// The OS-level wait happens once, in whichever thread gets here first;
    /// everyone else waits for that result. The child is not reaped: its
    /// process ID stays reserved until [`reap`](Self::reap).
    pub fn wait(&self) -> Result<ExitStatus> {
        let mut exit = lock(&self.exit);
        loop {
            match *exit {
                Exit::Known(Some(status)) => return Ok(status),
                Exit::Known(None) => {
                    return Err(Error::Os {
                        about: "wait for child",
                        err: io::Error::new(io::ErrorKind::Other, "exit status was lost"),
                    })
                }
                Exit::Waiting => {
                    exit = self
                        .exited
                        .wait(exit)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                Exit::Pending => break,
            }
        }
        *exit = Exit::Waiting;
        drop(exit);

        let result = self.os.wait(self.pid);

        let mut exit = lock(&self.exit);
        *exit = Exit::Known(result.as_ref().ok().copied());
        self.exited.notify_all();
        drop(exit);

        if let Ok(status) = result {
            debug!("Child process {} exited with {}", self.pid, status);
            let mut state = lock(&self.state);
            if *state != LaunchState::LaunchFailed {
                *state = LaunchState::Exited;
            }
        }

        result
    }

    /// Waits for the child, then releases its process ID back to the OS.
    ///
    /// Nothing may be sent to the child or its process group after this.
    pub fn reap(&self) -> Result<ExitStatus> {
        let status = self.wait()?;
        if !self.reaped.swap(true, Ordering::AcqRel) {
            self.os.reap(self.pid)?;
            trace!("Reaped child process {}", self.pid);
        }
        Ok(status)
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }

    /// The exit status, if the child is known to have exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match *lock(&self.exit) {
            Exit::Known(status) => status,
            _ => None,
        }
    }

    /// Latches the one stop this child will ever get.
    ///
    /// Returns true for the first caller only, whether that is an explicit
    /// stop request or the monitor noticing the child exit by itself.
    pub fn try_begin_stop(&self) -> bool {
        let won = self
            .stop_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.advance(LaunchState::Running, LaunchState::Stopping);
        }
        won
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Creates `command` with `args` in `working_dir`, parked before it runs any
/// of the program.
///
/// The write ends are consumed: this process's copies are closed by the time
/// the call returns, whether it succeeds or not.
pub fn launch_suspended(
    command: &Path,
    args: &[String],
    working_dir: &Path,
    stdout: ChildEnd,
    stderr: ChildEnd,
) -> Result<ChildProcess> {
    let program = resolve_executable(command).map_err(Error::os("resolve executable"))?;
    debug!("Launching {:?} suspended in {:?}", program, working_dir);
    let (pid, os) = imp::spawn_suspended(&program, args, working_dir, stdout, stderr)?;
    debug!("Created child process {}", pid);
    Ok(ChildProcess::new(pid, os))
}

/// Finds the file `command` refers to: a path containing a directory part is
/// taken as-is (made absolute), a bare name is searched for on the PATH.
pub fn resolve_executable(command: &Path) -> io::Result<PathBuf> {
    let has_dir = command.is_absolute() || command.components().count() > 1;
    if has_dir {
        let absolute = if command.is_absolute() {
            command.to_path_buf()
        } else {
            env::current_dir()?.join(command)
        };
        return imp::check_executable(&absolute).map(|()| absolute);
    }

    find_on_path(command).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not found on PATH", command.display()),
        )
    })
}

/// Searches the PATH for an executable called `name`.
pub fn find_on_path(name: &Path) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .flat_map(|dir| imp::candidates(&dir, name))
        .find(|candidate| imp::check_executable(candidate).is_ok())
}

#[cfg(unix)]
mod imp {
    use std::ffi::{CStr, CString};
    use std::fs::File;
    use std::io::{self, Read};
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::path::{Path, PathBuf};
    use std::{iter, mem, ptr};

    use nix::errno::Errno;
    use nix::libc::{self, c_char};
    use nix::sys::signal::{kill, Signal};
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    use nix::sys::wait::{waitid, Id};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{fork, getpid, ForkResult, Pid};

    use super::ExitStatus;
    use crate::error::{Error, Result};
    use crate::lock;
    use crate::pipe::{pipe_cloexec, ChildEnd};

    /// Unix side of a child: the pipe on which the child reports a failed exec.
    #[derive(Debug)]
    pub(crate) struct Inner {
        exec_errors: std::sync::Mutex<Option<File>>,
    }

    impl Inner {
        pub(super) fn resume(&self, pid: u32) -> Result<()> {
            kill(Pid::from_raw(pid as i32), Signal::SIGCONT)
                .map_err(|errno| Error::Os {
                    about: "resume child process",
                    err: errno.into(),
                })?;

            // EOF: the exec went through and closed the pipe.
            // Four bytes: the exec failed with that errno.
            let errors = lock(&self.exec_errors).take();
            if let Some(mut errors) = errors {
                let mut report = Vec::with_capacity(4);
                errors
                    .read_to_end(&mut report)
                    .map_err(Error::os("read exec status"))?;
                if let Some(code) = decode_errno(&report) {
                    return Err(Error::Os {
                        about: "exec child process",
                        err: io::Error::from_raw_os_error(code),
                    });
                }
            }

            Ok(())
        }

        pub(super) fn resume_left_zombie(&self) -> bool {
            true
        }

        /// Leaves the exited child a zombie, so neither its ID nor its
        /// process group can be reused until [`reap`](Self::reap).
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        pub(super) fn wait(&self, pid: u32) -> Result<ExitStatus> {
            let pid = Pid::from_raw(pid as i32);
            loop {
                match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                    Ok(status) => {
                        if let Some(status) = exited(status) {
                            return Ok(status);
                        }
                    }
                    Err(Errno::EINTR) => {}
                    Err(errno) => return Err(wait_failed(errno)),
                }
            }
        }

        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        pub(super) fn reap(&self, pid: u32) -> Result<()> {
            waitpid_exit(Pid::from_raw(pid as i32)).map(drop)
        }

        // no way to peek at an exit here: waiting reaps
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        pub(super) fn wait(&self, pid: u32) -> Result<ExitStatus> {
            waitpid_exit(Pid::from_raw(pid as i32))
        }

        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        pub(super) fn reap(&self, _pid: u32) -> Result<()> {
            Ok(())
        }
    }

    fn exited(status: WaitStatus) -> Option<ExitStatus> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signalled(signal as i32)),
            _ => None,
        }
    }

    fn wait_failed(errno: Errno) -> Error {
        Error::Os {
            about: "wait for child",
            err: errno.into(),
        }
    }

    fn waitpid_exit(pid: Pid) -> Result<ExitStatus> {
        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    if let Some(status) = exited(status) {
                        return Ok(status);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(wait_failed(errno)),
            }
        }
    }

    fn decode_errno(report: &[u8]) -> Option<i32> {
        if report.len() < 4 {
            return None;
        }
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&report[..4]);
        Some(i32::from_be_bytes(bytes))
    }

    fn c_string(bytes: &[u8]) -> Result<CString> {
        CString::new(bytes).map_err(|err| Error::Os {
            about: "prepare child arguments",
            err: io::Error::new(io::ErrorKind::InvalidInput, err),
        })
    }

    pub(super) fn spawn_suspended(
        program: &Path,
        args: &[String],
        working_dir: &Path,
        stdout: ChildEnd,
        stderr: ChildEnd,
    ) -> Result<(u32, Inner)> {
        // Everything the child needs is allocated up front: between fork and
        // exec only async-signal-safe calls are allowed.
        let c_program = c_string(program.as_os_str().as_bytes())?;
        let mut c_args = Vec::with_capacity(args.len() + 1);
        c_args.push(c_program.clone());
        for arg in args {
            c_args.push(c_string(arg.as_bytes())?);
        }
        let argv: Vec<*const c_char> = c_args
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(iter::once(ptr::null()))
            .collect();
        let c_dir = c_string(working_dir.as_os_str().as_bytes())?;

        let stdin = File::open("/dev/null").map_err(Error::os("open /dev/null"))?;
        let (report_read, report_write) =
            pipe_cloexec().map_err(Error::os("create exec status pipe"))?;
        let parent = getpid();

        let child = match unsafe { fork() } {
            Err(errno) => {
                return Err(Error::Os {
                    about: "fork child process",
                    err: errno.into(),
                })
            }
            Ok(ForkResult::Child) => unsafe {
                exec_child(
                    &c_program,
                    &argv,
                    &c_dir,
                    parent.as_raw(),
                    [stdin.as_raw_fd(), stdout.as_raw_fd(), stderr.as_raw_fd()],
                    report_write.as_raw_fd(),
                )
            },
            Ok(ForkResult::Parent { child }) => child,
        };

        // The child has its own copies now.
        drop(report_write);
        drop(stdout);
        drop(stderr);
        drop(stdin);

        let mut report_read = File::from(report_read);
        loop {
            match waitpid(child, Some(WaitPidFlag::WUNTRACED)) {
                Ok(WaitStatus::Stopped(..)) => break,
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    let mut report = Vec::with_capacity(4);
                    let _ = report_read.read_to_end(&mut report);
                    let err = decode_errno(&report)
                        .map(io::Error::from_raw_os_error)
                        .unwrap_or_else(|| {
                            io::Error::new(io::ErrorKind::Other, "child died before it was parked")
                        });
                    return Err(Error::Os {
                        about: "prepare child process",
                        err,
                    });
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(Error::Os {
                        about: "wait for child to park",
                        err: errno.into(),
                    })
                }
            }
        }

        let inner = Inner {
            exec_errors: std::sync::Mutex::new(Some(report_read)),
        };
        Ok((child.as_raw() as u32, inner))
    }

    /// Runs in the forked child. Never returns: either the exec replaces this
    /// image, or the failing errno is written to `report` and the child exits.
    unsafe fn exec_child(
        program: &CStr,
        argv: &[*const c_char],
        dir: &CStr,
        parent: libc::pid_t,
        stdio: [RawFd; 3],
        report: RawFd,
    ) -> ! {
        fn fail(report: RawFd) -> ! {
            let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            let bytes = code.to_be_bytes();
            unsafe {
                libc::write(report, bytes.as_ptr().cast(), bytes.len());
                libc::_exit(127)
            }
        }

        // own process group: the unit that gets signalled and killed
        if libc::setpgid(0, 0) != 0 {
            fail(report);
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                fail(report);
            }
            if libc::getppid() != parent {
                libc::_exit(127);
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = parent;

        for (&fd, target) in stdio.iter().zip(0..) {
            // dup2 onto itself would keep the close-on-exec flag
            let wired = if fd == target {
                libc::fcntl(fd, libc::F_SETFD, 0)
            } else {
                libc::dup2(fd, target)
            };
            if wired == -1 {
                fail(report);
            }
        }

        if libc::chdir(dir.as_ptr()) != 0 {
            fail(report);
        }

        // the supervisor may be masking or ignoring these; the server must not
        let mut empty: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::pthread_sigmask(libc::SIG_SETMASK, &empty, ptr::null_mut());
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);

        // parked until contained and resumed
        libc::raise(libc::SIGSTOP);

        libc::execv(program.as_ptr(), argv.as_ptr());
        fail(report)
    }

    pub(super) fn check_executable(path: &Path) -> io::Result<()> {
        let meta = path.metadata()?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            ));
        }
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is not executable", path.display()),
            ));
        }
        Ok(())
    }

    pub(super) fn candidates(dir: &Path, name: &Path) -> Vec<PathBuf> {
        vec![dir.join(name)]
    }
}

#[cfg(windows)]
mod imp {
    use std::ffi::OsStr;
    use std::io;
    use std::iter;
    use std::mem;
    use std::os::windows::ffi::OsStrExt;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
    use std::path::{Path, PathBuf};
    use std::ptr;

    use winapi::{
        shared::minwindef::{DWORD, TRUE},
        um::{
            processthreadsapi::{
                CreateProcessW, GetExitCodeProcess, ResumeThread, PROCESS_INFORMATION,
                STARTUPINFOW,
            },
            synchapi::WaitForSingleObject,
            winbase::{
                CREATE_NO_WINDOW, CREATE_SUSPENDED, INFINITE, STARTF_USESTDHANDLES, WAIT_FAILED,
            },
            winnt::HANDLE,
        },
    };

    use super::ExitStatus;
    use crate::cmdline;
    use crate::error::{Error, Result};
    use crate::pipe::ChildEnd;

    /// Windows side of a child: its process and primary thread handles.
    #[derive(Debug)]
    pub(crate) struct Inner {
        process: OwnedHandle,
        thread: OwnedHandle,
    }

    impl Inner {
        pub(crate) fn process_handle(&self) -> RawHandle {
            self.process.as_raw_handle()
        }

        pub(super) fn resume(&self, _pid: u32) -> Result<()> {
            if unsafe { ResumeThread(self.thread.as_raw_handle() as HANDLE) } == DWORD::MAX {
                return Err(Error::last_os("resume child process thread"));
            }
            Ok(())
        }

        pub(super) fn resume_left_zombie(&self) -> bool {
            false
        }

        pub(super) fn wait(&self, _pid: u32) -> Result<ExitStatus> {
            let process = self.process.as_raw_handle() as HANDLE;
            if unsafe { WaitForSingleObject(process, INFINITE) } == WAIT_FAILED {
                return Err(Error::last_os("wait for child"));
            }

            let mut code: DWORD = 0;
            if unsafe { GetExitCodeProcess(process, &mut code) } == 0 {
                return Err(Error::last_os("get child exit code"));
            }
            Ok(ExitStatus::Exited(code as i32))
        }

        /// The open process handle is what keeps the ID reserved.
        pub(super) fn reap(&self, _pid: u32) -> Result<()> {
            Ok(())
        }
    }

    fn wide(s: &OsStr) -> Vec<u16> {
        s.encode_wide().chain(iter::once(0)).collect()
    }

    pub(super) fn spawn_suspended(
        program: &Path,
        args: &[String],
        working_dir: &Path,
        stdout: ChildEnd,
        stderr: ChildEnd,
    ) -> Result<(u32, Inner)> {
        let application = wide(program.as_os_str());
        let program_arg = program.to_string_lossy();
        let line = cmdline::join_windows(
            iter::once(program_arg.as_ref()).chain(args.iter().map(String::as_str)),
        );
        let mut command_line = wide(OsStr::new(&line));
        let directory = wide(working_dir.as_os_str());

        let mut startup: STARTUPINFOW = unsafe { mem::zeroed() };
        startup.cb = mem::size_of::<STARTUPINFOW>() as DWORD;
        startup.dwFlags = STARTF_USESTDHANDLES;
        startup.hStdInput = ptr::null_mut();
        startup.hStdOutput = stdout.as_raw_handle() as HANDLE;
        startup.hStdError = stderr.as_raw_handle() as HANDLE;

        let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
        let created = unsafe {
            CreateProcessW(
                application.as_ptr(),
                command_line.as_mut_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                TRUE,
                CREATE_SUSPENDED | CREATE_NO_WINDOW,
                ptr::null_mut(),
                directory.as_ptr(),
                &mut startup,
                &mut info,
            )
        };
        if created == 0 {
            return Err(Error::last_os("create child process"));
        }

        // The child has its own copies now.
        drop(stdout);
        drop(stderr);

        let inner = unsafe {
            Inner {
                process: OwnedHandle::from_raw_handle(info.hProcess as RawHandle),
                thread: OwnedHandle::from_raw_handle(info.hThread as RawHandle),
            }
        };
        Ok((info.dwProcessId, inner))
    }

    pub(super) fn check_executable(path: &Path) -> io::Result<()> {
        let meta = path.metadata()?;
        if meta.is_file() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            ))
        }
    }

    pub(super) fn candidates(dir: &Path, name: &Path) -> Vec<PathBuf> {
        if name.extension().is_some() {
            vec![dir.join(name)]
        } else {
            vec![dir.join(name).with_extension("exe"), dir.join(name)]
        }
    }
}

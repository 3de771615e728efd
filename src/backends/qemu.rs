//! Fork server backend
//!
//! Drives an instrumented runner implementing the AFL fork server
//! protocol under a userspace emulator. The runner is spawned once;
//! every execution afterwards is a single fork on its side, requested
//! and reaped over two named pipes installed at fixed fd numbers.

use std::ffi::{CStr, CString};
use std::fs;
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{close, mkfifo, read, write, Pid};

use super::{nix_to_io, Backend, BackendError, Execution, Result};
use crate::config::Config;
use crate::feedback::Trace;
use crate::shmem::SharedMap;

/// Fd number at which the runner expects the fork request pipe; the
/// status pipe sits at the next number
pub const FORKSRV_FD: RawFd = 198;

/// Environment variable carrying the shared map identifier
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Emulator binary implementing the fork server protocol
const QEMU_RUNNER: &str = "afl-qemu-trace";

const FIFO_IN: &str = "forksrv_in";
const FIFO_OUT: &str = "forksrv_out";
const INPUT_FILE: &str = "__input_file";

/// How long to wait for the runner to come up before giving up
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Fork server backend state
pub struct QemuBackend {
    /// Emulator process hosting the fork server
    child: Child,
    /// Shared coverage map
    map: SharedMap,
    /// Engine side of the fork request pipe
    ctl_fd: RawFd,
    /// Engine side of the status pipe
    status_fd: RawFd,
    /// Staging file duplicated to the target's stdin
    input: fs::File,
    fifo_in: PathBuf,
    fifo_out: PathBuf,
    input_path: PathBuf,
    /// Per execution timeout, zero when disabled
    timeout: Duration,
    cleaned: bool,
}

impl QemuBackend {
    /// Launch the runner and complete the fork server handshake
    pub fn new(config: &Config) -> Result<Self> {
        let work_dir = Path::new(&config.io_config.work_dir);
        let fifo_in = work_dir.join(FIFO_IN);
        let fifo_out = work_dir.join(FIFO_OUT);
        let input_path = work_dir.join(INPUT_FILE);

        let map = SharedMap::new().map_err(BackendError::Setup)?;

        // Stale pipes from a previous run
        let _ = fs::remove_file(&fifo_in);
        let _ = fs::remove_file(&fifo_out);
        mkfifo(&fifo_in, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|error| BackendError::Setup(nix_to_io(error)))?;
        mkfifo(&fifo_out, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|error| BackendError::Setup(nix_to_io(error)))?;

        // The staging file is created once and re-used for every
        // execution; the child's stdin shares its open description so
        // rewinding it in the engine rewinds the target's input
        let input = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&input_path)
            .map_err(BackendError::Setup)?;
        let child_stdin = input.try_clone().map_err(BackendError::Setup)?;

        let mut command = Command::new(QEMU_RUNNER);
        command
            .arg(&config.exe_config.target)
            .env(SHM_ENV_VAR, map.id())
            .stdin(Stdio::from(child_stdin))
            .stdout(Stdio::null());
        if config.app_config.verbose {
            command.stderr(Stdio::inherit());
        } else {
            command.stderr(Stdio::null());
        }

        let ctl_path = CString::new(fifo_in.as_os_str().as_bytes())
            .map_err(|error| BackendError::Setup(io::Error::new(io::ErrorKind::InvalidInput, error)))?;
        let status_path = CString::new(fifo_out.as_os_str().as_bytes())
            .map_err(|error| BackendError::Setup(io::Error::new(io::ErrorKind::InvalidInput, error)))?;
        unsafe {
            command.pre_exec(move || {
                // Between fork and exec: put the pipes where the
                // runner expects to find them
                install_pipe(&ctl_path, libc::O_RDONLY, FORKSRV_FD)?;
                install_pipe(&status_path, libc::O_WRONLY, FORKSRV_FD + 1)?;
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(BackendError::Spawn)?;

        let (ctl_fd, status_fd) = match Self::connect(&fifo_in, &fifo_out, &mut child) {
            Ok(fds) => fds,
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = fs::remove_file(&fifo_in);
                let _ = fs::remove_file(&fifo_out);
                let _ = fs::remove_file(&input_path);
                return Err(error);
            }
        };

        Ok(Self {
            child,
            map,
            ctl_fd,
            status_fd,
            input,
            fifo_in,
            fifo_out,
            input_path,
            timeout: Duration::from_secs(config.app_config.timeout),
            cleaned: false,
        })
    }

    /// Open the engine side of both pipes and wait for the 4 byte
    /// handshake announcing the fork server is ready
    fn connect(fifo_in: &Path, fifo_out: &Path, child: &mut Child) -> Result<(RawFd, RawFd)> {
        let deadline = Instant::now() + STARTUP_TIMEOUT;

        // The write end can only open once the runner holds the read
        // end, so a refused open doubles as a liveness probe
        let ctl_fd = loop {
            match open(fifo_in, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty()) {
                Ok(fd) => break fd,
                Err(Errno::ENXIO) => {
                    if let Some(status) = child.try_wait().map_err(BackendError::Spawn)? {
                        return Err(BackendError::PrematureExit(format!(
                            "runner exited during startup: {}",
                            status
                        )));
                    }
                    if Instant::now() >= deadline {
                        return Err(BackendError::PrematureExit(String::from(
                            "runner never opened the control pipe",
                        )));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(error) => return Err(BackendError::Setup(nix_to_io(error))),
            }
        };

        let status_fd = open(fifo_out, OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty())
            .map_err(|error| BackendError::Setup(nix_to_io(error)))?;

        // Back to blocking for the per execution protocol
        fcntl(ctl_fd, FcntlArg::F_SETFL(OFlag::empty()))
            .map_err(|error| BackendError::Setup(nix_to_io(error)))?;
        fcntl(status_fd, FcntlArg::F_SETFL(OFlag::empty()))
            .map_err(|error| BackendError::Setup(nix_to_io(error)))?;

        loop {
            if readable_within(status_fd, Duration::from_millis(100)).map_err(BackendError::Ipc)? {
                break;
            }
            if let Some(status) = child.try_wait().map_err(BackendError::Spawn)? {
                return Err(BackendError::PrematureExit(format!(
                    "runner exited before the handshake: {}",
                    status
                )));
            }
            if Instant::now() >= deadline {
                return Err(BackendError::PrematureExit(String::from(
                    "timed out waiting for the fork server handshake",
                )));
            }
        }

        // Handshake content is opaque, presence means ready
        let mut hello = [0u8; 4];
        read_exact(status_fd, &mut hello).map_err(BackendError::Ipc)?;

        Ok((ctl_fd, status_fd))
    }

    /// Stage `data` as the target's next stdin payload
    fn stage_input(&mut self, data: &[u8]) -> io::Result<()> {
        self.input.seek(SeekFrom::Start(0))?;
        self.input.write_all(data)?;
        self.input.set_len(data.len() as u64)?;
        self.input.seek(SeekFrom::Start(0))?;

        Ok(())
    }
}

impl Backend for QemuBackend {
    fn run(&mut self, data: &[u8]) -> Result<Execution> {
        self.map.zero();
        self.stage_input(data).map_err(BackendError::Ipc)?;

        let start = Instant::now();

        // Any 4 bytes request a fork
        write_all(self.ctl_fd, &[0u8; 4]).map_err(BackendError::Ipc)?;

        let mut word = [0u8; 4];
        read_exact(self.status_fd, &mut word).map_err(BackendError::Ipc)?;
        let pid = i32::from_le_bytes(word);

        if self.timeout > Duration::from_secs(0)
            && !readable_within(self.status_fd, self.timeout).map_err(BackendError::Ipc)?
        {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            // Consume the status of the killed child to stay in sync
            read_exact(self.status_fd, &mut word).map_err(BackendError::Ipc)?;
            return Ok(Execution::Hung);
        }

        read_exact(self.status_fd, &mut word).map_err(BackendError::Ipc)?;
        let duration = start.elapsed();

        let (did_crash, exit_signal, exit_code) = decode_status(i32::from_le_bytes(word));

        Ok(Execution::Completed(Trace::new(
            self.map.snapshot(),
            did_crash,
            exit_signal,
            exit_code,
            duration,
        )))
    }

    fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = close(self.ctl_fd);
        let _ = close(self.status_fd);
        let _ = fs::remove_file(&self.fifo_in);
        let _ = fs::remove_file(&self.fifo_out);
        let _ = fs::remove_file(&self.input_path);
    }
}

impl Drop for QemuBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Open `path` and install it at `fd`. Runs between fork and exec, so
/// only async signal safe calls are allowed.
fn install_pipe(path: &CStr, flags: libc::c_int, fd: RawFd) -> io::Result<()> {
    let pipe = unsafe { libc::open(path.as_ptr(), flags) };
    if pipe < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::dup2(pipe, fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if pipe != fd {
        unsafe { libc::close(pipe) };
    }

    Ok(())
}

/// Split a raw wait status into `(did_crash, exit_signal, exit_code)`
fn decode_status(status: i32) -> (bool, u8, u8) {
    let exit_signal = (status & 0x7F) as u8;
    let exit_code = ((status >> 8) & 0xFF) as u8;

    (exit_signal != 0, exit_signal, exit_code)
}

/// Wait until `fd` is readable, up to `timeout`
fn readable_within(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

        match poll(&mut fds, remaining.as_millis() as libc::c_int) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => {
                if Instant::now() >= deadline {
                    return Ok(false);
                }
            }
            Err(error) => return Err(nix_to_io(error)),
        }
    }
}

/// Read exactly `buf.len()` bytes from `fd`
fn read_exact(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;

    while done < buf.len() {
        match read(fd, &mut buf[done..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "fork server pipe closed",
                ))
            }
            Ok(count) => done += count,
            Err(Errno::EINTR) => continue,
            Err(error) => return Err(nix_to_io(error)),
        }
    }

    Ok(())
}

/// Write the whole of `buf` to `fd`
fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut done = 0;

    while done < buf.len() {
        match write(fd, &buf[done..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "fork server pipe closed",
                ))
            }
            Ok(count) => done += count,
            Err(Errno::EINTR) => continue,
            Err(error) => return Err(nix_to_io(error)),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::decode_status;

    #[test]
    fn test_decode_clean_exit() {
        // Exit code 42, no signal
        let (did_crash, exit_signal, exit_code) = decode_status(42 << 8);

        assert!(!did_crash);
        assert_eq!(exit_signal, 0);
        assert_eq!(exit_code, 42);
    }

    #[test]
    fn test_decode_segfault() {
        let (did_crash, exit_signal, exit_code) = decode_status(11);

        assert!(did_crash);
        assert_eq!(exit_signal, 11);
        assert_eq!(exit_code, 0);
    }

    #[test]
    fn test_decode_zero_status() {
        let (did_crash, exit_signal, exit_code) = decode_status(0);

        assert!(!did_crash);
        assert_eq!(exit_signal, 0);
        assert_eq!(exit_code, 0);
    }
}

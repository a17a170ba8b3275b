//! Stdout capture around calls into native code.
//!
//! Native modules print through C stdio straight to file descriptor 1, so the
//! Rust-level capture used by the test harness never sees that text. A capture
//! swaps descriptor 1 for the write end of a pipe, drains the read end on a
//! helper thread, and puts the original descriptor back once the closure
//! returns (or unwinds).
//!
//! Descriptor 1 is process-wide, so captures are serialized on a global lock.
//! Captures do not nest: calling [`capture_stdout`] from inside a captured
//! closure deadlocks.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::thread::JoinHandle;

use parking_lot::Mutex;

static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

/// Failure to set up or tear down a stdout capture.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to redirect stdout: {0}")]
    Redirect(#[source] io::Error),
    #[error("failed to drain captured stdout: {0}")]
    Drain(#[source] io::Error),
}

/// The value produced by a captured closure plus everything it printed.
#[derive(Debug)]
pub struct Captured<T> {
    pub value: T,
    pub stdout: String,
}

/// Run `f` with descriptor 1 redirected and return what it wrote.
///
/// Both the Rust and the C stdio buffers are flushed before the redirect is
/// installed and again before it is removed, so buffered output lands on the
/// side of the boundary where it was produced. Non-UTF-8 output is decoded
/// lossily.
pub fn capture_stdout<T>(f: impl FnOnce() -> T) -> Result<Captured<T>, CaptureError> {
    let _serial = CAPTURE_LOCK.lock();
    let redirect = Redirect::install().map_err(CaptureError::Redirect)?;
    let value = f();
    let bytes = redirect.finish()?;
    Ok(Captured {
        value,
        stdout: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

struct Redirect {
    saved: Option<OwnedFd>,
    drain: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

impl Redirect {
    fn install() -> io::Result<Self> {
        flush_all();
        let (read_end, write_end) = pipe()?;
        let saved = dup(libc::STDOUT_FILENO)?;
        dup2(write_end.as_raw_fd(), libc::STDOUT_FILENO)?;
        // Descriptor 1 is now the only writer; the drain sees EOF on restore.
        drop(write_end);

        let mut redirect = Self {
            saved: Some(saved),
            drain: None,
        };
        let drain = std::thread::Builder::new()
            .name("modcheck-stdout".to_string())
            .spawn(move || {
                let mut reader = File::from(read_end);
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(buf)
            })?;
        redirect.drain = Some(drain);
        Ok(redirect)
    }

    fn restore(&mut self) -> io::Result<()> {
        flush_all();
        if let Some(saved) = &self.saved {
            dup2(saved.as_raw_fd(), libc::STDOUT_FILENO)?;
            self.saved = None;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<u8>, CaptureError> {
        self.restore().map_err(CaptureError::Redirect)?;
        match self.drain.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| CaptureError::Drain(io::Error::other("drain thread panicked")))?
                .map_err(CaptureError::Drain),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for Redirect {
    fn drop(&mut self) {
        // Joining while descriptor 1 still points at the pipe would never see EOF.
        if self.restore().is_ok()
            && let Some(handle) = self.drain.take()
        {
            let _ = handle.join();
        }
    }
}

fn flush_all() {
    let _ = io::stdout().flush();
    // SAFETY: fflush(NULL) flushes every open C output stream and takes no pointers.
    unsafe {
        libc::fflush(std::ptr::null_mut());
    }
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn dup(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: dup(2) only inspects the descriptor number.
    let copy = unsafe { libc::dup(fd) };
    if copy < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `copy` is a fresh descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(copy) })
}

fn dup2(src: RawFd, dst: RawFd) -> io::Result<()> {
    loop {
        // SAFETY: dup2(2) only inspects the descriptor numbers.
        if unsafe { libc::dup2(src, dst) } >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_raw_descriptor_writes() {
        let captured = capture_stdout(|| {
            let msg = b"raw write through fd 1\n";
            // SAFETY: `msg` is valid for `msg.len()` bytes.
            unsafe { libc::write(libc::STDOUT_FILENO, msg.as_ptr().cast(), msg.len()) }
        })
        .unwrap();
        assert_eq!(captured.value, 23);
        assert!(captured.stdout.contains("raw write through fd 1"));
    }

    #[test]
    fn captures_buffered_c_stdio() {
        let captured = capture_stdout(|| {
            // SAFETY: the format string is NUL-terminated and matches the single int argument.
            unsafe { libc::printf(c"stdio value=%d\n".as_ptr(), 7) }
        })
        .unwrap();
        assert!(captured.value > 0);
        assert!(
            captured.stdout.contains("stdio value=7"),
            "C stdio output should be flushed into the capture: {:?}",
            captured.stdout
        );
    }

    #[test]
    fn stdout_is_restored_after_capture() {
        capture_stdout(|| ()).unwrap();
        let second = capture_stdout(|| {
            let msg = b"second\n";
            // SAFETY: `msg` is valid for `msg.len()` bytes.
            unsafe { libc::write(libc::STDOUT_FILENO, msg.as_ptr().cast(), msg.len()) };
        })
        .unwrap();
        assert!(second.stdout.contains("second"));
        assert!(!second.stdout.contains("raw write through fd 1"));
    }

    #[test]
    fn panicking_closure_restores_descriptor() {
        let result = std::panic::catch_unwind(|| {
            let _ = capture_stdout::<()>(|| panic!("boom"));
        });
        assert!(result.is_err());
        let after = capture_stdout(|| {
            let msg = b"after panic\n";
            // SAFETY: `msg` is valid for `msg.len()` bytes.
            unsafe { libc::write(libc::STDOUT_FILENO, msg.as_ptr().cast(), msg.len()) };
        })
        .unwrap();
        assert!(after.stdout.contains("after panic"));
    }
}

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

/// A character-special buffer device. Reads return whole-word-aligned
/// byte runs; blocking by default, switched non-blocking for the shutdown
/// drain.
pub struct Device {
    file: File,
}

impl Device {
    pub fn open(path: &Path) -> io::Result<Device> {
        Ok(Device { file: File::open(path)? })
    }

    /// Read one buffer, retrying on EINTR. A signal that interrupts the
    /// read is handled by the caller's flag checks, so `None` is returned
    /// to let the main loop run its deferred work.
    pub fn read_buffer(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.file.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Some(0)),
            Err(e) => Err(e),
        }
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = fcntl(&self.file, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(&self.file, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(())
    }

    /// Drain the device until empty; used on shutdown so no buffered
    /// sample is abandoned.
    pub fn drain(&mut self, buf: &mut [u8], mut handle: impl FnMut(&[u8])) -> io::Result<()> {
        self.set_nonblocking()?;
        loop {
            match self.file.read(buf) {
                Ok(0) => return Ok(()),
                Ok(n) => handle(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

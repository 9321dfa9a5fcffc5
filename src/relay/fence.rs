//! Sync fences travelling with buffers

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Synchronization token telling when a buffer's memory is safe to touch.
///
/// A fence is either absent (already satisfied) or an owned file
/// descriptor that becomes readable once signalled. Dropping the fence
/// closes the descriptor.
#[derive(Default)]
pub struct Fence(Option<OwnedFd>);

impl Fence {
    /// A fence that is already satisfied
    pub const fn none() -> Self {
        Fence(None)
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Fence(Some(fd))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Raw descriptor for logging, `-1` when absent
    pub fn raw(&self) -> i32 {
        self.0.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    /// Block until the fence is signalled
    pub fn wait(&self) -> nix::Result<()> {
        let Some(fd) = self.0.as_ref() else {
            return Ok(());
        };
        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
        match fds[0].revents() {
            Some(flags) if flags.contains(PollFlags::POLLNVAL) => Err(Errno::EBADF),
            Some(flags) if flags.contains(PollFlags::POLLERR) => Err(Errno::EIO),
            _ => Ok(()),
        }
    }

    /// Duplicate the underlying descriptor
    pub fn try_clone(&self) -> io::Result<Fence> {
        match self.0.as_ref() {
            Some(fd) => Ok(Fence(Some(fd.try_clone()?))),
            None => Ok(Fence(None)),
        }
    }

    /// Give up the token, closing its descriptor
    pub fn close(self) {}
}

impl From<OwnedFd> for Fence {
    fn from(fd: OwnedFd) -> Self {
        Fence::from_fd(fd)
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fence({})", self.raw())
    }
}

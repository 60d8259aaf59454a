//! Named POSIX shared memory segments.
//!
//! The parent creates the object exclusively under a fresh key, maps it and
//! hands the key to the child, which maps the same object by name. Only the
//! creating side unlinks the name.

use super::key::ShmKey;
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm;
use std::ptr::NonNull;

/// How many fresh keys to try before giving up on allocation.
const MAX_KEY_ATTEMPTS: usize = 64;

/// A mapped, named shared memory object.
///
/// Dropping the segment unmaps it. If this side created the object, the
/// name is unlinked as well, so a stale key seen by a late child fails with
/// [`Error::NotFound`] instead of mapping an unrelated session.
pub struct SharedSegment {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
    owner: bool,
    unlinked: bool,
}

impl SharedSegment {
    /// Allocate a new segment of `size` bytes under a freshly generated key.
    ///
    /// Fresh objects read as zero after `ftruncate`, so the mapping starts
    /// zero-filled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if no key could be reserved or the object
    /// could not be sized or mapped.
    pub fn allocate(size: usize) -> Result<(ShmKey, Self)> {
        for _ in 0..MAX_KEY_ATTEMPTS {
            let key = ShmKey::generate();
            match Self::create_named(key.as_str(), size) {
                Ok(segment) => return Ok((key, segment)),
                Err(Error::System(Errno::EXIST)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::OutOfSpace(format!(
            "no free shared memory key after {MAX_KEY_ATTEMPTS} attempts"
        )))
    }

    /// Create and map a named object exclusively.
    ///
    /// An already existing name is reported as `Error::System(Errno::EXIST)`
    /// so callers can retry with another name.
    pub fn create_named(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::BadArgument("segment size must be greater than 0".into()));
        }

        let fd = shm::open(
            name,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )?;

        let mapped = rustix::fs::ftruncate(&fd, size as u64)
            .map_err(|e| Error::OutOfSpace(format!("ftruncate {name}: {e}")))
            .and_then(|()| map_fd(&fd, size));

        match mapped {
            Ok(ptr) => Ok(Self {
                name: name.to_string(),
                ptr,
                len: size,
                owner: true,
                unlinked: false,
            }),
            Err(e) => {
                let _ = shm::unlink(name);
                Err(e)
            }
        }
    }

    /// Map an existing segment by key (child side).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key is stale.
    pub fn open(key: &ShmKey) -> Result<Self> {
        Self::open_named(key.as_str())
    }

    /// Map an existing named object, sized by the object itself.
    pub fn open_named(name: &str) -> Result<Self> {
        let fd = match shm::open(name, shm::OFlags::RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::NOENT) => return Err(Error::NotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        };

        let size = rustix::fs::fstat(&fd)?.st_size as usize;
        if size == 0 {
            return Err(Error::NotFound(format!("{name} has not been sized yet")));
        }
        let ptr = map_fd(&fd, size)?;

        Ok(Self {
            name: name.to_string(),
            ptr,
            len: size,
            owner: false,
            unlinked: false,
        })
    }

    /// Name the segment was created or opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pointer to the start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this side created (and will unlink) the object.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Remove the name now, keeping the mapping alive.
    ///
    /// Only the owning side unlinks; calling this on a child view or twice
    /// is a no-op.
    pub fn unlink(&mut self) -> Result<()> {
        if !self.owner || self.unlinked {
            return Ok(());
        }
        self.unlinked = true;
        shm::unlink(self.name.as_str())?;
        Ok(())
    }

    /// Unmap and (when owned) unlink, reporting failures instead of logging them.
    pub fn release(mut self) -> Result<()> {
        let unlinked = self.unlink();
        // Drop performs the unmap.
        drop(self);
        unlinked
    }
}

fn map_fd(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    // SAFETY: a fresh shared mapping of a descriptor we hold; nothing else
    // aliases the returned address range in this process.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| Error::OutOfSpace(format!("mmap of {size} bytes: {e}")))?;

    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::OutOfSpace("mmap returned null".into()))
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in map_fd.
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!(name = %self.name, error = %e, "munmap failed");
        }
        if self.owner && !self.unlinked {
            if let Err(e) = shm::unlink(self.name.as_str()) {
                tracing::warn!(name = %self.name, error = %e, "shm unlink failed");
            }
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

// SAFETY: the mapping is process-wide and every cross-process field is
// accessed through atomics or under the gate discipline.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_open() {
        let (key, parent) = SharedSegment::allocate(8192).unwrap();
        assert_eq!(parent.len(), 8192);
        assert!(parent.is_owner());

        let child = SharedSegment::open(&key).unwrap();
        assert_eq!(child.len(), 8192);
        assert!(!child.is_owner());

        // SAFETY: both mappings are live and 8192 bytes long.
        unsafe {
            assert_eq!(*child.as_ptr().add(4000), 0);
            *parent.as_ptr().add(4000) = 0x5a;
            assert_eq!(*child.as_ptr().add(4000), 0x5a);
        }
    }

    #[test]
    fn test_open_stale_key_is_not_found() {
        let (key, parent) = SharedSegment::allocate(4096).unwrap();
        parent.release().unwrap();

        match SharedSegment::open(&key) {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_child_drop_does_not_unlink() {
        let (key, _parent) = SharedSegment::allocate(4096).unwrap();
        let child = SharedSegment::open(&key).unwrap();
        drop(child);
        assert!(SharedSegment::open(&key).is_ok());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            SharedSegment::create_named("/flk_test_zero_m", 0),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn test_exclusive_create() {
        let (key, _parent) = SharedSegment::allocate(4096).unwrap();
        assert!(matches!(
            SharedSegment::create_named(key.as_str(), 4096),
            Err(Error::System(Errno::EXIST))
        ));
    }

    #[test]
    fn test_unlink_is_idempotent() {
        let (_key, mut parent) = SharedSegment::allocate(4096).unwrap();
        parent.unlink().unwrap();
        parent.unlink().unwrap();
    }
}

//! Named POSIX shared memory segments
//!
//! [`NamedShm`] is the raw mapping of one named object; [`SharedSegment`]
//! formats that mapping as an [`Arena`] for the cache.

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::unix::fs::MetadataExt;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::shm::arena::{self, Arena};

/// Turns a caller supplied name into a portable shm object name.
///
/// A leading `/` is added when missing; any other `/` is rejected.
pub fn object_name(name: &str) -> Result<String> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() {
        return Err(CacheError::InvalidConfig(
            "segment name must not be empty".to_string(),
        ));
    }
    if bare.contains('/') || bare.contains('\0') {
        return Err(CacheError::InvalidConfig(format!(
            "segment name {name:?} must not contain '/' or NUL"
        )));
    }
    Ok(format!("/{bare}"))
}

fn shared_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP | Mode::S_IROTH | Mode::S_IWOTH
}

fn map_shared<F: AsFd>(fd: F, length: NonZeroUsize) -> nix::Result<NonNull<u8>> {
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )?
    };
    Ok(ptr.cast())
}

// == Named Mapping ==
/// A named shm object mapped read-write into this process.
///
/// Dropping unmaps the memory but leaves the name in place; only
/// [`NamedShm::unlink`] removes it from the OS namespace.
pub(crate) struct NamedShm {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
    /// Device and inode of the mapped object
    identity: (u64, u64),
}

fn identity_of(file: &File) -> std::io::Result<(u64, u64)> {
    let meta = file.metadata()?;
    Ok((meta.dev(), meta.ino()))
}

impl NamedShm {
    /// Creates a new object of `len` bytes. Fails if the name is taken.
    pub(crate) fn create(name: &str, len: usize) -> Result<NamedShm> {
        let create_err = |source: Errno| CacheError::SegmentCreate {
            name: name.to_string(),
            source: source.into(),
        };
        let length = NonZeroUsize::new(len).ok_or_else(|| {
            CacheError::InvalidConfig(format!("{name}: size must be greater than zero"))
        })?;

        let file = File::from(
            shm_open(
                name,
                OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                shared_mode(),
            )
            .map_err(create_err)?,
        );
        let identity = match identity_of(&file) {
            Ok(identity) => identity,
            Err(source) => {
                _ = shm_unlink(name);
                return Err(CacheError::SegmentCreate {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let mapped = ftruncate(&file, len as libc::off_t).and_then(|()| map_shared(&file, length));
        match mapped {
            Ok(ptr) => Ok(NamedShm {
                name: name.to_string(),
                ptr,
                len,
                identity,
            }),
            Err(errno) => {
                _ = shm_unlink(name);
                Err(create_err(errno))
            }
        }
    }

    /// Maps an existing object at its current size.
    pub(crate) fn open(name: &str) -> Result<NamedShm> {
        let open_err = |source: Errno| CacheError::SegmentOpen {
            name: name.to_string(),
            source: source.into(),
        };

        let file = File::from(shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(open_err)?);
        let meta = file.metadata().map_err(|source| CacheError::SegmentOpen {
            name: name.to_string(),
            source,
        })?;
        let len = meta.len() as usize;
        let identity = (meta.dev(), meta.ino());
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| CacheError::InvalidSegment(format!("{name} is empty")))?;
        let ptr = map_shared(&file, length).map_err(open_err)?;

        Ok(NamedShm {
            name: name.to_string(),
            ptr,
            len,
            identity,
        })
    }

    /// Removes `name` from the OS namespace. Missing objects are not an error.
    pub(crate) fn remove(name: &str) {
        match shm_unlink(name) {
            Ok(()) => debug!(name, "Removed shared memory object"),
            Err(Errno::ENOENT) => {}
            Err(err) => warn!(name, %err, "Failed to remove shared memory object"),
        }
    }

    /// Removes this object's name, unless the name has since been given to
    /// a newer object.
    pub(crate) fn unlink(&self) {
        if self.is_named() {
            Self::remove(&self.name);
        } else {
            debug!(name = %self.name, "Name now refers to another object, leaving it");
        }
    }

    /// Returns true while the name still refers to the mapped object.
    pub(crate) fn is_named(&self) -> bool {
        shm_open(self.name.as_str(), OFlag::O_RDONLY, Mode::empty())
            .map(File::from)
            .ok()
            .and_then(|file| identity_of(&file).ok())
            == Some(self.identity)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for NamedShm {
    fn drop(&mut self) {
        unsafe {
            _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

// The mapping is plain shared memory; every access to its contents goes
// through the process-shared lock.
unsafe impl Send for NamedShm {}
unsafe impl Sync for NamedShm {}

// == Shared Segment ==
/// The named region holding the cache arena.
pub struct SharedSegment {
    shm: NamedShm,
}

impl SharedSegment {
    /// Creates a fresh segment, replacing any stale object left under `name`
    /// by an earlier session that did not shut down cleanly.
    pub fn create(name: &str, size: usize) -> Result<SharedSegment> {
        if size < arena::min_region_size() {
            return Err(CacheError::InvalidConfig(format!(
                "segment size {size} is below the minimum of {} bytes",
                arena::min_region_size()
            )));
        }

        NamedShm::remove(name);
        let segment = SharedSegment {
            shm: NamedShm::create(name, size)?,
        };
        segment.arena().format();
        debug!(name, size, "Created shared memory segment");
        Ok(segment)
    }

    /// Attaches to a segment created by another handle or process.
    pub fn open(name: &str) -> Result<SharedSegment> {
        let segment = SharedSegment {
            shm: NamedShm::open(name)?,
        };
        if !segment.arena().is_formatted() {
            return Err(CacheError::InvalidSegment(format!(
                "{name} does not hold a hostname cache"
            )));
        }
        debug!(name, size = segment.size(), "Attached shared memory segment");
        Ok(segment)
    }

    /// Unlinks the name without touching any mapping.
    pub fn remove(name: &str) {
        NamedShm::remove(name);
    }

    pub fn arena(&self) -> Arena {
        // SAFETY: mmap returns page-aligned memory that stays mapped until
        // `self.shm` is dropped; arenas handed out never outlive `self`.
        unsafe { Arena::from_raw(self.shm.as_ptr(), self.shm.len()) }
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn size(&self) -> usize {
        self.shm.len()
    }

    /// Free bytes left in the arena.
    pub fn free_bytes(&self) -> usize {
        self.arena().free_bytes()
    }

    /// Unlinks the segment name and unmaps it from this process.
    pub fn release(self) {
        self.shm.unlink();
    }
}

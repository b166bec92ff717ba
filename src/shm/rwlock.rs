//! Named, process-shared reader-writer lock
//!
//! The lock is a `pthread_rwlock_t` initialised with
//! `PTHREAD_PROCESS_SHARED` inside its own named shm object, so it lives in
//! the OS namespace independently of the segment it guards.

use std::mem::{size_of, MaybeUninit};
use std::ptr::addr_of_mut;
use std::time::Duration;

use nix::errno::Errno;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::shm::segment::NamedShm;

const LOCK_MAGIC: [u8; 8] = *b"HOSTCLK1";

#[repr(C)]
struct LockRegion {
    magic: [u8; 8],
    rwlock: libc::pthread_rwlock_t,
}

// glibc exports the timed variants but the libc crate only binds them on a
// few other targets.
#[cfg(target_os = "linux")]
extern "C" {
    fn pthread_rwlock_timedrdlock(
        lock: *mut libc::pthread_rwlock_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
    fn pthread_rwlock_timedwrlock(
        lock: *mut libc::pthread_rwlock_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

/// Lock object name for a given segment name.
pub fn lock_name(segment_name: &str) -> String {
    format!("{segment_name}_mutex")
}

fn check(rc: libc::c_int) -> Result<()> {
    match rc {
        0 => Ok(()),
        rc => Err(CacheError::Lock(Errno::from_raw(rc))),
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Shared,
    Exclusive,
}

// == Named RwLock ==
/// A reader-writer lock shared by every process that opens the same name.
///
/// Readers run concurrently with each other; a writer excludes everyone.
/// Acquisition blocks indefinitely unless a timeout is passed, so a process
/// dying while holding the lock stalls every other attached process.
pub struct NamedRwLock {
    shm: NamedShm,
}

impl NamedRwLock {
    /// Creates and initialises the lock, replacing any stale object.
    pub fn create(name: &str) -> Result<NamedRwLock> {
        NamedShm::remove(name);
        let shm = NamedShm::create(name, size_of::<LockRegion>())?;
        let region = shm.as_ptr().cast::<LockRegion>().as_ptr();

        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_rwlockattr_t>::uninit();
            check(libc::pthread_rwlockattr_init(attr.as_mut_ptr()))?;
            let mut rc =
                libc::pthread_rwlockattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            if rc == 0 {
                rc = libc::pthread_rwlock_init(addr_of_mut!((*region).rwlock), attr.as_ptr());
            }
            libc::pthread_rwlockattr_destroy(attr.as_mut_ptr());
            if let Err(err) = check(rc) {
                shm.unlink();
                return Err(err);
            }
            (*region).magic = LOCK_MAGIC;
        }

        debug!(name, "Created process-shared lock");
        Ok(NamedRwLock { shm })
    }

    /// Opens a lock created by another handle or process.
    pub fn open(name: &str) -> Result<NamedRwLock> {
        let shm = NamedShm::open(name)?;
        let valid = shm.len() >= size_of::<LockRegion>()
            && unsafe { (*shm.as_ptr().cast::<LockRegion>().as_ptr()).magic == LOCK_MAGIC };
        if !valid {
            return Err(CacheError::InvalidSegment(format!(
                "{name} does not hold a cache lock"
            )));
        }
        Ok(NamedRwLock { shm })
    }

    /// Unlinks the name without touching any mapping.
    pub fn remove(name: &str) {
        NamedShm::remove(name);
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Acquires shared mode.
    pub fn read(&self, timeout: Option<Duration>) -> Result<LockGuard<'_>> {
        self.acquire(Mode::Shared, timeout)
    }

    /// Acquires exclusive mode.
    pub fn write(&self, timeout: Option<Duration>) -> Result<LockGuard<'_>> {
        self.acquire(Mode::Exclusive, timeout)
    }

    /// Removes the lock's name and unmaps it from this process.
    ///
    /// The pthread object itself is left alone: other processes may still
    /// hold or wait on it, and its memory goes away with the last mapping.
    pub fn destroy(self) {
        self.shm.unlink();
    }

    fn raw(&self) -> *mut libc::pthread_rwlock_t {
        let region = self.shm.as_ptr().cast::<LockRegion>().as_ptr();
        unsafe { addr_of_mut!((*region).rwlock) }
    }

    fn acquire(&self, mode: Mode, timeout: Option<Duration>) -> Result<LockGuard<'_>> {
        let lock = self.raw();
        let rc = match timeout {
            #[cfg(target_os = "linux")]
            Some(timeout) => {
                let deadline = deadline_after(timeout);
                unsafe {
                    match mode {
                        Mode::Shared => pthread_rwlock_timedrdlock(lock, &deadline),
                        Mode::Exclusive => pthread_rwlock_timedwrlock(lock, &deadline),
                    }
                }
            }
            _ => unsafe {
                match mode {
                    Mode::Shared => libc::pthread_rwlock_rdlock(lock),
                    Mode::Exclusive => libc::pthread_rwlock_wrlock(lock),
                }
            },
        };

        match rc {
            0 => Ok(LockGuard { lock: self }),
            libc::ETIMEDOUT => Err(CacheError::LockTimeout(timeout.unwrap_or_default())),
            rc => Err(CacheError::Lock(Errno::from_raw(rc))),
        }
    }
}

/// Absolute `CLOCK_REALTIME` deadline, as the timed pthread calls expect.
#[cfg(target_os = "linux")]
fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    let secs = (now.tv_sec as u64)
        .saturating_add(timeout.as_secs())
        .saturating_add(nanos / 1_000_000_000);

    let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
    deadline.tv_sec = secs.min(libc::time_t::MAX as u64) as libc::time_t;
    deadline.tv_nsec = (nanos % 1_000_000_000) as _;
    deadline
}

// == Guard ==
/// Releases the lock on drop, whichever mode it was taken in.
pub struct LockGuard<'a> {
    lock: &'a NamedRwLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_rwlock_unlock(self.lock.raw());
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::unique_segment_name;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn create_lock() -> NamedRwLock {
        NamedRwLock::create(&lock_name(&unique_segment_name())).unwrap()
    }

    #[test]
    fn test_lock_name_suffix() {
        assert_eq!(lock_name("/hosts"), "/hosts_mutex");
    }

    #[test]
    fn test_readers_share() {
        let lock = create_lock();

        let first = lock.read(None).unwrap();
        let second = lock.read(None).unwrap();
        drop((first, second));

        lock.destroy();
    }

    #[test]
    fn test_writer_excludes_other_handle() {
        let lock = create_lock();
        let other = NamedRwLock::open(lock.name()).unwrap();
        let released = Arc::new(AtomicBool::new(false));

        let guard = lock.write(None).unwrap();
        let waiter = {
            let released = released.clone();
            thread::spawn(move || {
                let _guard = other.write(None).unwrap();
                assert!(released.load(Ordering::SeqCst), "writer entered while locked");
            })
        };

        thread::sleep(Duration::from_millis(100));
        released.store(true, Ordering::SeqCst);
        drop(guard);
        waiter.join().unwrap();

        lock.destroy();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_timed_acquire_gives_up() {
        let lock = create_lock();
        let other = NamedRwLock::open(lock.name()).unwrap();

        let guard = lock.write(None).unwrap();
        let result = thread::spawn(move || {
            let result = other.read(Some(Duration::from_millis(50))).map(drop);
            result
        })
        .join()
        .unwrap();
        drop(guard);

        assert!(matches!(result, Err(CacheError::LockTimeout(_))));
        lock.destroy();
    }

    #[test]
    fn test_open_missing_lock_fails() {
        assert!(NamedRwLock::open(&lock_name(&unique_segment_name())).is_err());
    }

    #[test]
    fn test_destroy_leaves_other_handles_usable() {
        let lock = create_lock();
        let other = NamedRwLock::open(lock.name()).unwrap();

        lock.destroy();

        drop(other.write(None).unwrap());
        drop(other.read(None).unwrap());
    }

    #[test]
    fn test_destroy_unlinks_name() {
        let lock = create_lock();
        let name = lock.name().to_string();

        lock.destroy();

        assert!(NamedRwLock::open(&name).is_err());
    }
}

use std::{
    os::fd::OwnedFd,
    ptr::null_mut,
    sync::atomic::{AtomicU32, Ordering},
    thread,
    time::{Duration, Instant},
};

use rustix::{
    fs::{fstat, ftruncate, Mode},
    io::Errno,
    mm::{mmap, munmap, MapFlags, ProtFlags},
    shm::{self, OFlags},
};

use crate::{Error, MAGIC_VALUE};

/// Marker for types that may live inside a shared region: `#[repr(C)]`,
/// no pointers into process-local memory, no drop glue that must run.
pub unsafe trait ShmSafe {}

macro_rules! impl_shm_safe {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl ShmSafe for $t {})*
    };
}

impl_shm_safe!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, usize, isize, bool, ());

unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}

/// The payload slot starts at the first boundary of this alignment past
/// the control block.
pub const PAYLOAD_ALIGN: usize = 64;

const MAX_BACKOFF: Duration = Duration::from_millis(100);

#[repr(C)]
struct RegionHeader {
    /// Ready flag, written last during initialization.
    magic: AtomicU32,
    _pad: u32,
    payload_bytes: u64,
}

#[repr(C)]
struct RegionContents<T> {
    header: RegionHeader,
    block: T,
}

/// Byte offset of the payload slot within a region whose control block is
/// `T`.
pub fn payload_offset<T>() -> usize {
    (size_of::<RegionContents<T>>() + PAYLOAD_ALIGN - 1) & !(PAYLOAD_ALIGN - 1)
}

/// One mapped named shared-memory region: control block of type `T`
/// followed by an untyped payload slot. The creator owns the OS name and
/// unlinks it on drop; openers only unmap.
pub struct SharedRegion<T> {
    is_owner: bool,
    name: String,
    len: usize,
    memory: *mut RegionContents<T>,
}

// The mapped memory is only ever accessed through `T`'s own
// synchronization (see the `Mutex`/`Condvar` impls in `sync`), the same
// guarantee `ShmSafe` already certifies for cross-process sharing.
unsafe impl<T: ShmSafe> Send for SharedRegion<T> {}
unsafe impl<T: ShmSafe> Sync for SharedRegion<T> {}

impl<T: ShmSafe> SharedRegion<T> {
    /// Creates the named region and initializes its control block in
    /// place. `init` must fully initialize `*mut T`; the ready flag is
    /// written after it returns, so other processes never observe a
    /// half-built block.
    ///
    /// The name must not already exist; stale residue is removed by the
    /// caller once it has been confirmed dead.
    pub fn create(
        name: &str,
        payload_bytes: usize,
        init: impl FnOnce(*mut T),
    ) -> Result<Self, Error> {
        let fd = shm::open(
            name,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| match e {
            Errno::EXIST => Error::AddressInUse(name.to_owned()),
            e => Error::AllocFailed(name.to_owned(), e),
        })?;

        let len = payload_offset::<T>() + payload_bytes;
        let mapped = ftruncate(&fd, len as u64).and_then(|()| unsafe { Self::mmap(&fd, len) });
        let memory = match mapped {
            Ok(memory) => memory,
            Err(e) => {
                let _ = shm::unlink(name);
                return Err(Error::AllocFailed(name.to_owned(), e));
            }
        };

        // The region is zero-filled by ftruncate; only the non-zero parts
        // need explicit construction.
        unsafe {
            (*memory).header.payload_bytes = payload_bytes as u64;
            init(&raw mut (*memory).block);
            (*memory).header.magic.store(MAGIC_VALUE, Ordering::Release);
        }

        Ok(Self {
            is_owner: true,
            name: name.to_owned(),
            len,
            memory,
        })
    }

    /// Maps an existing region without waiting for its ready flag. Used
    /// by the sink to inspect residue from earlier runs.
    pub(crate) fn open_residue(name: &str) -> Result<Self, Error> {
        let fd = shm::open(name, OFlags::RDWR, Mode::RUSR | Mode::WUSR).map_err(|e| match e {
            Errno::NOENT => Error::NotFound(name.to_owned()),
            e => Error::AllocFailed(name.to_owned(), e),
        })?;

        let len = fstat(&fd)
            .map_err(|e| Error::AllocFailed(name.to_owned(), e))?
            .st_size as usize;
        if len < payload_offset::<T>() {
            // Creator has not finished sizing the region.
            return Err(Error::NotFound(name.to_owned()));
        }

        let memory =
            unsafe { Self::mmap(&fd, len) }.map_err(|e| Error::AllocFailed(name.to_owned(), e))?;

        Ok(Self {
            is_owner: false,
            name: name.to_owned(),
            len,
            memory,
        })
    }

    /// Opens the named region, retrying with exponential backoff until it
    /// exists and has completed initialization.
    pub fn open_timeout(name: &str, limit: Duration) -> Result<Self, Error> {
        let start = Instant::now();
        let mut backoff = Duration::from_millis(1);

        loop {
            match Self::open_residue(name) {
                Ok(region) if region.is_ready() => return Ok(region),
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            if start.elapsed() >= limit {
                return Err(Error::Timeout(name.to_owned()));
            }

            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Whether initialization of the region has completed.
    pub fn is_ready(&self) -> bool {
        unsafe { (*self.memory).header.magic.load(Ordering::Acquire) == MAGIC_VALUE }
    }

    pub fn get(&self) -> *mut T {
        unsafe { &raw mut (*self.memory).block }
    }

    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.memory.cast::<u8>().add(payload_offset::<T>()) }
    }

    pub fn payload_len(&self) -> usize {
        self.len - payload_offset::<T>()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    unsafe fn mmap(fd: &OwnedFd, len: usize) -> Result<*mut RegionContents<T>, Errno> {
        Ok(mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
        .cast())
    }
}

impl<T> Drop for SharedRegion<T> {
    fn drop(&mut self) {
        if self.is_owner {
            let _ = shm::unlink(&self.name);
        }
        unsafe {
            let _ = munmap(self.memory.cast(), self.len);
        }
    }
}

/// Unlinks the named region, ignoring absent objects.
pub fn remove_region(name: &str) {
    let _ = shm::unlink(name);
}

#[cfg(test)]
mod test {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("/fabric_shm_{tag}_{}", std::process::id())
    }

    #[test]
    fn create_then_open() {
        let name = unique("roundtrip");
        let region = SharedRegion::<u64>::create(&name, 32, |block| unsafe {
            block.write(0xfeed);
        })
        .unwrap();
        assert!(region.is_ready());
        assert_eq!(region.payload_len(), 32);

        let opened = SharedRegion::<u64>::open_timeout(&name, Duration::from_secs(1)).unwrap();
        assert_eq!(unsafe { *opened.get() }, 0xfeed);
        assert_eq!(opened.payload_len(), 32);
    }

    #[test]
    fn owner_unlinks_on_drop() {
        let name = unique("unlink");
        let region = SharedRegion::<u32>::create(&name, 0, |block| unsafe {
            block.write(1);
        })
        .unwrap();
        drop(region);

        assert!(matches!(
            SharedRegion::<u32>::open_residue(&name),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let name = unique("dup");
        let _region = SharedRegion::<u32>::create(&name, 0, |block| unsafe {
            block.write(1);
        })
        .unwrap();

        assert!(matches!(
            SharedRegion::<u32>::create(&name, 0, |_| {}),
            Err(Error::AddressInUse(_))
        ));
    }

    #[test]
    fn open_times_out_on_missing_region() {
        let name = unique("missing");
        let start = Instant::now();
        let result = SharedRegion::<u32>::open_timeout(&name, Duration::from_millis(20));
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn payload_offset_is_aligned() {
        assert_eq!(payload_offset::<u8>() % PAYLOAD_ALIGN, 0);
        assert_eq!(payload_offset::<[u64; 33]>() % PAYLOAD_ALIGN, 0);
    }
}

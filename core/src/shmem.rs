//! The shared publication region
//!
//! A named POSIX shared memory region exposing the supervisor's published
//! state triple and the live parameter array to co-located readers. The
//! layout is a fixed `repr(C)` header followed by `num_params` doubles:
//!
//! ```text
//! | sem | mcp_state | op_mode | flight_leg | num_params | params[..] |
//! ```
//!
//! The embedded semaphore is process-shared and initialized to 1. Every
//! access, in-process or out-of-process, must go through [SharedRegion::lock];
//! the returned guard releases the semaphore on every exit path.
use std::io;
use std::mem::size_of;
use std::os::fd::AsRawFd;

use anyhow::anyhow;
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{ErrorKind, ResultExt, TypedResult};
use crate::STATE_HALTED;

/// Well-known name of the publication region
pub const DEFAULT_SHM_NAME: &str = "/mcp_shm";

#[repr(C)]
struct RegionHeader {
    sem: libc::sem_t,
    mcp_state: u32,
    op_mode: u32,
    flight_leg: u32,
    num_params: u32,
}

/// A mapped publication region
///
/// The creating side owns the name: dropping it destroys the semaphore and
/// unlinks the region. Handles obtained through [SharedRegion::open] only
/// unmap.
pub struct SharedRegion {
    map: MmapMut,
    name: String,
    owner: bool,
}

impl SharedRegion {
    fn size_for(num_params: u32) -> usize {
        size_of::<RegionHeader>() + num_params as usize * size_of::<f64>()
    }

    /// Creates the region, sizing it for `num_params` parameters
    ///
    /// Creation is exclusive; a leftover region under the same name is
    /// truncated and reinitialized. The size is fixed for the lifetime of
    /// the process.
    pub fn create(name: &str, num_params: u32) -> TypedResult<Self> {
        let mode = Mode::from_bits_truncate(0o666);
        let fd = match shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode) {
            Ok(fd) => fd,
            Err(Errno::EEXIST) => {
                debug!("shared memory region {name} already exists, reinitializing it");
                shm_open(name, OFlag::O_RDWR | OFlag::O_TRUNC, mode).typ(ErrorKind::Io)?
            }
            Err(e) => {
                return Err(anyhow!("unable to open shared memory region {name}: {e}"))
                    .typ(ErrorKind::Io)
            }
        };

        let size = Self::size_for(num_params);
        ftruncate(&fd, size as libc::off_t).typ(ErrorKind::Io)?;
        let map = unsafe { MmapOptions::new().len(size).map_mut(fd.as_raw_fd()) }
            .typ(ErrorKind::Io)?;

        let region = Self {
            map,
            name: name.to_string(),
            owner: true,
        };

        unsafe {
            let header = region.header();
            if libc::sem_init(&mut (*header).sem, 1, 1) != 0 {
                return Err(io::Error::last_os_error()).typ(ErrorKind::LockFailed);
            }
            (*header).mcp_state = STATE_HALTED;
            (*header).op_mode = 0;
            (*header).flight_leg = 0;
            (*header).num_params = num_params;
        }

        Ok(region)
    }

    /// Opens an existing region as a co-located reader/writer
    pub fn open(name: &str) -> TypedResult<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).typ(ErrorKind::Io)?;

        // The full size is not known until the header has been read, so map
        // the header alone first (the original reader library does the same
        // two-step mapping).
        let probe = unsafe {
            MmapOptions::new()
                .len(size_of::<RegionHeader>())
                .map(fd.as_raw_fd())
        }
        .typ(ErrorKind::Io)?;
        let num_params = unsafe { (*(probe.as_ptr() as *const RegionHeader)).num_params };
        drop(probe);

        let size = Self::size_for(num_params);
        let map = unsafe { MmapOptions::new().len(size).map_mut(fd.as_raw_fd()) }
            .typ(ErrorKind::Io)?;

        Ok(Self {
            map,
            name: name.to_string(),
            owner: false,
        })
    }

    /// Acquires the region semaphore
    pub fn lock(&self) -> TypedResult<RegionGuard> {
        loop {
            let rc = unsafe { libc::sem_wait(&mut (*self.header()).sem) };
            if rc == 0 {
                return Ok(RegionGuard { region: self });
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err).typ(ErrorKind::LockFailed);
            }
        }
    }

    /// Name the region was created or opened under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of parameter slots; fixed at map time
    pub fn num_params(&self) -> u32 {
        ((self.map.len() - size_of::<RegionHeader>()) / size_of::<f64>()) as u32
    }

    // The mapping is shared with other processes, so all access goes through
    // raw pointers under the embedded semaphore.
    fn header(&self) -> *mut RegionHeader {
        self.map.as_ptr() as *mut RegionHeader
    }

    fn params(&self) -> *mut f64 {
        unsafe { self.map.as_ptr().add(size_of::<RegionHeader>()) as *mut f64 }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owner {
            if unsafe { libc::sem_destroy(&mut (*self.header()).sem) } != 0 {
                error!(
                    "error destroying region semaphore: {}",
                    io::Error::last_os_error()
                );
            }
            if let Err(e) = shm_unlink(self.name.as_str()) {
                error!("error unlinking shared memory region {}: {e}", self.name);
            }
        }
    }
}

/// Scoped access to the locked region; releases the semaphore on drop
pub struct RegionGuard<'a> {
    region: &'a SharedRegion,
}

impl RegionGuard<'_> {
    pub fn mcp_state(&self) -> u32 {
        unsafe { (*self.region.header()).mcp_state }
    }

    pub fn set_mcp_state(&mut self, state: u32) {
        unsafe { (*self.region.header()).mcp_state = state }
    }

    pub fn op_mode(&self) -> u32 {
        unsafe { (*self.region.header()).op_mode }
    }

    pub fn set_op_mode(&mut self, mode: u32) {
        unsafe { (*self.region.header()).op_mode = mode }
    }

    pub fn flight_leg(&self) -> u32 {
        unsafe { (*self.region.header()).flight_leg }
    }

    pub fn set_flight_leg(&mut self, leg: u32) {
        unsafe { (*self.region.header()).flight_leg = leg }
    }

    pub fn num_params(&self) -> u32 {
        unsafe { (*self.region.header()).num_params }
    }

    /// Reads a parameter slot; `index` is zero-based
    pub fn param(&self, index: usize) -> Option<f64> {
        if index < self.num_params() as usize {
            Some(unsafe { *self.region.params().add(index) })
        } else {
            None
        }
    }

    /// Writes a parameter slot; `index` is zero-based
    pub fn set_param(&mut self, index: usize, value: f64) -> bool {
        if index < self.num_params() as usize {
            unsafe { *self.region.params().add(index) = value };
            true
        } else {
            false
        }
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        if unsafe { libc::sem_post(&mut (*self.region.header()).sem) } != 0 {
            error!(
                "error releasing region semaphore: {}",
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/mcp_shm_test_{}_{tag}", std::process::id())
    }

    #[test]
    fn create_and_read_back() {
        let name = unique_name("create");
        let region = SharedRegion::create(&name, 4).unwrap();
        assert_eq!(region.num_params(), 4);

        let mut guard = region.lock().unwrap();
        assert_eq!(guard.mcp_state(), STATE_HALTED);
        assert_eq!(guard.num_params(), 4);
        guard.set_mcp_state(5);
        guard.set_flight_leg(1);
        guard.set_op_mode(2);
        assert!(guard.set_param(0, 1.25));
        drop(guard);

        let guard = region.lock().unwrap();
        assert_eq!(guard.mcp_state(), 5);
        assert_eq!(guard.flight_leg(), 1);
        assert_eq!(guard.op_mode(), 2);
        assert_eq!(guard.param(0), Some(1.25));
        assert_eq!(guard.param(4), None);
    }

    #[test]
    fn external_reader_sees_writes() {
        let name = unique_name("reader");
        let region = SharedRegion::create(&name, 2).unwrap();
        region.lock().unwrap().set_mcp_state(3);

        let reader = SharedRegion::open(&name).unwrap();
        assert_eq!(reader.num_params(), 2);
        assert_eq!(reader.lock().unwrap().mcp_state(), 3);

        region.lock().unwrap().set_param(1, 9.5);
        assert_eq!(reader.lock().unwrap().param(1), Some(9.5));
    }

    #[test]
    fn existing_region_is_reinitialized() {
        let name = unique_name("reinit");
        {
            let first = SharedRegion::create(&name, 2).unwrap();
            first.lock().unwrap().set_mcp_state(7);
            // Leak the mapping so the name survives, as after a crash.
            std::mem::forget(first);
        }
        let second = SharedRegion::create(&name, 3).unwrap();
        assert_eq!(second.num_params(), 3);
        assert_eq!(second.lock().unwrap().mcp_state(), STATE_HALTED);
    }
}

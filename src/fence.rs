//! Present fences as owned sync-file descriptors
//!
//! A `Fence` is move-only: handing it to the estimator or the applied-config
//! queue transfers ownership, and the descriptor closes when it is dropped.

use crate::{Error, Result};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use tracing::trace;

/// Owned sync-file descriptor
#[derive(Debug)]
pub struct Fence {
    fd: OwnedFd,
}

impl Fence {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Explicit duplicate for the rare case where two owners are required
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    pub fn into_inner(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for Fence {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Fence {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Observed state of a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// Not signaled yet
    Pending,
    /// The descriptor is not a usable sync file
    Invalid,
    /// Signaled at the given monotonic time in nanoseconds
    Signaled(i64),
}

/// Queries fence state; implemented over the kernel sync-file ABI and by
/// scripted doubles in tests
pub trait FenceOracle: Send + Sync {
    fn status(&self, fence: &Fence) -> FenceStatus;

    /// Block until the fence signals or `timeout_ms` elapses
    fn wait(&self, fence: &Fence, timeout_ms: u64) -> Result<()>;
}

const SYNC_IOC_MAGIC: u32 = b'>' as u32;

#[repr(C)]
#[derive(Default)]
struct SyncFileInfo {
    name: [u8; 32],
    status: i32,
    flags: u32,
    num_fences: u32,
    pad: u32,
    sync_fence_info: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SyncFenceInfo {
    obj_name: [u8; 32],
    driver_name: [u8; 32],
    status: i32,
    flags: u32,
    timestamp_ns: u64,
}

impl Default for SyncFenceInfo {
    fn default() -> Self {
        Self {
            obj_name: [0; 32],
            driver_name: [0; 32],
            status: 0,
            flags: 0,
            timestamp_ns: 0,
        }
    }
}

// _IOWR('>', 4, struct sync_file_info)
const SYNC_IOC_FILE_INFO: u32 = (3 << 30)
    | ((std::mem::size_of::<SyncFileInfo>() as u32) << 16)
    | (SYNC_IOC_MAGIC << 8)
    | 4;

/// Fence oracle backed by `poll(2)` and `SYNC_IOC_FILE_INFO`
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncFileOracle;

impl SyncFileOracle {
    fn file_info(fd: RawFd, info: &mut SyncFileInfo) -> std::io::Result<()> {
        // SAFETY: info is a live, correctly sized sync_file_info
        let ret = unsafe { libc::ioctl(fd, SYNC_IOC_FILE_INFO as _, info as *mut SyncFileInfo) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

impl FenceOracle for SyncFileOracle {
    fn status(&self, fence: &Fence) -> FenceStatus {
        let fd = fence.as_raw_fd();
        let mut info = SyncFileInfo::default();
        if let Err(e) = Self::file_info(fd, &mut info) {
            trace!(fd, error = %e, "sync file info failed");
            return FenceStatus::Invalid;
        }
        match info.status {
            0 => return FenceStatus::Pending,
            s if s < 0 => return FenceStatus::Invalid,
            _ => {}
        }

        let mut fences = vec![SyncFenceInfo::default(); info.num_fences as usize];
        if fences.is_empty() {
            return FenceStatus::Invalid;
        }
        let mut detail = SyncFileInfo {
            num_fences: info.num_fences,
            sync_fence_info: fences.as_mut_ptr() as u64,
            ..Default::default()
        };
        if Self::file_info(fd, &mut detail).is_err() {
            return FenceStatus::Invalid;
        }
        let signal_time = fences
            .iter()
            .map(|f| f.timestamp_ns as i64)
            .max()
            .unwrap_or(0);
        FenceStatus::Signaled(signal_time)
    }

    fn wait(&self, fence: &Fence, timeout_ms: u64) -> Result<()> {
        let mut pfd = libc::pollfd {
            fd: fence.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = timeout_ms.min(i32::MAX as u64) as libc::c_int;
        loop {
            // SAFETY: pfd points at one valid pollfd
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
            if ret > 0 {
                if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                    return Err(Error::Fence(format!("fence fd {} in error state", pfd.fd)));
                }
                return Ok(());
            }
            if ret == 0 {
                return Err(Error::FenceTimeout(timeout_ms));
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A real descriptor with no sync-file semantics behind it
    pub fn dummy_fence() -> Fence {
        let file = std::fs::File::open("/dev/null").expect("open /dev/null");
        Fence::new(OwnedFd::from(file))
    }

    /// Oracle whose answers are scripted per raw descriptor
    pub struct ScriptedOracle {
        states: Mutex<HashMap<RawFd, FenceStatus>>,
        pub wait_ok: Mutex<bool>,
    }

    impl ScriptedOracle {
        pub fn new() -> Self {
            Self {
                states: Mutex::new(HashMap::new()),
                wait_ok: Mutex::new(true),
            }
        }

        pub fn set(&self, fence: &Fence, status: FenceStatus) {
            self.states.lock().unwrap().insert(fence.as_raw_fd(), status);
        }
    }

    impl FenceOracle for ScriptedOracle {
        fn status(&self, fence: &Fence) -> FenceStatus {
            self.states
                .lock()
                .unwrap()
                .get(&fence.as_raw_fd())
                .copied()
                .unwrap_or(FenceStatus::Pending)
        }

        fn wait(&self, _fence: &Fence, timeout_ms: u64) -> Result<()> {
            if *self.wait_ok.lock().unwrap() {
                Ok(())
            } else {
                Err(Error::FenceTimeout(timeout_ms))
            }
        }
    }
}

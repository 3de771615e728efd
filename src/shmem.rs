//! Shared coverage map

use std::io;
use std::ptr;

use crate::feedback::MAP_SIZE;

/// System V shared memory segment holding the coverage map.
///
/// The segment is shared with the instrumented runner, which learns its
/// identifier through the `__AFL_SHM_ID` environment variable and bumps
/// the per edge hit counts while the target runs. The segment is
/// detached and destroyed on drop.
#[derive(Debug)]
pub struct SharedMap {
    /// Segment identifier
    id: libc::c_int,
    /// Local attachment address
    raw_data: *mut u8,
}

// The attachment stays valid for the life of the segment, whichever
// thread touches it.
unsafe impl Send for SharedMap {}

impl SharedMap {
    /// Allocate a new segment of `MAP_SIZE` bytes
    pub fn new() -> io::Result<Self> {
        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                MAP_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if id < 0 {
            return Err(io::Error::last_os_error());
        }

        let raw_data = unsafe { libc::shmat(id, ptr::null(), 0) };
        if raw_data as isize == -1 {
            let error = io::Error::last_os_error();
            unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
            return Err(error);
        }

        Ok(Self {
            id,
            raw_data: raw_data as *mut u8,
        })
    }

    /// Segment identifier as published to the runner
    pub fn id(&self) -> String {
        self.id.to_string()
    }

    /// Zero the whole map
    pub fn zero(&mut self) {
        for byte in self.as_mut_slice() {
            *byte = 0;
        }
    }

    /// Owned copy of the current map contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.raw_data, MAP_SIZE) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.raw_data, MAP_SIZE) }
    }
}

impl Drop for SharedMap {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.raw_data as *const libc::c_void);
            libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut());
        }
    }
}

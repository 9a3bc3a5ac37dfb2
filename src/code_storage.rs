// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable memory for generated code.
//!
//! One page-aligned `mmap` region per rewriter, mapped readable, writable
//! and executable for its whole lifetime. Generated code is written once
//! during the link passes and only executed afterwards.

use crate::error::{Error, ErrorKind, ErrorModule, Result};

/// A page-aligned buffer with execute permission.
pub struct CodeStorage {
    ptr: *mut u8,
    capacity: usize,
    used: usize,
}

// The region is private to the owning rewriter while being written and
// immutable once a rewrite returns, so handing references across threads
// is sound.
unsafe impl Send for CodeStorage {}

impl CodeStorage {
    /// Default capacity of the executable buffer.
    pub const DEFAULT_CAPACITY: usize = 3 * 1024;

    /// Maps an executable region of at least `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let capacity = capacity.div_ceil(page) * page;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::new(
                ErrorModule::Generator,
                ErrorKind::BufferOverflow,
                0,
                0,
                format!("mmap of {capacity} executable bytes failed"),
            ));
        }

        Ok(Self { ptr: ptr as *mut u8, capacity, used: 0 })
    }

    /// Address of the first byte of the region.
    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Discards all generated code.
    pub fn clear(&mut self) {
        self.used = 0;
    }

    /// Reserves `len` bytes and returns their address, or a buffer
    /// overflow error when the region is exhausted.
    pub fn reserve(&mut self, len: usize) -> Result<u64> {
        if self.used + len > self.capacity {
            return Err(Error::generate(
                ErrorKind::BufferOverflow,
                self.addr() + self.used as u64,
                format!("code storage exhausted ({} of {} bytes used)", self.used, self.capacity),
            ));
        }
        let addr = self.addr() + self.used as u64;
        self.used += len;
        Ok(addr)
    }

    /// Writes bytes at an absolute address previously returned by [reserve](Self::reserve).
    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        let off = (addr - self.addr()) as usize;
        assert!(off + bytes.len() <= self.used, "[CodeStorage::write] write outside reserved space");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(off), bytes.len());
        }
    }

    /// The generated bytes, for inspection and tests.
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.used) }
    }
}

impl Drop for CodeStorage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_write() {
        let mut cs = CodeStorage::new(64).unwrap();
        assert!(cs.capacity() >= 64);
        let a = cs.reserve(3).unwrap();
        assert_eq!(a, cs.addr());
        cs.write(a, &[0xC3, 0x90, 0x90]);
        assert_eq!(cs.bytes(), &[0xC3, 0x90, 0x90]);
    }

    #[test]
    fn overflow_is_reported() {
        let mut cs = CodeStorage::new(64).unwrap();
        let cap = cs.capacity();
        cs.reserve(cap).unwrap();
        let err = cs.reserve(1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BufferOverflow);
    }

    #[test]
    fn region_is_executable() {
        // ret; called through a function pointer.
        let mut cs = CodeStorage::new(64).unwrap();
        let a = cs.reserve(1).unwrap();
        cs.write(a, &[0xC3]);
        let f: extern "C" fn() = unsafe { std::mem::transmute(a) };
        f();
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared memory pool backing the message rings of one or more channels.
//
// The pool is a fixed-size byte region backed by a named file. The creating
// side (the listener) keeps the file descriptor open so it can be passed to
// peers over the Unix socket as SCM_RIGHTS ancillary data; the receiving side
// maps the same region from that descriptor. Ring regions are carved out with
// a bump cursor and are immutable once allocated.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A memory-mapped pool shared between two or more simulator processes.
pub struct ShmPool {
    fd: RawFd,
    base: *mut u8,
    size: usize,
    pos: AtomicUsize,
    path: Option<CString>, // set on the creating side only
}

// Safety: the region is process-shared by design; the bump cursor is atomic
// and all ring accesses go through the ownership byte protocol.
unsafe impl Send for ShmPool {}
unsafe impl Sync for ShmPool {}

impl ShmPool {
    /// Create a pool of `size` bytes backed by the file at `path`.
    ///
    /// Any existing file at `path` is truncated. The returned pool owns the
    /// backing file and unlinks it on drop.
    pub fn create(path: &str, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }
        let c_path = CString::new(path.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                0o666 as libc::c_uint,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let base = Self::map(fd, size)?;
        Ok(Self {
            fd,
            base,
            size,
            pos: AtomicUsize::new(0),
            path: Some(c_path),
        })
    }

    /// Map an existing pool from a file descriptor received over a Unix
    /// socket. Takes ownership of `fd`. The size is taken from the file.
    pub fn map_fd(fd: RawFd) -> io::Result<Self> {
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut statbuf) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let size = statbuf.st_size as usize;

        let base = match Self::map(fd, size) {
            Ok(b) => b,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        Ok(Self {
            fd,
            base,
            size,
            pos: AtomicUsize::new(0),
            path: None,
        })
    }

    fn map(fd: RawFd, size: usize) -> io::Result<*mut u8> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(mem as *mut u8)
    }

    /// Carve `size` bytes out of the pool. Returns the offset of the region,
    /// or `None` when the pool is exhausted.
    pub fn alloc(&self, size: usize) -> Option<usize> {
        let mut cur = self.pos.load(Ordering::Relaxed);
        loop {
            if self.size - cur < size {
                return None;
            }
            match self.pos.compare_exchange_weak(
                cur,
                cur + size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(cur),
                Err(c) => cur = c,
            }
        }
    }

    /// Bytes remaining for allocation.
    pub fn available(&self) -> usize {
        self.size - self.pos.load(Ordering::Relaxed)
    }

    /// Pointer into the mapped region at `offset`.
    ///
    /// # Panics
    /// Panics if `offset` is past the end of the pool.
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        assert!(
            offset <= self.size,
            "offset {offset} past pool end {}",
            self.size
        );
        unsafe { self.base.add(offset) }
    }

    /// The backing file descriptor (for SCM_RIGHTS passing).
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Total pool size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Remove the backing file. The mapping stays valid until drop.
    pub fn unlink(&self) {
        if let Some(path) = &self.path {
            unsafe { libc::unlink(path.as_ptr()) };
        }
    }
}

impl Drop for ShmPool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
        self.unlink();
    }
}

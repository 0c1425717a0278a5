//! Executable code arenas backed by the OS.
//!
//! Arenas are mapped read-write, then flipped to read-execute. Every
//! write (new translation or patched jump) reopens only the pages it
//! touches, copies, and restores execute permission, so no page is ever
//! writable and executable at the same time.
//!
//! # Safety
//! All memory management is inherently unsafe. This module encapsulates
//! the unsafety behind the safe `CodeRegion` API.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, compiler_fence, fence};

use super::{CodeRegion, DispatchStubs, HostBackend, PAGE_SIZE};
use crate::types::HostAddr;

// =============================================================================
// Platform-specific imports
// =============================================================================

#[cfg(windows)]
mod platform {
    use std::io;
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };

    /// Allocate memory with read-write permissions.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    /// Free allocated memory.
    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    /// Make memory executable (and read-only).
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> io::Result<()> {
        let mut old_protect = 0;
        if unsafe { VirtualProtect(ptr as *mut _, size, PAGE_EXECUTE_READ, &mut old_protect) } == 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Make memory writable (remove execute permission).
    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> io::Result<()> {
        let mut old_protect = 0;
        if unsafe { VirtualProtect(ptr as *mut _, size, PAGE_READWRITE, &mut old_protect) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(unix)]
mod platform {
    use std::io;
    use std::ptr;

    /// Allocate memory with read-write permissions.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Free allocated memory.
    pub unsafe fn free(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    /// Make memory executable (and read-only).
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> io::Result<()> {
        if unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Make memory writable (remove execute permission).
    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> io::Result<()> {
        if unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) } != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

// =============================================================================
// Native Region
// =============================================================================

/// A page-aligned block of executable memory holding one sector's code.
pub struct NativeRegion {
    /// Pointer to the mapping.
    ptr: NonNull<u8>,
    /// Mapping size (page-aligned).
    capacity: usize,
}

impl NativeRegion {
    /// Map a region of at least `min_capacity` bytes, initially executable.
    pub fn map(min_capacity: usize) -> io::Result<Self> {
        let capacity = Self::align_to_page(min_capacity.max(PAGE_SIZE));

        let ptr = unsafe { platform::alloc_rw(capacity) };
        let ptr = NonNull::new(ptr).ok_or_else(io::Error::last_os_error)?;

        // Fill with int3 so stray jumps into unused arena trap.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), super::jump::INT3, capacity) };

        let region = NativeRegion { ptr, capacity };
        unsafe { platform::make_executable(region.ptr.as_ptr(), capacity)? };
        Ok(region)
    }

    /// Align a size up to the nearest page boundary.
    #[inline]
    const fn align_to_page(size: usize) -> usize {
        (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }

    /// Page span covering `[offset, offset + len)`.
    #[inline]
    fn page_span(offset: usize, len: usize) -> (usize, usize) {
        let start = offset & !(PAGE_SIZE - 1);
        let end = Self::align_to_page(offset + len);
        (start, end - start)
    }
}

impl CodeRegion for NativeRegion {
    #[inline]
    fn base(&self) -> HostAddr {
        self.ptr.as_ptr() as HostAddr
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.capacity,
            "write of {} bytes at {offset} overruns region",
            bytes.len()
        );
        if bytes.is_empty() {
            return;
        }

        let (page_off, span) = Self::page_span(offset, bytes.len());
        // SAFETY: the span lies inside our own mapping.
        let page = unsafe { self.ptr.as_ptr().add(page_off) };

        // Phase 1: make writable
        if let Err(err) = unsafe { platform::make_writable(page, span) } {
            panic!("cannot reopen code arena for writing: {err}");
        }

        // Phase 2: copy
        // SAFETY: pages are writable and the range was bounds-checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }

        // Phase 3: restore execute permission
        if let Err(err) = unsafe { platform::make_executable(page, span) } {
            panic!("cannot restore execute permission on code arena: {err}");
        }

        fence(Ordering::SeqCst);
    }

    #[inline]
    fn read(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.capacity, "read past end of region");
        // SAFETY: the mapping is always readable and bounds were checked.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }
}

impl Drop for NativeRegion {
    fn drop(&mut self) {
        unsafe {
            platform::free(self.ptr.as_ptr(), self.capacity);
        }
    }
}

// NativeRegion is Send because the table that owns it is single-writer.
unsafe impl Send for NativeRegion {}

impl std::fmt::Debug for NativeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegion")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("capacity", &self.capacity)
            .finish()
    }
}

// =============================================================================
// Native Backend
// =============================================================================

/// Backend that maps real executable memory.
#[derive(Debug, Clone)]
pub struct NativeBackend {
    stubs: DispatchStubs,
    event_check_len: usize,
}

impl NativeBackend {
    /// Create a backend for code whose dispatcher lives at `stubs`.
    pub fn new(stubs: DispatchStubs, event_check_len: usize) -> Self {
        Self {
            stubs,
            event_check_len,
        }
    }
}

impl HostBackend for NativeBackend {
    type Region = NativeRegion;

    fn map_region(&self, bytes: usize) -> io::Result<NativeRegion> {
        NativeRegion::map(bytes)
    }

    #[inline]
    fn dispatch_stubs(&self) -> DispatchStubs {
        self.stubs
    }

    #[inline]
    fn event_check_len(&self) -> usize {
        self.event_check_len
    }

    #[inline]
    fn flush_icache(&self, _start: HostAddr, _len: usize) {
        // x86 keeps instruction fetch coherent with stores from the same
        // core; only compiler reordering has to be prevented.
        compiler_fence(Ordering::SeqCst);
    }
}

// =============================================================================
// Tests
// =============================================================================

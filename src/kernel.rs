//! Platform boundary of the allocator.
//!
//! Everything the crate hands out is carved from memory mapped here, and
//! nothing else in the crate talks to the operating system. Mappings are only
//! ever requested for whole segments by [`crate::master::MasterHeap`].

use std::{ptr::NonNull, sync::OnceLock};

use tracing::debug;

use crate::utils::align;

/// Virtual memory page size of the computer. This is usually 4096.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Zero sized handle used to hang the platform specific implementations of
/// [`PlatformMemory`] on.
pub(crate) struct Kernel;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The allocator has nothing to do with the concrete APIs
/// offered by each kernel.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;

    /// Logical processor the calling thread is running on, if the platform
    /// can tell.
    fn current_processor() -> Option<usize>;
}

/// Wrapper to calculate the computer's page size once.
#[inline]
pub(crate) fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { Kernel::page_size() })
}

/// Number of logical processors available to the process.
#[inline]
pub(crate) fn processor_count() -> usize {
    num_cpus::get()
}

/// Wrapper to use [`PlatformMemory::current_processor`].
#[inline]
pub(crate) fn current_processor() -> Option<usize> {
    Kernel::current_processor()
}

/// A region of memory obtained straight from the kernel.
///
/// The mapping is unmapped when dropped, so whoever owns a `Mapping` owns the
/// memory behind it. Its length is always a multiple of [`page_size`].
pub(crate) struct Mapping {
    addr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is exclusively owned, nothing else holds the address.
unsafe impl Send for Mapping {}

impl Mapping {
    /// Maps at least `len` bytes of zeroed, read-write memory.
    pub(crate) fn new(len: usize) -> Option<Self> {
        let len = align(len.max(1), page_size());
        let addr = unsafe { Kernel::request_memory(len)? };

        debug!(addr = ?addr, len, "mapped memory");

        Some(Self { addr, len })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.addr
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        debug!(addr = ?self.addr, len = self.len, "unmapping memory");

        unsafe { Kernel::return_memory(self.addr.as_ptr(), self.len) }
    }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }

        #[cfg(target_os = "linux")]
        fn current_processor() -> Option<usize> {
            let cpu = unsafe { libc::sched_getcpu() };

            usize::try_from(cpu).ok()
        }

        #[cfg(not(target_os = "linux"))]
        fn current_processor() -> Option<usize> {
            None
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation, Threading};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }

        fn current_processor() -> Option<usize> {
            let cpu = unsafe { Threading::GetCurrentProcessorNumber() };

            Some(cpu as usize)
        }
    }
}

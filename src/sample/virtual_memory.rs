use once_cell::sync::Lazy;

use crate::error::EnvError;

static PAGE_SIZE: Lazy<usize> = Lazy::new(determine_page_size);

pub fn page_size() -> usize {
    *PAGE_SIZE
}

#[inline(always)]
pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A committed, read-write range of anonymous memory released on drop.
pub struct VirtualMemory {
    start: usize,
    size: usize,
}

unsafe impl Send for VirtualMemory {}
unsafe impl Sync for VirtualMemory {}

impl VirtualMemory {
    /// Reserves and commits `size` bytes, rounded up to whole pages.
    pub fn allocate(size: usize) -> Result<Self, EnvError> {
        let size = round_up(size.max(1), page_size());
        let start = unsafe { os::map(size) }.ok_or_else(|| EnvError::Reserve {
            size,
            errno: errno::errno().0,
        })?;

        log::debug!(target: "gc", "reserved {:#x}..{:#x} ({} KiB)", start, start + size, size / 1024);
        Ok(Self { start, size })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end()
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        unsafe {
            if !os::unmap(self.start, self.size) {
                log::warn!(target: "gc", "failed to release {:#x} (errno {})", self.start, errno::errno().0);
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        fn determine_page_size() -> usize {
            use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
            unsafe {
                let mut info: SYSTEM_INFO = std::mem::zeroed();
                GetSystemInfo(&mut info);
                info.dwPageSize as usize
            }
        }

        mod os {
            use winapi::um::{
                memoryapi::{VirtualAlloc, VirtualFree},
                winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
            };

            pub unsafe fn map(size: usize) -> Option<usize> {
                let address = VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
                if address.is_null() {
                    None
                } else {
                    Some(address as usize)
                }
            }

            pub unsafe fn unmap(start: usize, _size: usize) -> bool {
                VirtualFree(start as _, 0, MEM_RELEASE) != 0
            }
        }
    } else {
        fn determine_page_size() -> usize {
            let val = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if val <= 0 {
                4096
            } else {
                val as usize
            }
        }

        mod os {
            pub unsafe fn map(size: usize) -> Option<usize> {
                let address = libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );

                if address == libc::MAP_FAILED {
                    None
                } else {
                    Some(address as usize)
                }
            }

            pub unsafe fn unmap(start: usize, size: usize) -> bool {
                libc::munmap(start as _, size) == 0
            }
        }
    }
}

//! OS memory services: page-sized allocation near a hint address, scoped
//! permission changes, and page-alignment helpers.
//!
//! On 64-bit Windows, trampoline stubs must land within ±2 GiB of the
//! function they redirect so that 32-bit relative jumps can still reach
//! them; this module is responsible for making that placement happen.

use std::ptr::NonNull;

use crate::error::{HookError, HookResult};

/// Largest signed 32-bit displacement, the reach of a `rel32` jump.
pub const MAX_REL32: usize = i32::MAX as usize;

/// Returns the OS page size (typically 4096 on x86/x64 Windows).
pub fn page_size() -> usize {
    #[cfg(windows)]
    {
        use std::sync::OnceLock;
        use windows::Win32::System::SystemInformation::GetSystemInfo;

        static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
        *PAGE_SIZE.get_or_init(|| unsafe {
            let mut info = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        })
    }
    #[cfg(not(windows))]
    {
        4096
    }
}

/// Rounds `addr` down to the nearest page boundary.
pub fn align_down(addr: usize) -> usize {
    let size = page_size();
    addr & !(size - 1)
}

/// Rounds `addr` up to the nearest page boundary.
pub fn align_up(addr: usize) -> usize {
    let size = page_size();
    (addr + size - 1) & !(size - 1)
}

/// Returns `true` if `addr` lies within a 32-bit signed displacement of
/// `hint`, i.e. a `rel32` computed between them does not overflow.
pub fn within_rel32(hint: usize, addr: usize) -> bool {
    let distance = hint.abs_diff(addr);
    distance <= MAX_REL32
}

/// Allocates `size` bytes of committed, executable memory as close as
/// possible to `hint`, preferring addresses within ±2 GiB.
///
/// Implementation walks candidate hint addresses outward from `hint` in
/// page-granular steps (the same strategy the reference allocator uses
/// for its per-page trampoline pool), falling back to an unconstrained
/// allocation if nothing in range is available.
#[cfg(windows)]
pub fn alloc_near(hint: usize, size: usize) -> HookResult<NonNull<u8>> {
    use windows::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };

    let page = align_up(size.max(1));
    let search_radius = MAX_REL32.saturating_sub(page);
    let search_start = hint.saturating_sub(search_radius);
    let search_end = hint.saturating_add(search_radius);
    let step = page_size() * 64;

    let mut candidate = align_up(search_start.max(step));
    while candidate < search_end {
        if within_rel32(hint, candidate) {
            let result = unsafe {
                VirtualAlloc(
                    Some(candidate as *const _),
                    page,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_EXECUTE_READWRITE,
                )
            };

            if !result.is_null() {
                let actual = result as usize;
                if within_rel32(hint, actual) {
                    tracing::debug!(
                        "allocated {} bytes at {:#x} near hint {:#x}",
                        page,
                        actual,
                        hint
                    );
                    return NonNull::new(result as *mut u8)
                        .ok_or(HookError::OutOfMemory { hint });
                }
                unsafe {
                    let _ = windows::Win32::System::Memory::VirtualFree(
                        result,
                        0,
                        windows::Win32::System::Memory::MEM_RELEASE,
                    );
                }
            }
        }
        candidate = candidate.saturating_add(step);
    }

    // Fall back to an unconstrained allocation; the caller re-checks
    // reachability and surfaces `OutOfMemory` itself if it matters.
    let result = unsafe {
        VirtualAlloc(None, page, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE)
    };
    if result.is_null() {
        return Err(HookError::OutOfMemory { hint });
    }
    tracing::warn!(
        "no page within 2 GiB of hint {:#x}; falling back to {:#x}",
        hint,
        result as usize
    );
    NonNull::new(result as *mut u8).ok_or(HookError::OutOfMemory { hint })
}

#[cfg(not(windows))]
pub fn alloc_near(hint: usize, _size: usize) -> HookResult<NonNull<u8>> {
    Err(HookError::OutOfMemory { hint })
}

/// Releases a page previously returned by [`alloc_near`].
#[cfg(windows)]
pub fn free(ptr: NonNull<u8>) {
    use windows::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
    unsafe {
        let _ = VirtualFree(ptr.as_ptr() as *mut _, 0, MEM_RELEASE);
    }
}

#[cfg(not(windows))]
pub fn free(_ptr: NonNull<u8>) {}

/// Flushes the instruction cache for a just-written code range. Required
/// after patching or unpatching live code, and after writing a stub.
#[cfg(windows)]
pub fn flush_instruction_cache(address: *const u8, size: usize) {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    unsafe {
        let _ = FlushInstructionCache(HANDLE(std::ptr::null_mut()), Some(address as *const _), size);
    }
}

#[cfg(not(windows))]
pub fn flush_instruction_cache(_address: *const u8, _size: usize) {}

/// Scoped permission elevation: changes the protection of `[address,
/// address + size)` to `new_protect` on construction, restores the prior
/// protection on drop (including on the error/panic unwind path).
#[cfg(windows)]
pub struct ProtectionGuard {
    address: *mut std::ffi::c_void,
    size: usize,
    old_protect: windows::Win32::System::Memory::PAGE_PROTECTION_FLAGS,
}

#[cfg(windows)]
impl ProtectionGuard {
    /// Elevates protection over `[address, address + size)` to include
    /// WRITE (and keep EXECUTE), returning a guard that restores the
    /// original protection when dropped.
    pub fn writable(address: *mut u8, size: usize) -> HookResult<Self> {
        use windows::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE};

        let mut old = Default::default();
        unsafe {
            VirtualProtect(address as *mut _, size, PAGE_EXECUTE_READWRITE, &mut old).map_err(
                |e| HookError::PermissionFailure {
                    address: address as usize,
                    source: std::io::Error::from_raw_os_error(e.code().0),
                },
            )?;
        }

        Ok(Self {
            address: address as *mut _,
            size,
            old_protect: old,
        })
    }
}

#[cfg(windows)]
impl Drop for ProtectionGuard {
    fn drop(&mut self) {
        use windows::Win32::System::Memory::VirtualProtect;
        let mut unused = Default::default();
        unsafe {
            let _ = VirtualProtect(self.address, self.size, self.old_protect, &mut unused);
        }
        flush_instruction_cache(self.address as *const u8, self.size);
    }
}

#[cfg(not(windows))]
pub struct ProtectionGuard;

#[cfg(not(windows))]
impl ProtectionGuard {
    pub fn writable(address: *mut u8, size: usize) -> HookResult<Self> {
        Err(HookError::PermissionFailure {
            address: address as usize,
            source: std::io::Error::new(std::io::ErrorKind::Unsupported, "non-Windows target"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_round_trips_on_page_boundaries() {
        let size = page_size();
        assert_eq!(align_down(size), size);
        assert_eq!(align_up(size), size);
        assert_eq!(align_down(size + 1), size);
        assert_eq!(align_up(size + 1), size * 2);
    }

    #[test]
    fn within_rel32_respects_2gib_radius() {
        let hint = 0x1_0000_0000usize;
        assert!(within_rel32(hint, hint + 0x1000));
        assert!(within_rel32(hint, hint.saturating_sub(MAX_REL32)));
        assert!(!within_rel32(hint, hint.saturating_add(MAX_REL32 + 1)));
    }
}

//! Trampoline stub construction (§3 Stub, §4.6).
//!
//! A stub is a fixed-capacity executable block: a relocated-prologue
//! area, pre-filled with NOPs, followed by one (32-bit) or two (64-bit)
//! trailing long jumps. The first trailer always resumes the original
//! function past the overwrite window; the second (64-bit only) is an
//! absolute jump straight to the replacement, used as a proxy target by
//! [`PatchForm::StubTrailerProxy`](crate::plan::PatchForm::StubTrailerProxy).
//!
//! Every stub built from the same [`CodeAllocator`] has the same total
//! footprint, [`SLOT_SIZE`] — the allocator's slot size is fixed at
//! construction, so all stubs it ever hands out must already agree on
//! how large a "worst case" prologue area plus trailers can be.

use crate::alloc::{CodeAllocator, Slot};
use crate::encode;
use crate::error::{HookError, HookResult};
use crate::memory;
use crate::plan::ProloguePlan;
use crate::relocate;

/// Worst-case relocated-prologue area: large enough for the longest
/// overwrite window (14 bytes) fully relocated through the most
/// expensive per-instruction case (the far-absolute-jump fallback, 14
/// bytes per original instruction) several times over, with headroom.
const MAX_PROLOGUE_AREA: usize = 126;

/// One trailer: `LJmp` (64-bit) or `Jmp` (32-bit) back to the original
/// function's continuation point.
#[cfg(target_pointer_width = "64")]
const CONTINUATION_TRAILER_LEN: usize = 14;
#[cfg(not(target_pointer_width = "64"))]
const CONTINUATION_TRAILER_LEN: usize = 5;

/// The second, replacement-facing trailer. 64-bit only.
#[cfg(target_pointer_width = "64")]
const REPLACEMENT_TRAILER_LEN: usize = 14;
#[cfg(not(target_pointer_width = "64"))]
const REPLACEMENT_TRAILER_LEN: usize = 0;

/// Every slot an allocator backing this module hands out must be at
/// least this large.
pub const SLOT_SIZE: usize = MAX_PROLOGUE_AREA + CONTINUATION_TRAILER_LEN + REPLACEMENT_TRAILER_LEN;

/// An allocated, populated trampoline.
pub struct Stub {
    slot: Slot,
    /// Offset of the continuation trailer from the slot base — the
    /// address a rewritten thread IP or a `StubTrailerProxy` patch might
    /// need, and the callable "run the original" entry point.
    continuation_trailer_offset: usize,
    /// Offset of the second (replacement-facing) trailer, if present.
    replacement_trailer_offset: Option<usize>,
}

impl Stub {
    /// Address execution should enter at to run the relocated prologue
    /// followed by the rest of the original function. This is what
    /// `Hook::trampoline()` returns.
    pub fn trampoline_address(&self) -> usize {
        self.slot.address()
    }

    /// Address of the stub's replacement-facing far trailer, used as the
    /// patch target for [`PatchForm::StubTrailerProxy`](crate::plan::PatchForm::StubTrailerProxy).
    /// `None` on 32-bit, where no such trailer exists.
    pub fn replacement_trailer_address(&self) -> Option<usize> {
        self.replacement_trailer_offset
            .map(|offset| self.slot.address() + offset)
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.slot.as_ptr(), self.slot.size()) }
    }
}

/// Allocates the stub's slot near `hint` (typically `function_entry`,
/// per §4.6), without yet writing anything into it. Allocation has to
/// happen before [`ProloguePlan`] is computed, since the planner's
/// third case needs to know the stub's own reachability.
pub fn allocate(allocator: &CodeAllocator, hint: usize) -> HookResult<Slot> {
    allocator.allocate_near(hint)
}

/// Writes the relocated prologue and trailers into `slot`.
pub fn write(slot: Slot, plan: &ProloguePlan, replacement_entry: usize) -> HookResult<Stub> {
    let dest_base = slot.address();
    let window_start = plan.entry;
    let window_end = plan.entry + plan.overwrite_size;

    let mut code = relocate::relocate(&plan.instructions, window_start, window_end, dest_base)?;

    let prologue_len = code.len();
    if prologue_len > MAX_PROLOGUE_AREA {
        return Err(HookError::OutOfMemory { hint: dest_base });
    }

    // Fill NOPs for the rest of the fixed-size prologue area first, so
    // any thread IP rewritten into it, at any offset, slides forward
    // into the first trailer.
    code.resize(MAX_PROLOGUE_AREA, encode::NOP);

    // The normal (non-reentrant-IP) execution path shouldn't have to
    // walk through that padding: bridge over it with a short jump,
    // unless there's no meaningful gap to bridge.
    let gap = MAX_PROLOGUE_AREA - prologue_len;
    if gap >= 2 {
        let bridge_rel = encode::rel8(dest_base + prologue_len, 2, dest_base + MAX_PROLOGUE_AREA)
            .expect("gap is within rel8 range of MAX_PROLOGUE_AREA by construction");
        let bridge = encode::short_jmp(bridge_rel);
        code[prologue_len..prologue_len + 2].copy_from_slice(&bridge);
    }

    let continuation_trailer_offset = MAX_PROLOGUE_AREA;
    let continuation = window_end;
    append_trailer(&mut code, dest_base + continuation_trailer_offset, continuation);

    let replacement_trailer_offset = if REPLACEMENT_TRAILER_LEN > 0 {
        let offset = continuation_trailer_offset + CONTINUATION_TRAILER_LEN;
        append_absolute_trailer(&mut code, replacement_entry as u64);
        Some(offset)
    } else {
        None
    };

    debug_assert_eq!(code.len(), SLOT_SIZE);

    let mut stub = Stub {
        slot,
        continuation_trailer_offset,
        replacement_trailer_offset,
    };
    stub.as_mut_slice()[..code.len()].copy_from_slice(&code);
    memory::flush_instruction_cache(stub.slot.as_ptr(), SLOT_SIZE);

    Ok(stub)
}

/// Appends the continuation trailer: `LJmp` on 64-bit (always the
/// absolute form, per §3's stub layout), `Jmp rel32` on 32-bit.
#[cfg(target_pointer_width = "64")]
fn append_trailer(code: &mut Vec<u8>, _trailer_addr: usize, target: usize) {
    code.extend_from_slice(&encode::absolute_jmp(target as u64));
}

#[cfg(not(target_pointer_width = "64"))]
fn append_trailer(code: &mut Vec<u8>, trailer_addr: usize, target: usize) {
    let rel = encode::rel32(trailer_addr, 5, target).expect(
        "32-bit trailer target must be rel32-reachable; the allocator only ever places stubs \
         within reach of their function",
    );
    code.extend_from_slice(&encode::near_jmp(rel));
}

#[cfg(target_pointer_width = "64")]
fn append_absolute_trailer(code: &mut Vec<u8>, target: u64) {
    code.extend_from_slice(&encode::absolute_jmp(target));
}

#[cfg(not(target_pointer_width = "64"))]
#[allow(dead_code)]
fn append_absolute_trailer(_code: &mut Vec<u8>, _target: u64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_size_accounts_for_prologue_and_both_trailers() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(SLOT_SIZE, MAX_PROLOGUE_AREA + 14 + 14);
        #[cfg(not(target_pointer_width = "64"))]
        assert_eq!(SLOT_SIZE, MAX_PROLOGUE_AREA + 5);
    }
}

//! Entry-point resolution and prologue rewrite planning.
//!
//! Two separate concerns live here because both precede relocation and
//! both only need to look at instructions, never write them:
//! 1. [`resolve_entry_point`] chases forwarding jumps (the thin
//!    `jmp SomeOtherModule!RealFunction` thunks import tables and
//!    incremental-linking stubs are full of) down to wherever real code
//!    starts.
//! 2. [`plan_prologue`] decides how many bytes at that entry point must
//!    be overwritten to redirect execution — and through what path
//!    (direct, via a deadzone, or via the stub's own far trailer) — then
//!    disassembles exactly that many whole instructions for the
//!    relocator.

use crate::deadzone::{self, Deadzone};
use crate::decode::{BranchOperand, DecodedInstruction, InstructionCursor};
use crate::error::{HookError, HookResult};
use crate::memory;

/// Bound on forwarding-jump chases, guarding against a cycle (or an
/// absurdly long thunk chain) spinning forever.
const MAX_FORWARD_CHASE: usize = 64;

/// Follows a chain of unconditional jumps starting at `address`,
/// returning the address of the first instruction that is not itself an
/// unconditional jump to a directly-known target. Both `JIMM` (PC
/// relative) and `PTR` (absolute segmented) operand kinds are chased;
/// anything else (register- or memory-indirect jumps) ends the chase at
/// its own address, since the target can't be determined statically.
///
/// # Safety
/// `address` must be readable, executable code (the caller's hook
/// target).
pub unsafe fn resolve_entry_point(address: usize) -> HookResult<usize> {
    let mut current = address;
    for _ in 0..MAX_FORWARD_CHASE {
        let mut cursor = InstructionCursor::new(current);
        let instr = cursor.next()?;

        if !instr.is_unconditional_jmp() {
            return Ok(current);
        }

        let next = match instr.branch_operand() {
            BranchOperand::Relative => instr.near_branch_target(),
            BranchOperand::FarPointer => instr.far_branch_absolute_target(),
            BranchOperand::Other => None,
        };

        match next {
            Some(target) => current = target as usize,
            None => return Ok(current),
        }
    }

    Err(HookError::LookupFailure(format!(
        "forwarding jump chain from {:#x} did not terminate within {} hops",
        address, MAX_FORWARD_CHASE
    )))
}

/// How the live prologue redirects to the replacement function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchForm {
    /// A 2-byte `jmp rel8` at `function_entry` into a deadzone, which
    /// itself holds `secondary_form`'s jump to the replacement.
    Deadzone { deadzone: Deadzone, secondary_form: SecondaryForm },
    /// A 5-byte `jmp rel32` written directly at `function_entry`.
    Direct,
    /// A 5-byte `jmp rel32` at `function_entry` to the stub's own far
    /// trailer (which absolute-jumps to the replacement). Used when the
    /// replacement is unreachable from `function_entry` but the stub
    /// (placed near `function_entry`) is reachable. 64-bit only.
    StubTrailerProxy,
    /// A 14-byte absolute jump written directly at `function_entry`.
    Absolute,
}

/// The width of the jump a deadzone gets patched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryForm {
    NearJmp,
    AbsoluteJmp,
}

impl PatchForm {
    /// Bytes this form overwrites at `function_entry` itself.
    pub fn overwrite_size(self) -> usize {
        match self {
            PatchForm::Deadzone { .. } => 2,
            PatchForm::Direct | PatchForm::StubTrailerProxy => 5,
            PatchForm::Absolute => 14,
        }
    }
}

/// The result of planning a prologue rewrite.
pub struct ProloguePlan {
    pub entry: usize,
    pub form: PatchForm,
    /// Actual bytes displaced at `function_entry`, rounded up from
    /// `form.overwrite_size()` to a whole number of instructions.
    pub overwrite_size: usize,
    pub instructions: Vec<DecodedInstruction>,
    /// Set when the very first decoded instruction already covers the
    /// whole overwrite window: the live write is then a single
    /// instruction-sized store, atomic with respect to any concurrently
    /// executing thread, so thread suspension can be skipped.
    pub hotpatchable: bool,
}

/// Plans how to rewrite the prologue at `entry` so that it redirects to
/// `replacement_entry`, given that a stub has already been placed at
/// `stub_base` (stub placement has to happen first, per §4.6, since the
/// planner's third case needs to know the stub's own reachability).
///
/// # Safety
/// `entry` must be readable, executable code of at least 14 bytes (true
/// for any real function not at the very end of its page).
pub unsafe fn plan_prologue(
    entry: usize,
    replacement_entry: usize,
    stub_base: usize,
) -> HookResult<ProloguePlan> {
    let form = choose_patch_form(entry, replacement_entry, stub_base);
    let instructions = decode_at_least(entry, form.overwrite_size())?;
    let overwrite_size = instructions.iter().map(DecodedInstruction::len).sum();
    let hotpatchable = instructions
        .first()
        .is_some_and(|first| first.len() >= form.overwrite_size());

    Ok(ProloguePlan {
        entry,
        form,
        overwrite_size,
        instructions,
        hotpatchable,
    })
}

/// Implements §4.3 step 2's decision tree.
fn choose_patch_form(entry: usize, replacement_entry: usize, stub_base: usize) -> PatchForm {
    let injection_reachable = memory::within_rel32(entry, replacement_entry);
    let stub_reachable = memory::within_rel32(entry, stub_base);

    let secondary_form = if injection_reachable {
        SecondaryForm::NearJmp
    } else {
        SecondaryForm::AbsoluteJmp
    };
    let deadzone_min_len = match secondary_form {
        SecondaryForm::NearJmp => 5,
        SecondaryForm::AbsoluteJmp => 14,
    };

    if let Some(deadzone) = deadzone::find_deadzone(entry, deadzone_min_len) {
        if memory::within_rel32(entry, deadzone.address) {
            // A short jump only has 8-bit reach; the deadzone search
            // horizon (127 bytes / same page) already keeps it well
            // inside rel32, but a rel8 check is what actually matters
            // for the 2-byte jump written at `entry`.
            if crate::encode::rel8(entry, 2, deadzone.address).is_some() {
                return PatchForm::Deadzone { deadzone, secondary_form };
            }
        }
    }

    if injection_reachable {
        return PatchForm::Direct;
    }

    #[cfg(target_pointer_width = "64")]
    if stub_reachable {
        return PatchForm::StubTrailerProxy;
    }
    #[cfg(not(target_pointer_width = "64"))]
    let _ = stub_reachable;

    PatchForm::Absolute
}

/// Decodes whole instructions starting at `address` until at least
/// `min_bytes` have been consumed.
fn decode_at_least(address: usize, min_bytes: usize) -> HookResult<Vec<DecodedInstruction>> {
    let mut cursor = InstructionCursor::new(address);
    let mut instructions = Vec::new();
    let mut consumed = 0usize;

    while consumed < min_bytes {
        let instr = unsafe { cursor.next() }?;
        consumed += instr.len();
        instructions.push(instr);
    }

    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_code(bytes: &[u8]) -> usize {
        let mut buf = bytes.to_vec();
        buf.resize(64, 0x90);
        let leaked: &'static mut [u8] = Box::leak(buf.into_boxed_slice());
        leaked.as_ptr() as usize
    }

    #[test]
    fn resolves_single_hop_relative_forwarding_jump() {
        // At `real`: mov eax,1 ; ret. At `thunk`: jmp rel32 real.
        let real_bytes = [0xB8u8, 0x01, 0x00, 0x00, 0x00, 0xC3];
        let real = leak_code(&real_bytes);

        let mut thunk_buf = vec![0xE9u8, 0, 0, 0, 0];
        thunk_buf.resize(64, 0x90);
        let thunk_leaked: &'static mut [u8] = Box::leak(thunk_buf.into_boxed_slice());
        let thunk = thunk_leaked.as_ptr() as usize;
        let disp = (real as i64 - (thunk as i64 + 5)) as i32;
        thunk_leaked[1..5].copy_from_slice(&disp.to_le_bytes());

        let resolved = unsafe { resolve_entry_point(thunk) }.unwrap();
        assert_eq!(resolved, real);
    }

    #[test]
    fn stops_at_non_jump_instruction() {
        let addr = leak_code(&[0xB8, 0x01, 0x00, 0x00, 0x00]);
        let resolved = unsafe { resolve_entry_point(addr) }.unwrap();
        assert_eq!(resolved, addr);
    }

    #[test]
    fn direct_plan_rounds_up_to_instruction_boundary_and_is_not_hotpatchable() {
        // mov eax,1 (5) ; mov ecx,2 (5) ; ret (1) -- first 5 bytes land
        // exactly on an instruction boundary, so overwrite_size stays 5
        // and hotpatchable is true (first instruction IS the whole window).
        let addr = leak_code(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xB9, 0x02, 0x00, 0x00, 0x00, 0xC3]);
        let replacement = addr + 0x1000;
        let plan = unsafe { plan_prologue(addr, replacement, addr + 0x2000) }.unwrap();
        assert_eq!(plan.form, PatchForm::Direct);
        assert_eq!(plan.overwrite_size, 5);
        assert_eq!(plan.instructions.len(), 1);
        assert!(plan.hotpatchable);
    }

    #[test]
    fn non_hotpatchable_when_window_spans_multiple_instructions() {
        // push rbp (1) ; mov eax,1 (5) -- window of 5 needs both
        // instructions, so the write is not a single atomic store.
        let addr = leak_code(&[0x55, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
        let replacement = addr + 0x1000;
        let plan = unsafe { plan_prologue(addr, replacement, addr + 0x2000) }.unwrap();
        assert_eq!(plan.overwrite_size, 6);
        assert_eq!(plan.instructions.len(), 2);
        assert!(!plan.hotpatchable);
    }

    fn leak_padded_code(pad_len: usize, bytes: &[u8]) -> usize {
        let mut buf = vec![crate::encode::INT3; pad_len];
        buf.extend_from_slice(bytes);
        buf.resize(buf.len() + 64, 0x90);
        let leaked: &'static mut [u8] = Box::leak(buf.into_boxed_slice());
        leaked.as_ptr() as usize + pad_len
    }

    #[test]
    fn chooses_deadzone_proxy_when_enough_padding_precedes_entry() {
        // 8 bytes of INT3 padding qualifies for a 5-byte near-jmp
        // secondary form (the replacement is nearby, so that's the form
        // chosen); the deadzone is tried before falling back to Direct.
        let entry = leak_padded_code(8, &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
        let replacement = entry + 0x1000;
        let plan = unsafe { plan_prologue(entry, replacement, entry + 0x2000) }.unwrap();
        assert!(matches!(plan.form, PatchForm::Deadzone { .. }));
        assert_eq!(plan.form.overwrite_size(), 2);
    }

    #[test]
    fn falls_back_to_absolute_when_nothing_else_reaches() {
        // No padding before entry, so no deadzone; replacement and stub
        // are both placed far enough away to be unreachable by rel32.
        let entry = leak_code(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
        let replacement = entry.wrapping_add(0x8000_0000);
        let stub_base = entry.wrapping_add(0x9000_0000);
        let plan = unsafe { plan_prologue(entry, replacement, stub_base) }.unwrap();
        assert_eq!(plan.form, PatchForm::Absolute);
        assert!(plan.overwrite_size >= 14);
    }
}

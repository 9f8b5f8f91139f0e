//! Code relocator: given the disassembled instructions that make up an
//! overwrite window and a destination buffer, emits an equivalent
//! instruction stream such that every branch and RIP-relative addressing
//! mode still refers to the same absolute target despite the move.
//!
//! Works in two passes over the already-decoded instruction list:
//! 1. **Plan** — walk the instructions once, in source order, deciding
//!    each one's emission strategy and size. Because destination
//!    addresses only ever grow, the running destination cursor at each
//!    step is already final by the time we need it (to decide, e.g.,
//!    whether a far call needs the 2^31-exceeding fallback).
//! 2. **Emit** — walk again, writing bytes. Any branch whose target
//!    lands inside the moved window is resolved against the address map
//!    built in the planning pass; everything else resolves against its
//!    own (now-known, fixed) absolute target.

use std::collections::HashMap;

use crate::decode::{BranchOperand, DecodedInstruction};
use crate::encode;
use crate::error::{HookError, HookResult};

/// One instruction's relocation plan.
struct Planned<'a> {
    instr: &'a DecodedInstruction,
    dest_offset: usize,
    size: usize,
    emission: Emission,
}

#[derive(Debug)]
enum Emission {
    /// Copy the original bytes unchanged.
    Verbatim,
    /// Copy the original bytes, then patch the trailing `disp32` for a
    /// RIP-relative memory operand.
    VerbatimWithRipFixup { target: u64 },
    /// `JMP rel32` to `target` (widened short jump, or a same-size
    /// recompute of an already-32-bit jump).
    NearJmp { target: u64, in_window: bool },
    /// `Jcc rel32` to `target` (widened short conditional jump).
    NearJcc { condition: u8, target: u64, in_window: bool },
    /// The loop-family/`J(e/r)cxz` idiom: original short branch skips a
    /// short jump that falls through to a near jump.
    LoopOrCxzIdiom { opcode: u8, target: u64, in_window: bool },
    /// `CALL rel32` whose target lies inside the moved window: push the
    /// real return address, then jump directly to the (relocated)
    /// target, never executing a `call` opcode that would return into
    /// now-overwritten memory.
    CallIntoWindow { target: u64, return_address: u64 },
    /// A near jump/call/jcc whose relocated displacement would exceed
    /// `rel32` range; materialize an absolute jump instead (64-bit only).
    FarJmp { target: u64 },
    FarCall { target: u64, return_address: u64 },
    FarJcc { condition: u8, target: u64 },
}

/// Relocates `instructions` (decoded from the original overwrite window,
/// `[window_start, window_end)`) into code meant to execute starting at
/// `dest_base`. Returns the emitted bytes.
pub fn relocate(
    instructions: &[DecodedInstruction],
    window_start: usize,
    window_end: usize,
    dest_base: usize,
) -> HookResult<Vec<u8>> {
    let mut planned = Vec::with_capacity(instructions.len());
    let mut address_map = HashMap::with_capacity(instructions.len());
    let mut dest_cursor = dest_base;

    // Pass 1: plan.
    for instr in instructions {
        let dest_offset = dest_cursor - dest_base;
        let (emission, size) = plan_one(instr, window_start, window_end, dest_cursor)?;
        address_map.insert(instr.address(), dest_offset);
        dest_cursor += size;
        planned.push(Planned {
            instr,
            dest_offset,
            size,
            emission,
        });
    }

    // Pass 2: emit.
    let mut code = Vec::with_capacity(dest_cursor - dest_base);
    for p in &planned {
        let this_dest = dest_base + p.dest_offset;
        emit_one(p, this_dest, dest_base, &address_map, &mut code)?;
        debug_assert_eq!(code.len(), p.dest_offset + p.size);
    }

    Ok(code)
}

fn resolve_in_window_target(
    target: u64,
    window_start: usize,
    window_end: usize,
) -> Option<usize> {
    let target = target as usize;
    if target >= window_start && target < window_end {
        Some(target)
    } else {
        None
    }
}

fn plan_one(
    instr: &DecodedInstruction,
    window_start: usize,
    window_end: usize,
    dest_addr: usize,
) -> HookResult<(Emission, usize)> {
    if instr.is_rip_relative() {
        let target = instr.rip_relative_target().ok_or(HookError::UnrelocatableInstruction {
            address: instr.address(),
            reason: "RIP-relative operand reported but no target available",
        })?;
        // Same instruction length; only the trailing disp32 changes, and
        // the new IP (dest_addr + len) must still reach it within i32.
        let new_next_ip = dest_addr as i64 + instr.len() as i64;
        if i32::try_from(target as i64 - new_next_ip).is_err() {
            return Err(HookError::UnrelocatableInstruction {
                address: instr.address(),
                reason: "RIP-relative displacement no longer fits in 32 bits after relocation",
            });
        }
        return Ok((Emission::VerbatimWithRipFixup { target }, instr.len()));
    }

    match instr.branch_operand() {
        BranchOperand::Other | BranchOperand::FarPointer => Ok((Emission::Verbatim, instr.len())),
        BranchOperand::Relative => plan_relative(instr, window_start, window_end, dest_addr),
    }
}

fn plan_relative(
    instr: &DecodedInstruction,
    window_start: usize,
    window_end: usize,
    dest_addr: usize,
) -> HookResult<(Emission, usize)> {
    let target = instr.near_branch_target().ok_or(HookError::UnrelocatableInstruction {
        address: instr.address(),
        reason: "relative branch reported but no target available",
    })?;
    let in_window = resolve_in_window_target(target, window_start, window_end).is_some();

    if instr.is_relative_call() {
        if in_window {
            let return_address = (instr.address() + instr.len()) as u64;
            // A call's displacement is `target - return_address`. A
            // negative displacement means the call reaches backward into
            // window bytes that either precede this instruction (already
            // relocated, living at a different destination offset than
            // the source-order address map would resolve to) or that the
            // call instruction itself overlaps — neither can be made to
            // call back into the stub correctly, so it is rejected here
            // rather than silently mistranslated.
            if target < return_address {
                return Err(HookError::UnrelocatableInstruction {
                    address: instr.address(),
                    reason: "negative-offset call into the moved window",
                });
            }
            return Ok((
                Emission::CallIntoWindow { target, return_address },
                5 /* push low */ + 8 /* mov high */ + 5, /* jmp rel32 */
            ));
        }
        // Estimate as a same-size relocated call first; fall back to the
        // far form if the displacement from a 5-byte-sized instruction
        // here wouldn't fit.
        let next_ip_if_near = dest_addr as i64 + 5;
        if i32::try_from(target as i64 - next_ip_if_near).is_ok() {
            return Ok((Emission::NearJmp { target, in_window: false }, 5));
        }
        let return_address = (instr.address() + instr.len()) as u64;
        return Ok((
            Emission::FarCall { target, return_address },
            5 + 8 + 14, // push return addr (lo+hi) + absolute jump to target
        ));
    }

    if instr.is_short_unconditional_jmp() {
        if in_window {
            return Ok((Emission::NearJmp { target, in_window: true }, 5));
        }
        let next_ip_if_near = dest_addr as i64 + 5;
        if i32::try_from(target as i64 - next_ip_if_near).is_ok() {
            return Ok((Emission::NearJmp { target, in_window: false }, 5));
        }
        return Ok((Emission::FarJmp { target }, 14));
    }

    if instr.is_unconditional_jmp() {
        // Already a 32-bit-encoded unconditional jump (len == 5); same
        // treatment as the short case, just starting from len 5.
        if in_window {
            return Ok((Emission::NearJmp { target, in_window: true }, 5));
        }
        let next_ip_if_near = dest_addr as i64 + 5;
        if i32::try_from(target as i64 - next_ip_if_near).is_ok() {
            return Ok((Emission::NearJmp { target, in_window: false }, 5));
        }
        return Ok((Emission::FarJmp { target }, 14));
    }

    if instr.is_loop_or_cxz() {
        let opcode = *instr.raw_bytes().first().ok_or(HookError::UnrelocatableInstruction {
            address: instr.address(),
            reason: "empty instruction bytes",
        })?;
        return Ok((
            Emission::LoopOrCxzIdiom { opcode, target, in_window },
            2 /* widened short branch */ + 2 /* short jmp +5 */ + 5, /* jmp rel32 */
        ));
    }

    if instr.is_short_conditional_jmp() {
        let condition = instr.jcc_condition_nibble().ok_or(HookError::UnrelocatableInstruction {
            address: instr.address(),
            reason: "Jcc with no condition nibble",
        })?;
        if in_window {
            return Ok((Emission::NearJcc { condition, target, in_window: true }, 6));
        }
        let next_ip_if_near = dest_addr as i64 + 6;
        if i32::try_from(target as i64 - next_ip_if_near).is_ok() {
            return Ok((Emission::NearJcc { condition, target, in_window: false }, 6));
        }
        return Ok((Emission::FarJcc { condition, target }, 6 + 14));
    }

    // A near Jcc (len 6, already 32-bit encoded) falls through to the
    // same family as the short conditional case above.
    if let Some(condition) = instr.jcc_condition_nibble() {
        if in_window {
            return Ok((Emission::NearJcc { condition, target, in_window: true }, 6));
        }
        let next_ip_if_near = dest_addr as i64 + 6;
        if i32::try_from(target as i64 - next_ip_if_near).is_ok() {
            return Ok((Emission::NearJcc { condition, target, in_window: false }, 6));
        }
        return Ok((Emission::FarJcc { condition, target }, 6 + 14));
    }

    Err(HookError::UnrelocatableInstruction {
        address: instr.address(),
        reason: "unrecognized relative-branch instruction shape",
    })
}

fn resolved_target(target: u64, address_map: &HashMap<usize, usize>, dest_base: usize) -> u64 {
    match address_map.get(&(target as usize)) {
        Some(&offset) => (dest_base + offset) as u64,
        None => target,
    }
}

fn emit_one(
    p: &Planned,
    dest_addr: usize,
    dest_base: usize,
    address_map: &HashMap<usize, usize>,
    out: &mut Vec<u8>,
) -> HookResult<()> {
    match &p.emission {
        Emission::Verbatim => out.extend_from_slice(p.instr.raw_bytes()),
        Emission::VerbatimWithRipFixup { target } => {
            let mut bytes = p.instr.raw_bytes().to_vec();
            let new_next_ip = dest_addr as i64 + bytes.len() as i64;
            let new_disp = (*target as i64 - new_next_ip) as i32;
            patch_trailing_disp32(&mut bytes, new_disp)?;
            out.extend_from_slice(&bytes);
        }
        Emission::NearJmp { target, in_window } => {
            let resolved = if *in_window {
                resolved_target(*target, address_map, dest_base)
            } else {
                *target
            };
            let rel = encode::rel32(dest_addr, 5, resolved as usize).ok_or(
                HookError::UnrelocatableInstruction {
                    address: p.instr.address(),
                    reason: "near jmp displacement overflowed during emission",
                },
            )?;
            out.extend_from_slice(&encode::near_jmp(rel));
        }
        Emission::NearJcc { condition, target, in_window } => {
            let resolved = if *in_window {
                resolved_target(*target, address_map, dest_base)
            } else {
                *target
            };
            let rel = encode::rel32(dest_addr, 6, resolved as usize).ok_or(
                HookError::UnrelocatableInstruction {
                    address: p.instr.address(),
                    reason: "near jcc displacement overflowed during emission",
                },
            )?;
            out.extend_from_slice(&encode::near_jcc(*condition, rel));
        }
        Emission::LoopOrCxzIdiom { opcode, target, in_window } => {
            // original_opcode rel8(+2)  -> skip the next short jmp when condition holds
            // short_jmp +5              -> falls through to the near jmp when condition fails
            // near_jmp rel32 target     -> the 32-bit-reachable real target
            let resolved = if *in_window {
                resolved_target(*target, address_map, dest_base)
            } else {
                *target
            };
            out.push(*opcode);
            out.push(2i8 as u8); // skip over the 2-byte short jmp below
            out.extend_from_slice(&encode::short_jmp(5));
            let near_jmp_addr = dest_addr + 4;
            let rel = encode::rel32(near_jmp_addr, 5, resolved as usize).ok_or(
                HookError::UnrelocatableInstruction {
                    address: p.instr.address(),
                    reason: "loop/cxz idiom displacement overflowed during emission",
                },
            )?;
            out.extend_from_slice(&encode::near_jmp(rel));
        }
        Emission::CallIntoWindow { target, return_address } => {
            let resolved_call_target = resolved_target(*target, address_map, dest_base);
            out.extend_from_slice(&encode::push_u64(*return_address));
            let jmp_addr = dest_addr + 13;
            let rel = encode::rel32(jmp_addr, 5, resolved_call_target as usize).ok_or(
                HookError::UnrelocatableInstruction {
                    address: p.instr.address(),
                    reason: "call-into-window jmp displacement overflowed during emission",
                },
            )?;
            out.extend_from_slice(&encode::near_jmp(rel));
        }
        Emission::FarJmp { target } => {
            out.extend_from_slice(&encode::absolute_jmp(*target));
        }
        Emission::FarCall { target, return_address } => {
            out.extend_from_slice(&encode::push_u64(*return_address));
            out.extend_from_slice(&encode::absolute_jmp(*target));
        }
        Emission::FarJcc { condition, target } => {
            // Jcc rel32 branches straight to the trailing absolute-jump
            // block when the condition holds; otherwise control falls
            // through past it, exactly like the in-range NearJcc case.
            let abs_block_addr = dest_addr + 6;
            let rel = encode::rel32(dest_addr, 6, abs_block_addr).ok_or(
                HookError::UnrelocatableInstruction {
                    address: p.instr.address(),
                    reason: "far jcc trailer displacement overflowed during emission",
                },
            )?;
            out.extend_from_slice(&encode::near_jcc(*condition, rel));
            out.extend_from_slice(&encode::absolute_jmp(*target));
        }
    }
    Ok(())
}

/// Locates and overwrites the trailing `disp32` bytes of a RIP-relative
/// instruction's copy, scanning from the end (none of the move-sized
/// instructions this relocates carry both a disp32 and an imm32, so the
/// last four bytes are always the displacement).
fn patch_trailing_disp32(bytes: &mut [u8], new_disp: i32) -> HookResult<()> {
    if bytes.len() < 4 {
        return Err(HookError::UnrelocatableInstruction {
            address: 0,
            reason: "instruction too short to carry a disp32",
        });
    }
    let len = bytes.len();
    bytes[len - 4..].copy_from_slice(&new_disp.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::InstructionCursor;

    fn decode_at(bytes: &[u8], ip: usize) -> Vec<DecodedInstruction> {
        // Write bytes into a heap buffer we leak for the test's duration
        // so `InstructionCursor` (which reads through a raw pointer) sees
        // them at a stable address. Tests run single-threaded per-case.
        let mut buf = bytes.to_vec();
        buf.resize(64, 0x90);
        let leaked: &'static mut [u8] = Box::leak(buf.into_boxed_slice());
        let addr = leaked.as_ptr() as usize;
        // Re-decode at the intended `ip` by only trusting relative sizes;
        // callers pass `ip` purely for branch-target math in this test,
        // so we decode at the real buffer address and shift expectations
        // accordingly instead of faking the processor's IP.
        let _ = ip;
        let mut cursor = InstructionCursor::new(addr);
        let mut out = Vec::new();
        let mut consumed = 0;
        while consumed < bytes.len() {
            let instr = unsafe { cursor.next() }.unwrap();
            consumed += instr.len();
            out.push(instr);
        }
        out
    }

    #[test]
    fn relocates_position_independent_instruction_verbatim() {
        // mov eax, 1
        let instrs = decode_at(&[0xB8, 0x01, 0x00, 0x00, 0x00], 0);
        let window_start = instrs[0].address();
        let window_end = window_start + instrs[0].len();
        let dest_base = window_start + 0x10000;
        let code = relocate(&instrs, window_start, window_end, dest_base).unwrap();
        assert_eq!(code, instrs[0].raw_bytes());
    }

    #[test]
    fn widens_short_unconditional_jmp_to_near_jmp() {
        // jmp short +0x10
        let instrs = decode_at(&[0xEB, 0x10], 0);
        let window_start = instrs[0].address();
        let window_end = window_start + instrs[0].len();
        let original_target = window_start + 2 + 0x10;
        let dest_base = window_start + 0x10000;

        let code = relocate(&instrs, window_start, window_end, dest_base).unwrap();
        assert_eq!(code.len(), 5);
        assert_eq!(code[0], 0xE9);
        let rel = i32::from_le_bytes(code[1..5].try_into().unwrap());
        let computed_target = (dest_base as i64 + 5 + rel as i64) as usize;
        assert_eq!(computed_target, original_target);
    }

    #[test]
    fn widens_short_conditional_jmp_with_0f_prefix() {
        // je short +4  (0x74 0x04)
        let instrs = decode_at(&[0x74, 0x04], 0);
        let window_start = instrs[0].address();
        let window_end = window_start + instrs[0].len();
        let dest_base = window_start + 0x10000;

        let code = relocate(&instrs, window_start, window_end, dest_base).unwrap();
        assert_eq!(code.len(), 6);
        assert_eq!(code[0], 0x0F);
        assert_eq!(code[1], 0x84);
    }

    #[test]
    fn rejects_negative_offset_call_into_moved_window() {
        // call rel32 -5, i.e. a call whose target is its own address.
        let instrs = decode_at(&[0xE8, 0xFB, 0xFF, 0xFF, 0xFF], 0);
        let window_start = instrs[0].address();
        let window_end = window_start + instrs[0].len();
        let dest_base = window_start + 0x10000;

        let result = relocate(&instrs, window_start, window_end, dest_base);
        assert!(matches!(
            result,
            Err(HookError::UnrelocatableInstruction { reason, .. })
                if reason == "negative-offset call into the moved window"
        ));
    }

    #[test]
    fn rejects_rip_relative_overflowing_i32_after_move() {
        // mov rax, [rip+0x10]: 48 8B 05 10 00 00 00
        let instrs = decode_at(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00], 0);
        let window_start = instrs[0].address();
        let window_end = window_start + instrs[0].len();
        // Move it far enough away that the recomputed disp32 can't hold.
        let dest_base = window_start + 0x8000_0000;

        let result = relocate(&instrs, window_start, window_end, dest_base);
        assert!(result.is_err());
    }
}

//! Disassembler adapter: a thin wrapper over `iced-x86`'s byte decoder
//! that exposes exactly the per-instruction facts the rewriter needs —
//! size, mnemonic family, branch target kind, and RIP-relative memory
//! operand location — without exposing `iced-x86` types to the rest of
//! the engine.

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind};

use crate::error::{HookError, HookResult};

/// Longest an x86/x64 instruction can be.
const MAX_INSTRUCTION_LEN: usize = 15;

#[cfg(target_pointer_width = "64")]
const BITNESS: u32 = 64;
#[cfg(target_pointer_width = "32")]
const BITNESS: u32 = 32;

/// How a decoded instruction's (sole, for our purposes) control-flow
/// operand is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOperand {
    /// `JIMM` — PC-relative branch target (`next_ip + disp`).
    Relative,
    /// `PTR` — absolute segmented pointer (`segment:offset`), as used by
    /// far `JMP`/`CALL` thunks.
    FarPointer,
    /// Anything else (register-indirect, memory-indirect, ...). The
    /// entry-point chase and the relocator both stop here.
    Other,
}

/// A decoded instruction, positioned at `address`, together with the
/// subset of its shape the rewriter cases on.
#[derive(Clone)]
pub struct DecodedInstruction {
    inner: Instruction,
    bytes: Vec<u8>,
}

impl DecodedInstruction {
    /// Address of the first byte of this instruction.
    pub fn address(&self) -> usize {
        self.inner.ip() as usize
    }

    /// Total encoded length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Raw encoded bytes, exactly `len()` long.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `true` for `JMP rel8`/`JMP rel32`/`JMP r/m`/`JMP ptr16:32` — any
    /// unconditional jump, regardless of operand encoding.
    pub fn is_unconditional_jmp(&self) -> bool {
        self.inner.flow_control() == FlowControl::UnconditionalBranch
            && self.inner.mnemonic() == Mnemonic::Jmp
    }

    /// `true` for `CALL rel32`.
    pub fn is_relative_call(&self) -> bool {
        self.inner.mnemonic() == Mnemonic::Call
            && matches!(
                self.inner.op0_kind(),
                OpKind::NearBranch64 | OpKind::NearBranch32
            )
    }

    /// `true` for conditional jumps with an 8-bit displacement (`Jcc
    /// rel8`), excluding the loop-family and `J(e/r)cxz` which have no
    /// 32-bit encoded counterpart.
    pub fn is_short_conditional_jmp(&self) -> bool {
        self.inner.flow_control() == FlowControl::ConditionalBranch
            && self.len() == 2
            && !self.is_loop_or_cxz()
    }

    /// `true` for `JMP rel8` specifically (2-byte unconditional jump).
    pub fn is_short_unconditional_jmp(&self) -> bool {
        self.is_unconditional_jmp() && self.len() == 2
    }

    /// `true` for `LOOP`/`LOOPE`/`LOOPNE`/`JCXZ`/`JECXZ`/`JRCXZ` — the
    /// short conditional branches with no `rel32` form.
    pub fn is_loop_or_cxz(&self) -> bool {
        matches!(
            self.inner.mnemonic(),
            Mnemonic::Loop
                | Mnemonic::Loope
                | Mnemonic::Loopne
                | Mnemonic::Jcxz
                | Mnemonic::Jecxz
                | Mnemonic::Jrcxz
        )
    }

    /// Condition-code nibble for a `Jcc`, used to widen `0x70+n rel8`
    /// into `0x0F 0x80+n rel32`. `None` for non-`Jcc` instructions.
    pub fn jcc_condition_nibble(&self) -> Option<u8> {
        if self.inner.flow_control() != FlowControl::ConditionalBranch {
            return None;
        }
        if self.is_loop_or_cxz() {
            return None;
        }
        // Short Jcc opcodes are 0x70..=0x7F; near Jcc opcodes embed the
        // same condition nibble at 0x0F 0x80..=0x8F. For a short Jcc the
        // opcode byte is always the first byte (no legacy prefixes are
        // meaningful on a branch opcode).
        self.bytes.first().map(|opcode_byte| opcode_byte & 0x0F)
    }

    /// How the (sole) branch/call operand is encoded.
    pub fn branch_operand(&self) -> BranchOperand {
        match self.inner.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                BranchOperand::Relative
            }
            OpKind::FarBranch16 | OpKind::FarBranch32 => BranchOperand::FarPointer,
            _ => BranchOperand::Other,
        }
    }

    /// Absolute target of a relative (`JIMM`) branch/call.
    pub fn near_branch_target(&self) -> Option<u64> {
        match self.branch_operand() {
            BranchOperand::Relative => Some(self.inner.near_branch_target()),
            _ => None,
        }
    }

    /// `(segment, offset)` of a far (`PTR`) branch, resolved the way a
    /// real-mode/segmented jump thunk would: `(segment << 4) + offset`.
    pub fn far_branch_absolute_target(&self) -> Option<u64> {
        match self.branch_operand() {
            BranchOperand::FarPointer => {
                let selector = self.inner.far_branch_selector() as u64;
                let offset = self.inner.far_branch32() as u64;
                Some((selector << 4) + offset)
            }
            _ => None,
        }
    }

    /// `true` if this instruction addresses memory via `[rip + disp32]`.
    pub fn is_rip_relative(&self) -> bool {
        self.inner.is_ip_rel_memory_operand()
    }

    /// The absolute address `[rip + disp32]` resolves to at this
    /// instruction's original location.
    pub fn rip_relative_target(&self) -> Option<u64> {
        if self.is_rip_relative() {
            Some(self.inner.ip_rel_memory_address())
        } else {
            None
        }
    }

    /// Mnemonic, for logging.
    pub fn mnemonic(&self) -> Mnemonic {
        self.inner.mnemonic()
    }

    pub(crate) fn inner(&self) -> &Instruction {
        &self.inner
    }
}

/// A restartable decode cursor: owns only an address, never a buffer.
/// Each call to [`InstructionCursor::next`] reads just enough live memory
/// to decode one instruction and advances.
pub struct InstructionCursor {
    address: usize,
}

impl InstructionCursor {
    /// Positions the cursor at `address`.
    pub fn new(address: usize) -> Self {
        Self { address }
    }

    /// Current position.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Repositions the cursor without decoding.
    pub fn seek(&mut self, address: usize) {
        self.address = address;
    }

    /// Decodes the instruction at the current position and advances past
    /// it. Reads live process memory through a raw pointer — the caller
    /// is responsible for only pointing this at readable, executable code.
    ///
    /// # Safety
    /// `self.address()` must refer to at least `MAX_INSTRUCTION_LEN`
    /// readable bytes (true for any function prologue not at the very
    /// end of a mapped region).
    pub unsafe fn next(&mut self) -> HookResult<DecodedInstruction> {
        let slice = std::slice::from_raw_parts(self.address as *const u8, MAX_INSTRUCTION_LEN);
        let mut decoder = Decoder::with_ip(BITNESS, slice, self.address as u64, DecoderOptions::NONE);
        let inner = decoder.decode();

        if inner.is_invalid() {
            return Err(HookError::DecodeFailure {
                address: self.address,
            });
        }

        let len = inner.len();
        let bytes = slice[..len].to_vec();
        self.address += len;

        Ok(DecodedInstruction { inner, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], ip: u64) -> DecodedInstruction {
        let mut padded = bytes.to_vec();
        padded.resize(MAX_INSTRUCTION_LEN, 0x90);
        let mut decoder = Decoder::with_ip(BITNESS, &padded, ip, DecoderOptions::NONE);
        let inner = decoder.decode();
        DecodedInstruction {
            bytes: padded[..inner.len()].to_vec(),
            inner,
        }
    }

    #[test]
    fn recognizes_unconditional_near_jmp() {
        // jmp rel32 +0
        let instr = decode(&[0xE9, 0x00, 0x00, 0x00, 0x00], 0x1000);
        assert!(instr.is_unconditional_jmp());
        assert_eq!(instr.branch_operand(), BranchOperand::Relative);
        assert_eq!(instr.near_branch_target(), Some(0x1005));
    }

    #[test]
    fn recognizes_short_unconditional_jmp() {
        let instr = decode(&[0xEB, 0x10], 0x2000);
        assert!(instr.is_short_unconditional_jmp());
    }

    #[test]
    fn recognizes_rip_relative_mov() {
        // mov rax, [rip+0x10]: 48 8B 05 10 00 00 00
        let instr = decode(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00], 0x3000);
        assert!(instr.is_rip_relative());
        assert_eq!(instr.rip_relative_target(), Some(0x3007 + 0x10));
    }

    #[test]
    fn position_independent_mov_has_no_branch_operand() {
        // mov eax, 1: B8 01 00 00 00
        let instr = decode(&[0xB8, 0x01, 0x00, 0x00, 0x00], 0x4000);
        assert_eq!(instr.branch_operand(), BranchOperand::Other);
        assert!(!instr.is_rip_relative());
    }
}

//! Error taxonomy for the hooking engine.
//!
//! Mirrors the error kinds a hook lifecycle can fail with: resolving a
//! symbol, decoding a prologue, relocating an instruction, allocating a
//! stub, changing page protection, or controlling other threads.

use thiserror::Error;

/// Errors produced while creating, installing, or removing a hook.
#[derive(Debug, Error)]
pub enum HookError {
    /// A requested symbol could not be found in any loaded module.
    #[error("symbol not found: {0}")]
    LookupFailure(String),

    /// The disassembler rejected a byte sequence in the prologue.
    #[error("failed to decode instruction at {address:#x}")]
    DecodeFailure {
        /// Address the decoder was positioned at when it failed.
        address: usize,
    },

    /// An instruction in the overwrite window cannot be safely relocated.
    #[error("instruction at {address:#x} cannot be relocated: {reason}")]
    UnrelocatableInstruction {
        /// Address of the offending instruction.
        address: usize,
        /// Human-readable reason (RIP-relative overflow, negative-offset
        /// call into the moved window, unsupported branch form, ...).
        reason: &'static str,
    },

    /// The stub allocator could not produce a slot near the target.
    #[error("out of memory: could not allocate a stub near {hint:#x}")]
    OutOfMemory {
        /// Hint address the allocation was requested near.
        hint: usize,
    },

    /// A page-protection change was refused by the OS.
    #[error("memory permission change at {address:#x} failed: {source}")]
    PermissionFailure {
        /// Address of the region whose protection could not be changed.
        address: usize,
        #[source]
        source: std::io::Error,
    },

    /// Thread enumeration, suspension, or IP rewrite was refused by the OS.
    #[error("thread control operation failed: {0}")]
    ThreadControlFailure(String),

    /// The hook is in a state that does not support the requested
    /// operation (e.g. asking for the trampoline before the first install).
    #[error("invalid hook state: {0}")]
    InvalidState(&'static str),
}

/// Result alias used throughout the engine.
pub type HookResult<T> = Result<T, HookError>;

//! In-process x86/x64 Windows function hooking.
//!
//! Given a target function's address (or a thunk that forwards to it)
//! and a detour function, [`hook::Hook::create`] resolves the real entry
//! point, decides how many bytes of its prologue must be overwritten to
//! redirect execution, relocates those bytes into a freshly allocated
//! trampoline, and leaves everything staged for [`hook::Hook::install`]
//! to patch live code.
//!
//! ```text
//! plan::resolve_entry_point       -- chase forwarding jumps
//! plan::plan_prologue             -- decide overwrite window, decode prologue
//! relocate::relocate              -- move the displaced instructions
//! stub::allocate, stub::write     -- reserve a slot, then lay relocated code + trailers into it
//! hook::Hook::install             -- patch live code under thread/priority/protection guards
//! ```

pub mod alloc;
pub mod deadzone;
pub mod decode;
pub mod encode;
pub mod error;
pub mod hook;
pub mod memory;
pub mod plan;
pub mod relocate;
pub mod stub;
pub mod threads;

pub use error::{HookError, HookResult};
pub use hook::Hook;

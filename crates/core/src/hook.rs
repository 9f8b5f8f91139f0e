//! The hook record and its lifecycle: create, install, remove, read the
//! trampoline, destroy (§4.1, §4.9).
//!
//! A [`Hook`] owns exactly one patch site (the resolved entry point of
//! the target function) and, when the patch is a [`PatchForm::Deadzone`]
//! proxy, the deadzone it borrowed too. Installing and removing both go
//! through [`Hook::patch_live_code`], which suspends every other thread
//! (unless the hook is hotpatchable), elevates its own priority, and
//! flips page protection for the span of each write.

use std::sync::Arc;

use crate::alloc::CodeAllocator;
use crate::encode;
use crate::error::{HookError, HookResult};
use crate::memory::{self, ProtectionGuard};
use crate::plan::{self, PatchForm, ProloguePlan, SecondaryForm};
use crate::stub::{self, Stub};
use crate::threads::{PausedThreads, PriorityBoost};

/// Lifecycle state of a [`Hook`]. Only `Created` and `Installed` are
/// externally observable; the others exist to make illegal sequences
/// (installing twice, reading the trampoline before the first install)
/// reportable as [`HookError::InvalidState`] rather than silently wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Installed,
    Removed,
    Destroyed,
}

/// One installed (or installable) function hook.
pub struct Hook {
    entry: usize,
    replacement_entry: usize,
    allocator: Arc<CodeAllocator>,
    plan: ProloguePlan,
    stub: Stub,
    /// Bytes originally at `[entry, entry + plan.overwrite_size)`.
    backup_prologue: Vec<u8>,
    /// When `plan.form` is `Deadzone`, the borrowed deadzone's address
    /// and its original bytes over the range the secondary jump writes.
    proxy_backup: Option<(usize, Vec<u8>)>,
    state: State,
}

impl Hook {
    /// Resolves `target`'s true entry point (chasing forwarding jumps),
    /// allocates a stub near it, plans the prologue rewrite against
    /// `replacement`, and relocates the displaced prologue into the
    /// stub. The hook is not yet installed; the original function still
    /// runs unmodified until [`Hook::install`].
    ///
    /// # Safety
    /// `target` and `replacement` must both be valid, readable,
    /// executable code addresses; `target` must name a real function
    /// entry point (not mid-instruction).
    pub unsafe fn create(
        target: usize,
        replacement: usize,
        allocator: Arc<CodeAllocator>,
    ) -> HookResult<Self> {
        let entry = plan::resolve_entry_point(target)?;

        let slot = stub::allocate(&allocator, entry)?;
        let stub_base = slot.address();

        let prologue_plan = plan::plan_prologue(entry, replacement, stub_base)?;

        let backup_prologue =
            std::slice::from_raw_parts(entry as *const u8, prologue_plan.overwrite_size).to_vec();
        let proxy_backup = match prologue_plan.form {
            PatchForm::Deadzone { deadzone, secondary_form } => {
                let len = match secondary_form {
                    SecondaryForm::NearJmp => 5,
                    SecondaryForm::AbsoluteJmp => 14,
                };
                let bytes = std::slice::from_raw_parts(deadzone.address as *const u8, len).to_vec();
                Some((deadzone.address, bytes))
            }
            _ => None,
        };

        let stub = stub::write(slot, &prologue_plan, replacement)?;

        tracing::debug!(
            target = format_args!("{:#x}", target),
            entry = format_args!("{:#x}", entry),
            replacement = format_args!("{:#x}", replacement),
            form = ?prologue_plan.form,
            overwrite_size = prologue_plan.overwrite_size,
            hotpatchable = prologue_plan.hotpatchable,
            "hook created"
        );

        Ok(Self {
            entry,
            replacement_entry: replacement,
            allocator,
            plan: prologue_plan,
            stub,
            backup_prologue,
            proxy_backup,
            state: State::Created,
        })
    }

    /// The resolved entry point this hook patches.
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// The address a replacement should call to run the original,
    /// displaced prologue followed by the rest of the original function.
    ///
    /// # Errors
    /// Returns [`HookError::InvalidState`] before the first [`install`](Self::install).
    pub fn trampoline(&self) -> HookResult<usize> {
        match self.state {
            State::Installed | State::Removed => Ok(self.stub.trampoline_address()),
            State::Created => Err(HookError::InvalidState(
                "trampoline is not available before the first install",
            )),
            State::Destroyed => Err(HookError::InvalidState("hook has been destroyed")),
        }
    }

    /// Patches live code to redirect `entry` to the replacement.
    /// Idempotent: installing an already-installed hook is a no-op that
    /// still returns success.
    pub fn install(&mut self) -> HookResult<()> {
        match self.state {
            State::Installed => return Ok(()),
            State::Created | State::Removed => {}
            State::Destroyed => return Err(HookError::InvalidState("hook has been destroyed")),
        }

        let writes = self.build_patch_writes()?;
        self.patch_live_code(&writes)?;

        self.state = State::Installed;
        tracing::info!(entry = format_args!("{:#x}", self.entry), "hook installed");
        Ok(())
    }

    /// Restores the original bytes at the patch site (and any borrowed
    /// deadzone). Idempotent.
    pub fn remove(&mut self) -> HookResult<()> {
        match self.state {
            State::Installed => {}
            State::Created | State::Removed => return Ok(()),
            State::Destroyed => return Err(HookError::InvalidState("hook has been destroyed")),
        }

        let mut writes = vec![(self.entry, self.backup_prologue.clone())];
        if let Some((addr, bytes)) = &self.proxy_backup {
            writes.push((*addr, bytes.clone()));
        }
        self.patch_live_code(&writes)?;

        self.state = State::Removed;
        tracing::info!(entry = format_args!("{:#x}", self.entry), "hook removed");
        Ok(())
    }

    /// Removes the hook if installed, releases the trampoline stub, and
    /// consumes the hook. After this call the entry point's original
    /// code is untouched and no further operations on this hook are
    /// possible.
    pub fn destroy(mut self) -> HookResult<()> {
        if self.state == State::Installed {
            self.remove()?;
        }
        self.allocator.release(self.stub.trampoline_address());
        self.state = State::Destroyed;
        tracing::debug!(entry = format_args!("{:#x}", self.entry), "hook destroyed");
        Ok(())
    }

    /// Builds the `(address, bytes)` writes needed to redirect
    /// `self.entry` to `self.replacement_entry`, per the chosen
    /// [`PatchForm`].
    fn build_patch_writes(&self) -> HookResult<Vec<(usize, Vec<u8>)>> {
        match self.plan.form {
            PatchForm::Deadzone { deadzone, secondary_form } => {
                let secondary_bytes = match secondary_form {
                    SecondaryForm::NearJmp => {
                        let rel = encode::rel32(deadzone.address, 5, self.replacement_entry).ok_or(
                            HookError::UnrelocatableInstruction {
                                address: deadzone.address,
                                reason: "deadzone cannot reach replacement within rel32",
                            },
                        )?;
                        encode::near_jmp(rel).to_vec()
                    }
                    SecondaryForm::AbsoluteJmp => {
                        encode::absolute_jmp(self.replacement_entry as u64).to_vec()
                    }
                };

                let entry_rel = encode::rel8(self.entry, 2, deadzone.address).ok_or(
                    HookError::UnrelocatableInstruction {
                        address: self.entry,
                        reason: "deadzone is not within rel8 of the function entry",
                    },
                )?;
                let mut entry_bytes = encode::short_jmp(entry_rel).to_vec();
                entry_bytes.resize(self.plan.overwrite_size, encode::NOP);

                Ok(vec![(self.entry, entry_bytes), (deadzone.address, secondary_bytes)])
            }
            PatchForm::Direct => {
                let rel = encode::rel32(self.entry, 5, self.replacement_entry).ok_or(
                    HookError::UnrelocatableInstruction {
                        address: self.entry,
                        reason: "replacement is not within rel32 of the function entry",
                    },
                )?;
                let mut bytes = encode::near_jmp(rel).to_vec();
                bytes.resize(self.plan.overwrite_size, encode::NOP);
                Ok(vec![(self.entry, bytes)])
            }
            PatchForm::StubTrailerProxy => {
                let trailer = self.stub.replacement_trailer_address().ok_or(
                    HookError::InvalidState("stub has no replacement trailer on this target"),
                )?;
                let rel = encode::rel32(self.entry, 5, trailer).ok_or(
                    HookError::UnrelocatableInstruction {
                        address: self.entry,
                        reason: "stub's far trailer is not within rel32 of the function entry",
                    },
                )?;
                let mut bytes = encode::near_jmp(rel).to_vec();
                bytes.resize(self.plan.overwrite_size, encode::NOP);
                Ok(vec![(self.entry, bytes)])
            }
            PatchForm::Absolute => {
                let mut bytes = encode::absolute_jmp(self.replacement_entry as u64).to_vec();
                bytes.resize(self.plan.overwrite_size, encode::NOP);
                Ok(vec![(self.entry, bytes)])
            }
        }
    }

    /// Writes `writes` under full safety discipline: unless the hook is
    /// hotpatchable, every other thread in the process is suspended,
    /// this thread's priority is raised, each target page is made
    /// writable, the bytes are written, and any suspended thread whose
    /// IP landed inside `[entry, entry + overwrite_size)` is rewritten
    /// to the equivalent offset in the stub's prologue area before
    /// anything is resumed.
    fn patch_live_code(&mut self, writes: &[(usize, Vec<u8>)]) -> HookResult<()> {
        let skip_suspension = self.plan.hotpatchable;

        let _priority = (!skip_suspension).then(PriorityBoost::engage);
        let paused = if skip_suspension {
            None
        } else {
            Some(PausedThreads::suspend_all_others()?)
        };

        if let Some(paused) = &paused {
            for thread in paused.iter() {
                let ip = thread.instruction_pointer()?;
                if ip >= self.entry && ip < self.entry + self.plan.overwrite_size {
                    let offset = ip - self.entry;
                    thread.set_instruction_pointer(self.stub.trampoline_address() + offset)?;
                }
            }
        }

        for (address, bytes) in writes {
            let guard = ProtectionGuard::writable(*address as *mut u8, bytes.len())?;
            if skip_suspension {
                Self::atomic_patch(*address, bytes);
            } else {
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), *address as *mut u8, bytes.len());
                }
            }
            drop(guard);
            memory::flush_instruction_cache(*address as *const u8, bytes.len());
        }

        // `paused` and `_priority` drop here, resuming every thread and
        // restoring this thread's priority.
        Ok(())
    }

    /// Writes a hotpatchable overwrite (one whose whole window is a single
    /// original instruction, so no other thread is suspended) such that a
    /// concurrent thread whose IP equals `address` never observes a torn
    /// mix of old and new bytes.
    ///
    /// No native atomic type matches a 2-, 5-, or 14-byte window, so this
    /// doesn't rely on one covering the whole write. Instead every byte
    /// but the first is written freely, then the first byte is flipped
    /// with a single atomic store. While the old first byte is still in
    /// place, the instruction at `address` still decodes exactly as the
    /// original regardless of what has been written after it, since
    /// nothing re-enters mid-instruction; once the flip lands, it decodes
    /// as the new jump. The transition is therefore a single indivisible
    /// step from one concurrent reader's perspective.
    fn atomic_patch(address: usize, bytes: &[u8]) {
        use std::sync::atomic::{AtomicU8, Ordering};

        if bytes.len() > 1 {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes[1..].as_ptr(), (address + 1) as *mut u8, bytes.len() - 1);
            }
        }
        unsafe {
            (*(address as *const AtomicU8)).store(bytes[0], Ordering::SeqCst);
        }
    }
}

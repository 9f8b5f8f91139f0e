//! ABI-stable C surface over `detour-core` (§6 External interfaces).
//!
//! Exposes opaque `HookHandle`s through a slot map so C callers never see
//! a real pointer to a [`detour_core::Hook`]; every entry point here is
//! `extern "C"` and panics never cross the FFI boundary (`catch_unwind`
//! turns a panic into the same failure shape a caller already has to
//! handle). The typed per-signature wrapper factory layer named in §6
//! sits above this surface and is out of scope — see the trait sketch at
//! the bottom of this file for the shape a caller would build against.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use detour_core::alloc::CodeAllocator;
use detour_core::hook::Hook;
use detour_core::stub;

new_key_type! {
    struct HookKey;
}

/// Opaque handle returned to C callers. `0` is never a valid handle.
pub type HookHandle = u64;

struct Registry {
    hooks: SlotMap<HookKey, Hook>,
    allocator: Weak<CodeAllocator>,
}

static REGISTRY: Mutex<Option<Registry>> = Mutex::new(None);

fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    let mut guard = REGISTRY.lock();
    let registry = guard.get_or_insert_with(|| Registry {
        hooks: SlotMap::with_key(),
        allocator: Weak::new(),
    });
    f(registry)
}

/// Returns the process-wide stub allocator, creating it if this is the
/// first live hook (§5: "created on first record; torn down when the
/// last record is destroyed" — the `Weak` here implements exactly that:
/// once every `Hook` holding a strong `Arc` is destroyed, the allocator
/// is dropped, and the next `create` makes a fresh one).
fn shared_allocator(registry: &mut Registry) -> Arc<CodeAllocator> {
    if let Some(existing) = registry.allocator.upgrade() {
        return existing;
    }
    let allocator = Arc::new(CodeAllocator::new(stub::SLOT_SIZE));
    registry.allocator = Arc::downgrade(&allocator);
    allocator
}

fn key_to_handle(key: HookKey) -> HookHandle {
    use slotmap::Key;
    key.data().as_ffi()
}

fn handle_to_key(handle: HookHandle) -> Option<HookKey> {
    use slotmap::KeyData;
    if handle == 0 {
        return None;
    }
    Some(KeyData::from_ffi(handle).into())
}

/// Creates a hook redirecting `function_ptr` to `replacement_ptr`.
/// Returns `0` on any failure (symbol unrelocatable, out of memory,
/// decode failure, ...); the reason is logged via `tracing::error!`.
///
/// # Safety
/// `function_ptr` and `replacement_ptr` must be valid, executable code
/// addresses in the current process, and `function_ptr` must be a real
/// function entry point.
#[no_mangle]
pub unsafe extern "C" fn detour_create(function_ptr: usize, replacement_ptr: usize) -> HookHandle {
    let result = catch_unwind(AssertUnwindSafe(|| {
        with_registry(|registry| {
            let allocator = shared_allocator(registry);
            match unsafe { Hook::create(function_ptr, replacement_ptr, allocator) } {
                Ok(hook) => Some(key_to_handle(registry.hooks.insert(hook))),
                Err(e) => {
                    tracing::error!(error = %e, "detour_create failed");
                    None
                }
            }
        })
    }));

    match result {
        Ok(Some(handle)) => handle,
        _ => 0,
    }
}

/// Resolves `symbol_name` (optionally scoped to `module_hint`) via
/// `detour-resolver`, then delegates to [`detour_create`].
///
/// # Safety
/// `replacement_ptr` must be a valid, executable code address in the
/// current process. `symbol_name` and `module_hint` (if non-null) must
/// be valid, NUL-terminated C strings.
#[no_mangle]
pub unsafe extern "C" fn detour_create_by_name(
    symbol_name: *const std::os::raw::c_char,
    replacement_ptr: usize,
    module_hint: *const std::os::raw::c_char,
) -> HookHandle {
    if symbol_name.is_null() {
        return 0;
    }

    let symbol = match std::ffi::CStr::from_ptr(symbol_name).to_str() {
        Ok(s) => s,
        Err(_) => return 0,
    };
    let hint = if module_hint.is_null() {
        None
    } else {
        match std::ffi::CStr::from_ptr(module_hint).to_str() {
            Ok(s) => Some(s),
            Err(_) => return 0,
        }
    };

    match detour_resolver::resolve(symbol, hint) {
        Ok(address) => detour_create(address, replacement_ptr),
        Err(e) => {
            tracing::error!(symbol, error = %e, "detour_create_by_name: resolve failed");
            0
        }
    }
}

/// Installs the hook identified by `handle`. Returns `false` if the
/// handle is unknown or the install fails; idempotent otherwise.
#[no_mangle]
pub extern "C" fn detour_install(handle: HookHandle) -> bool {
    let result = catch_unwind(AssertUnwindSafe(|| {
        with_registry(|registry| {
            let Some(key) = handle_to_key(handle) else { return false };
            let Some(hook) = registry.hooks.get_mut(key) else { return false };
            match hook.install() {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(error = %e, "detour_install failed");
                    false
                }
            }
        })
    }));
    result.unwrap_or(false)
}

/// Removes the hook identified by `handle`, restoring original bytes.
/// A no-op on an unknown handle (matches §7: "remove never returns
/// failure to the user").
#[no_mangle]
pub extern "C" fn detour_remove(handle: HookHandle) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        with_registry(|registry| {
            if let Some(key) = handle_to_key(handle) {
                if let Some(hook) = registry.hooks.get_mut(key) {
                    if let Err(e) = hook.remove() {
                        tracing::error!(error = %e, "detour_remove failed");
                    }
                }
            }
        })
    }));
}

/// Returns the trampoline address for `handle`, or `0` if the handle is
/// unknown or the hook has never been installed.
#[no_mangle]
pub extern "C" fn detour_trampoline(handle: HookHandle) -> usize {
    let result = catch_unwind(AssertUnwindSafe(|| {
        with_registry(|registry| {
            let key = handle_to_key(handle)?;
            let hook = registry.hooks.get(key)?;
            hook.trampoline().ok()
        })
    }));
    result.ok().flatten().unwrap_or(0)
}

/// Removes (if installed), releases the stub, and forgets `handle`.
#[no_mangle]
pub extern "C" fn detour_destroy(handle: HookHandle) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        with_registry(|registry| {
            let Some(key) = handle_to_key(handle) else { return };
            if let Some(hook) = registry.hooks.remove(key) {
                if let Err(e) = hook.destroy() {
                    tracing::error!(error = %e, "detour_destroy failed");
                }
            }
        })
    }));
}

/// Convenience for C callers: installs an `env-filter`-configured
/// `tracing-subscriber` writing to stderr. Optional — `detour-core`
/// itself never installs a subscriber, matching the library/binary split
/// the rest of the workspace follows.
#[no_mangle]
pub extern "C" fn detour_init_default_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Sketch of the typed wrapper layer named in §6. Out of scope here: a
/// real implementation would generate one of these per hooked function
/// signature, backed by [`detour_trampoline`]'s raw pointer.
pub trait TypedTrampoline<F> {
    /// Returns the trampoline cast to the original function's signature.
    ///
    /// # Safety
    /// The caller must know `F` matches the hooked function's real ABI
    /// and signature; nothing here can check that.
    unsafe fn typed_trampoline(&self, handle: HookHandle) -> Option<F>;
}

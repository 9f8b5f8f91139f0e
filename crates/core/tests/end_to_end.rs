//! End-to-end lifecycle scenarios (§8): forwarding-thunk resolution and
//! the full create/install/remove/destroy round trip against real,
//! compiled functions. Windows-only, since patching live code and
//! suspending threads are both Windows-specific.

#![cfg(windows)]

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use detour_core::alloc::CodeAllocator;
use detour_core::encode;
use detour_core::hook::Hook;
use detour_core::memory;
use detour_core::plan;
use detour_core::stub;

fn fresh_allocator() -> Arc<CodeAllocator> {
    Arc::new(CodeAllocator::new(stub::SLOT_SIZE))
}

// --- Scenario: resolving a forwarding thunk down to a real function ---

#[inline(never)]
extern "C" fn real_target() -> i32 {
    std::hint::black_box(42)
}

#[test]
fn resolves_a_forwarding_jump_thunk_to_its_real_target() {
    let real = real_target as usize;

    let thunk_page = unsafe { memory::alloc_near(real, memory::page_size()) }.unwrap();
    let thunk = thunk_page.as_ptr() as usize;

    let rel = encode::rel32(thunk, 5, real).expect("real_target must be rel32-reachable in-process");
    let jmp = encode::near_jmp(rel);
    unsafe {
        std::ptr::copy_nonoverlapping(jmp.as_ptr(), thunk_page.as_ptr(), jmp.len());
    }
    memory::flush_instruction_cache(thunk_page.as_ptr(), jmp.len());

    let resolved = unsafe { plan::resolve_entry_point(thunk) }.unwrap();
    assert_eq!(resolved, real);

    memory::free(thunk_page);
}

// --- Scenario: install redirects, trampoline recovers the original,
// remove restores it, destroy releases the stub. ---

static CALL_COUNT: AtomicI32 = AtomicI32::new(0);
static TRAMPOLINE: AtomicUsize = AtomicUsize::new(0);

#[inline(never)]
#[no_mangle]
extern "C" fn hookable_add_one(x: i32) -> i32 {
    std::hint::black_box(x) + 1
}

#[inline(never)]
#[no_mangle]
extern "C" fn hookable_add_one_detour(x: i32) -> i32 {
    CALL_COUNT.fetch_add(1, Ordering::SeqCst);
    let trampoline = TRAMPOLINE.load(Ordering::SeqCst);
    let original: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(trampoline) };
    original(x) + 10
}

#[test]
fn install_redirects_trampoline_recovers_original_remove_restores() {
    CALL_COUNT.store(0, Ordering::SeqCst);

    let target = hookable_add_one as usize;
    let replacement = hookable_add_one_detour as usize;
    let allocator = fresh_allocator();

    assert_eq!(hookable_add_one(5), 6);

    let mut hook = unsafe { Hook::create(target, replacement, allocator) }.unwrap();
    assert!(hook.trampoline().is_err(), "trampoline is undefined before the first install");

    hook.install().unwrap();
    TRAMPOLINE.store(hook.trampoline().unwrap(), Ordering::SeqCst);

    assert_eq!(hookable_add_one(5), 16);
    assert_eq!(CALL_COUNT.load(Ordering::SeqCst), 1);

    // Idempotent install.
    hook.install().unwrap();
    assert_eq!(hookable_add_one(5), 16);
    assert_eq!(CALL_COUNT.load(Ordering::SeqCst), 2);

    hook.remove().unwrap();
    assert_eq!(hookable_add_one(5), 6);
    assert_eq!(CALL_COUNT.load(Ordering::SeqCst), 2, "removed hook must not call the detour again");

    // Idempotent remove.
    hook.remove().unwrap();
    assert_eq!(hookable_add_one(5), 6);

    hook.destroy().unwrap();
}

#[test]
fn four_hooks_install_and_remove_independently() {
    #[inline(never)]
    #[no_mangle]
    extern "C" fn f_a(x: i32) -> i32 {
        std::hint::black_box(x) * 2
    }
    #[inline(never)]
    #[no_mangle]
    extern "C" fn f_a_detour(x: i32) -> i32 {
        std::hint::black_box(x) * 2 + 1
    }
    #[inline(never)]
    #[no_mangle]
    extern "C" fn f_b(x: i32) -> i32 {
        std::hint::black_box(x) * 3
    }
    #[inline(never)]
    #[no_mangle]
    extern "C" fn f_b_detour(x: i32) -> i32 {
        std::hint::black_box(x) * 3 + 1
    }

    let allocator = fresh_allocator();
    let mut a = unsafe { Hook::create(f_a as usize, f_a_detour as usize, allocator.clone()) }.unwrap();
    let mut b = unsafe { Hook::create(f_b as usize, f_b_detour as usize, allocator) }.unwrap();

    a.install().unwrap();
    b.install().unwrap();
    assert_eq!(f_a(10), 21);
    assert_eq!(f_b(10), 31);

    a.remove().unwrap();
    assert_eq!(f_a(10), 20);
    assert_eq!(f_b(10), 31);

    b.remove().unwrap();
    assert_eq!(f_b(10), 30);

    a.install().unwrap();
    b.install().unwrap();
    assert_eq!(f_a(10), 21);
    assert_eq!(f_b(10), 31);

    a.destroy().unwrap();
    b.destroy().unwrap();
}

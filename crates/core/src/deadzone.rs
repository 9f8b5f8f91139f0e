//! Deadzone discovery: finds a contiguous run of inert padding bytes
//! (`NOP`/`INT3`) near a function entry that can host an intermediate
//! jump, letting the overwrite at the function entry itself shrink to a
//! 2-byte short jump.

use crate::decode::InstructionCursor;
use crate::encode::{INT3, NOP};
use crate::memory;

/// A qualifying deadzone: its start address and length in bytes.
#[derive(Debug, Clone, Copy)]
pub struct Deadzone {
    pub address: usize,
    pub len: usize,
}

/// How far forward the second pass is willing to scan looking for inert
/// padding between real instructions.
const FORWARD_HORIZON: usize = 127;

/// Finds the first qualifying deadzone of at least `min_len` bytes,
/// trying a backward scan (padding immediately preceding `function_entry`
/// on the same page) before a forward scan (padding within the first
/// `FORWARD_HORIZON` bytes of the function).
///
/// The backward scan stops at the first non-inert byte, the page
/// boundary containing `function_entry`, or after `max(min_len, 127)`
/// bytes, whichever comes first — the same radius the forward scan uses.
pub fn find_deadzone(function_entry: usize, min_len: usize) -> Option<Deadzone> {
    if let Some(zone) = scan_backward(function_entry, min_len) {
        return Some(zone);
    }
    scan_forward(function_entry, min_len)
}

fn is_inert(byte: u8) -> bool {
    byte == NOP || byte == INT3
}

fn scan_backward(function_entry: usize, min_len: usize) -> Option<Deadzone> {
    let page_start = memory::align_down(function_entry);
    let horizon = min_len.max(FORWARD_HORIZON);
    let floor = function_entry.saturating_sub(horizon).max(page_start);

    let mut count = 0usize;
    let mut cursor = function_entry;
    while cursor > floor {
        let candidate = cursor - 1;
        let byte = unsafe { *(candidate as *const u8) };
        if !is_inert(byte) {
            break;
        }
        count += 1;
        cursor = candidate;
        if count >= min_len {
            // Keep counting isn't necessary once satisfied, but continuing
            // would only grow the zone; stop here to return the minimal
            // qualifying window starting at `cursor`.
            return Some(Deadzone {
                address: cursor,
                len: count,
            });
        }
    }

    None
}

fn scan_forward(function_entry: usize, min_len: usize) -> Option<Deadzone> {
    let mut cursor = InstructionCursor::new(function_entry);
    let mut zone_start: Option<usize> = None;
    let mut zone_len = 0usize;

    while cursor.address() < function_entry + FORWARD_HORIZON {
        let before = cursor.address();
        let instr = unsafe { cursor.next() }.ok()?;

        let is_inert_instr = instr.raw_bytes().iter().all(|&b| is_inert(b));
        if is_inert_instr {
            if zone_start.is_none() {
                zone_start = Some(before);
            }
            zone_len += instr.len();
            if zone_len >= min_len {
                return zone_start.map(|address| Deadzone {
                    address,
                    len: zone_len,
                });
            }
        } else {
            zone_start = None;
            zone_len = 0;
        }
    }

    None
}

//! Index arithmetic shared by trace and memory bisection.
//!
//! A bisection over `width` rounds searches `[0, 2^width)`. Round `r` probes
//! the midpoint of the interval left by the first `r` answer bits (MSB
//! first): a 1 moves the search right of the probe, a 0 keeps it left. After
//! `width` rounds the answer bits, read as a number, are the pinned index
//! `lo`: the last index the verifier agrees with, `lo + 1` being the first
//! she disputes.
//!
//! Every index `k` in `(0, 2^width)` is probed in exactly one round,
//! `width - 1 - trailing_zeros(k)`, which is how scripts locate the
//! commitment holding a given tree node or trace root.

/// Index probed in round `bits.len()` after the answers `bits`.
pub fn next_index(bits: &[bool], width: usize) -> u32 {
    debug_assert!(bits.len() < width);
    prefix(bits, width) | (1 << (width - 1 - bits.len()))
}

/// Index pinned by a complete answer sequence.
pub fn final_index(bits: &[bool], width: usize) -> u32 {
    debug_assert!(bits.len() == width);
    prefix(bits, width)
}

fn prefix(bits: &[bool], width: usize) -> u32 {
    bits.iter()
        .enumerate()
        .filter(|(_, bit)| **bit)
        .fold(0, |acc, (i, _)| acc | (1 << (width - 1 - i)))
}

/// Round in which `index` is probed, or `None` for 0 and indices past the range.
pub fn probe_round(index: u32, width: usize) -> Option<usize> {
    if index == 0 || u64::from(index) >= 1u64 << width {
        return None;
    }
    Some(width - 1 - index.trailing_zeros() as usize)
}

/// Round whose probe is the state before the step at `lo`; `None` means the
/// initial state, which is never probed.
pub fn prev_round(lo: u32, width: usize) -> Option<usize> {
    probe_round(lo, width)
}

/// Round whose probe is the state after the step at `lo`; `None` when
/// `lo` is the last index and that state is never probed.
pub fn next_round(lo: u32, width: usize) -> Option<usize> {
    probe_round(lo.checked_add(1)?, width)
}

/// Plays a full bisection against `agrees` and returns the pinned index.
///
/// `agrees(k)` answers the probe at index `k`. Used by strategies that keep
/// no per-round state and by tests.
pub fn bisect(width: usize, mut agrees: impl FnMut(u32) -> bool) -> (u32, Vec<bool>) {
    let mut bits = Vec::with_capacity(width);
    while bits.len() < width {
        let probe = next_index(&bits, width);
        bits.push(agrees(probe));
    }
    (final_index(&bits, width), bits)
}

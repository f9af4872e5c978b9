//! Expansion of truncated packet numbers

use crate::{coding, frame::Ack};

/// Recover the full packet number whose low `n_bits` are `truncated`
///
/// `max_pkt_num` is the highest packet number successfully authenticated so far. The result is
/// whichever of the two candidate windows adjacent to `max_pkt_num + 1` lies closest to it, ties
/// going to the higher window. All arithmetic wraps, so every input yields an answer.
pub fn adjust(max_pkt_num: u64, truncated: u64, n_bits: u32) -> u64 {
    let Some(win) = 1u64.checked_shl(n_bits) else {
        return truncated;
    };
    let expected = max_pkt_num.saturating_add(1);
    let base = expected & !(win - 1);
    let below = base | truncated;
    let above = base.wrapping_add(win) | truncated;
    if below.abs_diff(expected) < above.abs_diff(expected) {
        below
    } else {
        above
    }
}

/// Rewrite the packet numbers of a received ACK frame into their full form
///
/// Only the largest acknowledged packet number is absolute; it was written in the narrowest field
/// able to hold it, so that width bounds the number of significant bits. `max_pkt_num` is the
/// highest packet number sent, which no acknowledgement may exceed, so the result is the nearest
/// candidate at or below it. Gaps and block lengths are relative to the largest and keep their
/// order, so after this call [`Ack::iter`] yields full packet numbers for every block.
pub fn adjust_ack_ranges(ack: &mut Ack, max_pkt_num: u64) {
    let bits = coding::pow2_width(ack.largest) as u32 * 8;
    let Some(win) = 1u64.checked_shl(bits) else {
        return;
    };
    let mut largest = adjust(max_pkt_num, ack.largest, bits);
    while largest > max_pkt_num && largest >= win {
        largest -= win;
    }
    ack.largest = largest;
}

use std::{
    collections::{btree_map, BTreeMap},
    ops::RangeInclusive,
};

use crate::frame::{Ack, AckBlock};

/// Packet numbers received from the peer, stored as disjoint inclusive runs
///
/// Keys are the lowest packet number of each run and values the highest.
#[derive(Debug, Default, Clone)]
pub struct RangeSet(BTreeMap<u64, u64>);

impl RangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, x: u64) -> bool {
        self.pred(x).map_or(false, |(_, hi)| hi >= x)
    }

    /// Insert `x`, returning `false` if it was already present
    pub fn insert(&mut self, x: u64) -> bool {
        let mut lo = x;
        let mut hi = x;
        if let Some((pred_lo, pred_hi)) = self.pred(x) {
            if pred_hi >= x {
                return false;
            }
            if pred_hi + 1 == x {
                self.0.remove(&pred_lo);
                lo = pred_lo;
            }
        }
        if let Some(next) = x.checked_add(1) {
            if let Some(succ_hi) = self.0.remove(&next) {
                hi = succ_hi;
            }
        }
        self.0.insert(lo, hi);
        true
    }

    /// Run containing or immediately below `x`
    fn pred(&self, x: u64) -> Option<(u64, u64)> {
        self.0.range(..=x).next_back().map(|(&lo, &hi)| (lo, hi))
    }

    /// Number of disjoint runs
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Forget the lowest run, returning it
    pub fn pop_min(&mut self) -> Option<RangeInclusive<u64>> {
        let (&lo, _) = self.0.iter().next()?;
        let hi = self.0.remove(&lo)?;
        Some(lo..=hi)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter(self.0.iter())
    }

    /// Build an ACK frame describing the highest runs using at most `max_blocks` extra blocks
    ///
    /// Gaps wider than a single block's gap field are bridged with empty blocks.
    pub fn to_ack(&self, delay: u16, max_blocks: usize) -> Option<Ack> {
        let max_blocks = max_blocks.min(usize::from(u8::MAX));
        let mut runs = self.iter().rev();
        let first = runs.next()?;
        let mut ack = Ack {
            largest: *first.end(),
            delay,
            first_block: first.end() - first.start() + 1,
            blocks: Vec::new(),
            timestamps: Vec::new(),
        };
        let mut low = *first.start();
        'runs: for run in runs {
            let mut gap = low - run.end() - 1;
            while gap > u64::from(u8::MAX) {
                if ack.blocks.len() == max_blocks {
                    break 'runs;
                }
                ack.blocks.push(AckBlock {
                    gap: u8::MAX,
                    len: 0,
                });
                gap -= u64::from(u8::MAX);
            }
            if ack.blocks.len() == max_blocks {
                break;
            }
            ack.blocks.push(AckBlock {
                gap: gap as u8,
                len: run.end() - run.start() + 1,
            });
            low = *run.start();
        }
        Some(ack)
    }
}

pub struct Iter<'a>(btree_map::Iter<'a, u64, u64>);

impl Iterator for Iter<'_> {
    type Item = RangeInclusive<u64>;
    fn next(&mut self) -> Option<RangeInclusive<u64>> {
        let (&lo, &hi) = self.0.next()?;
        Some(lo..=hi)
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<RangeInclusive<u64>> {
        let (&lo, &hi) = self.0.next_back()?;
        Some(lo..=hi)
    }
}

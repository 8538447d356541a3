//! Bookkeeping for windows dispatched but not yet acknowledged.
//!
//! Windows may complete in any order when pipelined. The delivered watermark
//! only moves over a contiguous prefix of completed windows, so the cursor
//! never has holes.

use std::collections::BTreeMap;

use crate::types::{SequenceId, SequenceRange};

#[derive(Debug, Clone, Copy)]
struct Slot {
    last: SequenceId,
    done: bool,
}

#[derive(Debug, Default)]
pub struct InFlightWindows {
    delivered: SequenceId,
    /// Keyed by the window's first id.
    windows: BTreeMap<SequenceId, Slot>,
}

impl InFlightWindows {
    pub fn new(delivered: SequenceId) -> Self {
        InFlightWindows {
            delivered,
            windows: BTreeMap::new(),
        }
    }

    pub fn delivered(&self) -> SequenceId {
        self.delivered
    }

    /// Windows dispatched and not yet folded into the watermark.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// The id the next window must start after.
    pub fn highest(&self) -> SequenceId {
        self.windows
            .values()
            .next_back()
            .map_or(self.delivered, |slot| slot.last)
    }

    /// Registers a new window, which must lie after every open window.
    pub fn open(&mut self, first: SequenceId, last: SequenceId) {
        debug_assert!(first > self.highest() && first <= last);
        self.windows.insert(first, Slot { last, done: false });
    }

    /// Marks a window complete.
    ///
    /// Returns the new watermark if it moved.
    pub fn complete(&mut self, first: SequenceId) -> Option<SequenceId> {
        if let Some(slot) = self.windows.get_mut(&first) {
            slot.done = true;
        }
        self.fold()
    }

    /// Completes the leading part of a window, up to but excluding `rest`,
    /// which becomes the window's new first id.
    ///
    /// Returns the new watermark if it moved.
    pub fn split_front(&mut self, first: SequenceId, rest: SequenceId) -> Option<SequenceId> {
        let Some(slot) = self.windows.remove(&first) else {
            return None;
        };
        debug_assert!(first < rest && rest <= slot.last);
        self.windows.insert(
            first,
            Slot {
                last: rest.prev(),
                done: true,
            },
        );
        self.windows.insert(rest, slot);
        self.fold()
    }

    fn fold(&mut self) -> Option<SequenceId> {
        let before = self.delivered;
        while let Some(entry) = self.windows.first_entry() {
            if !entry.get().done {
                break;
            }
            self.delivered = entry.remove().last;
        }
        (self.delivered != before).then_some(self.delivered)
    }

    /// The span of ids currently in flight.
    pub fn in_flight_range(&self) -> Option<SequenceRange> {
        let first = *self.windows.keys().next()?;
        Some(SequenceRange::new(first, self.highest()))
    }
}

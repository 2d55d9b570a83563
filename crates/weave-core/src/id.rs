//! Item identifiers and per-client logical clock bookkeeping.

use std::cmp::Ordering;
use std::collections::HashMap;

/// Identifier of one replica session.
pub type ClientId = u64;

/// Per-client logical clock value.
pub type Clock = u64;

/// Globally unique identifier of one unit of inserted content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id {
    pub client: ClientId,
    pub clock: Clock,
}

impl Id {
    pub fn new(client: ClientId, clock: Clock) -> Self {
        Self { client, clock }
    }
}

/// Total order used to resolve concurrent inserts: clock first, client id
/// as the tie-breaker.
pub(crate) fn cmp_clock_client(a: Id, b: Id) -> Ordering {
    match a.clock.cmp(&b.clock) {
        Ordering::Equal => a.client.cmp(&b.client),
        ord => ord,
    }
}

/// Contiguous range of clock values from one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub client: ClientId,
    pub clock: Clock,
    pub len: u64,
}

impl IdRange {
    pub fn new(client: ClientId, clock: Clock, len: u64) -> Self {
        Self { client, clock, len }
    }

    pub fn start_id(&self) -> Id {
        Id::new(self.client, self.clock)
    }

    /// First clock value past the range.
    pub fn end(&self) -> Clock {
        self.clock + self.len
    }

    pub fn contains(&self, id: Id) -> bool {
        id.client == self.client && id.clock >= self.clock && id.clock < self.end()
    }
}

/// Per-client sets of observed clock ranges, kept sorted and merged.
///
/// Ranges are stored as closed `(start, end)` intervals. Used both to
/// deduplicate re-delivered remote content and to detect causal gaps in a
/// client's item sequence.
#[derive(Debug, Default, Clone)]
pub(crate) struct ObservedClocks {
    observed: HashMap<ClientId, Vec<(Clock, Clock)>>,
}

impl ObservedClocks {
    pub(crate) fn observe(&mut self, client: ClientId, start: Clock, span: u64) {
        if span == 0 {
            return;
        }
        let end = start + span - 1;
        let ranges = self.observed.entry(client).or_default();
        ranges.push((start, end));
        ranges.sort_by_key(|(a, _)| *a);
        let mut merged: Vec<(Clock, Clock)> = Vec::with_capacity(ranges.len());
        for (a, b) in ranges.iter().copied() {
            if let Some(last) = merged.last_mut() {
                if a <= last.1.saturating_add(1) {
                    last.1 = last.1.max(b);
                } else {
                    merged.push((a, b));
                }
            } else {
                merged.push((a, b));
            }
        }
        *ranges = merged;
    }

    pub(crate) fn contains(&self, id: Id) -> bool {
        self.observed
            .get(&id.client)
            .is_some_and(|ranges| ranges.iter().any(|(a, b)| *a <= id.clock && id.clock <= *b))
    }

    /// Number of leading clock values of `[clock, clock + span)` already
    /// observed for the client.
    pub(crate) fn covered_prefix(&self, client: ClientId, clock: Clock, span: u64) -> u64 {
        let Some(ranges) = self.observed.get(&client) else {
            return 0;
        };
        for (a, b) in ranges.iter().copied() {
            if a <= clock && clock <= b {
                let covered_end = (b + 1).min(clock + span);
                return covered_end - clock;
            }
        }
        0
    }

    /// First clock value not yet observed for the client, assuming items
    /// from one client arrive as a gap-free prefix.
    pub(crate) fn next_clock(&self, client: ClientId) -> Clock {
        match self.observed.get(&client).and_then(|r| r.first()) {
            Some((start, end)) if *start == 0 => end + 1,
            _ => 0,
        }
    }

    /// Sub-ranges of `range` that have never been observed.
    pub(crate) fn unobserved_parts(&self, range: IdRange) -> Vec<IdRange> {
        let mut out = Vec::new();
        let end = range.end();
        let mut cursor = range.clock;
        if let Some(ranges) = self.observed.get(&range.client) {
            for (a, b) in ranges.iter().copied() {
                if b < cursor {
                    continue;
                }
                if a >= end {
                    break;
                }
                if a > cursor {
                    out.push(IdRange::new(range.client, cursor, a - cursor));
                }
                cursor = cursor.max(b + 1);
                if cursor >= end {
                    break;
                }
            }
        }
        if cursor < end {
            out.push(IdRange::new(range.client, cursor, end - cursor));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_merges_adjacent_ranges() {
        let mut clocks = ObservedClocks::default();
        clocks.observe(1, 0, 3);
        clocks.observe(1, 5, 2);
        clocks.observe(1, 3, 2);
        assert_eq!(clocks.next_clock(1), 7);
        assert!(clocks.contains(Id::new(1, 6)));
        assert!(!clocks.contains(Id::new(1, 7)));
    }

    #[test]
    fn covered_prefix_reports_partial_overlap() {
        let mut clocks = ObservedClocks::default();
        clocks.observe(7, 0, 5);
        assert_eq!(clocks.covered_prefix(7, 3, 10), 2);
        assert_eq!(clocks.covered_prefix(7, 5, 4), 0);
        assert_eq!(clocks.covered_prefix(7, 0, 2), 2);
    }

    #[test]
    fn next_clock_requires_prefix_from_zero() {
        let mut clocks = ObservedClocks::default();
        clocks.observe(2, 4, 3);
        assert_eq!(clocks.next_clock(2), 0);
        clocks.observe(2, 0, 4);
        assert_eq!(clocks.next_clock(2), 7);
    }
}

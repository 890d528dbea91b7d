use crate::model::{Ms, Span};
use crate::roster::AvailabilitySnapshot;

// ── Slot Finder ───────────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Subtract sorted `to_remove` intervals from sorted `base` intervals.
/// Single linear sweep; both inputs sorted by start.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Free intervals for a staff member: open working time minus buffered
/// active appointments. `busy` must be sorted by start; it is merged here
/// because buffered spans may touch or overlap each other.
pub fn free_intervals(snapshot: &AvailabilitySnapshot, busy: &[Span]) -> Vec<Span> {
    let open = snapshot.open_intervals();
    if busy.is_empty() {
        return open;
    }
    subtract_intervals(&open, &merge_overlapping(busy))
}

/// Lazy, restartable sequence of candidate start times: each free gap is
/// stepped at `granularity` while a full `duration` still fits. Finite per
/// window — bounded by window length / granularity.
pub struct SlotIter {
    gaps: Vec<Span>,
    duration: Ms,
    granularity: Ms,
    gap_idx: usize,
    cursor: Ms,
}

impl SlotIter {
    pub fn new(gaps: Vec<Span>, duration: Ms, granularity: Ms) -> Self {
        debug_assert!(duration > 0 && granularity > 0);
        let cursor = gaps.first().map_or(0, |g| g.start);
        Self {
            gaps,
            duration,
            granularity,
            gap_idx: 0,
            cursor,
        }
    }
}

impl Iterator for SlotIter {
    type Item = Ms;

    fn next(&mut self) -> Option<Ms> {
        while self.gap_idx < self.gaps.len() {
            let gap = self.gaps[self.gap_idx];
            if self.cursor + self.duration <= gap.end {
                let start = self.cursor;
                self.cursor += self.granularity;
                return Some(start);
            }
            self.gap_idx += 1;
            if let Some(next) = self.gaps.get(self.gap_idx) {
                self.cursor = next.start;
            }
        }
        None
    }
}

/// Candidate start times for a service within the snapshot, skipping
/// buffered busy time.
pub fn slots(
    snapshot: &AvailabilitySnapshot,
    busy: &[Span],
    duration: Ms,
    granularity: Ms,
) -> SlotIter {
    SlotIter::new(free_intervals(snapshot, busy), duration, granularity)
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn snap(windows: Vec<Span>, time_off: Vec<Span>) -> AvailabilitySnapshot {
        AvailabilitySnapshot { windows, time_off }
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_partial_left() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 150)];
        assert_eq!(subtract_intervals(&base, &remove), vec![Span::new(150, 200)]);
    }

    #[test]
    fn subtract_partial_right() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(150, 250)];
        assert_eq!(subtract_intervals(&base, &remove), vec![Span::new(100, 150)]);
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![
            Span::new(100, 200),
            Span::new(400, 500),
            Span::new(800, 900),
        ];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }

    // ── free_intervals ────────────────────────────────────

    #[test]
    fn free_intervals_subtracts_busy_and_time_off() {
        let s = snap(
            vec![Span::new(9 * H, 17 * H)],
            vec![Span::new(12 * H, 13 * H)],
        );
        let busy = vec![Span::new(10 * H, 11 * H)];
        assert_eq!(
            free_intervals(&s, &busy),
            vec![
                Span::new(9 * H, 10 * H),
                Span::new(11 * H, 12 * H),
                Span::new(13 * H, 17 * H),
            ]
        );
    }

    #[test]
    fn free_intervals_merges_touching_busy() {
        let s = snap(vec![Span::new(0, 10 * H)], vec![]);
        // Buffered spans that touch: [1h,2h) then [2h,3h)
        let busy = vec![Span::new(H, 2 * H), Span::new(2 * H, 3 * H)];
        assert_eq!(
            free_intervals(&s, &busy),
            vec![Span::new(0, H), Span::new(3 * H, 10 * H)]
        );
    }

    // ── SlotIter ──────────────────────────────────────────

    #[test]
    fn slots_step_at_granularity() {
        let s = snap(vec![Span::new(0, 30 * M)], vec![]);
        let starts: Vec<Ms> = slots(&s, &[], 15 * M, 5 * M).collect();
        assert_eq!(starts, vec![0, 5 * M, 10 * M, 15 * M]);
    }

    #[test]
    fn slots_skip_gaps_too_small() {
        let s = snap(vec![Span::new(0, 10 * M), Span::new(20 * M, 60 * M)], vec![]);
        let starts: Vec<Ms> = slots(&s, &[], 30 * M, 5 * M).collect();
        // First gap (10m) can't fit 30m; second fits starting 20m and 25m.
        assert_eq!(starts, vec![20 * M, 25 * M, 30 * M]);
    }

    #[test]
    fn slots_exhaust_and_restart() {
        let s = snap(vec![Span::new(0, 20 * M)], vec![]);
        let first: Vec<Ms> = slots(&s, &[], 10 * M, 10 * M).collect();
        let second: Vec<Ms> = slots(&s, &[], 10 * M, 10 * M).collect();
        assert_eq!(first, second); // restartable: a fresh iterator replays
        assert_eq!(first, vec![0, 10 * M]);
    }

    #[test]
    fn slots_empty_when_closed() {
        let s = snap(vec![], vec![]);
        assert_eq!(slots(&s, &[], 10 * M, 5 * M).count(), 0);
    }

    #[test]
    fn slots_are_finite() {
        let s = snap(vec![Span::new(0, 8 * H)], vec![]);
        let n = slots(&s, &[], 30 * M, 5 * M).count();
        // (8h - 30m) / 5m + 1 candidate starts
        assert_eq!(n as Ms, (8 * H - 30 * M) / (5 * M) + 1);
    }

    // ── Completeness: free + busy + time off tile the window ──

    #[test]
    fn free_busy_time_off_reconstruct_window() {
        let window = Span::new(9 * H, 17 * H);
        let s = snap(vec![window], vec![Span::new(12 * H, 13 * H)]);
        let busy = vec![Span::new(10 * H, 11 * H), Span::new(14 * H, 15 * H)];

        let mut pieces = free_intervals(&s, &busy);
        pieces.extend_from_slice(&busy);
        pieces.extend_from_slice(&s.time_off);
        pieces.sort_by_key(|p| p.start);

        // No double-counted minutes...
        for pair in pieces.windows(2) {
            assert!(pair[0].end <= pair[1].start, "overlap at {pair:?}");
        }
        // ...and no gaps: the union is exactly the working window.
        assert_eq!(merge_overlapping(&pieces), vec![window]);
    }
}

//! Flat fixed-size aggregator tree (FFAT) for incremental sliding windows.
//!
//! The stream is cut into fixed-width panes; each pane keeps one aggregate
//! built with the user's `lift`, merged with `combine` (associative, not
//! necessarily commutative). Pane aggregates are the leaves of a flat
//! array-backed binary tree, so evaluating a window is an `O(log n)` range
//! combine over its panes and a late pane update is an `O(log n)` path
//! rebuild.
//!
//! Pane ids map onto the leaf ring modulo its capacity; the tree grows
//! (doubling) whenever the live pane span outruns the ring.

use fxhash::FxHashMap;
use smallvec::SmallVec;

use super::{FiredWindow, WindowSpec, WinType};

/// Array-backed binary tree over a ring of pane aggregates.
///
/// Standard segment-tree layout: `nodes[1]` is the root, leaf `i` lives at
/// `nodes[cap + i]`. Leaves remember their pane id so stale slots are never
/// merged into a query.
pub(crate) struct FlatFat<A, C> {
    nodes: Vec<Option<A>>,
    leaf_panes: Vec<Option<u64>>,
    cap: usize,
    combine: C,
}

impl<A: Clone, C: Fn(&A, &A) -> A> FlatFat<A, C> {
    pub(crate) fn new(min_leaves: usize, combine: C) -> Self {
        let cap = min_leaves.max(2).next_power_of_two();
        Self {
            nodes: vec![None; 2 * cap],
            leaf_panes: vec![None; cap],
            cap,
            combine,
        }
    }

    fn leaf_slot(&self, pane: u64) -> usize {
        (pane % self.cap as u64) as usize
    }

    fn rebuild_path(&mut self, leaf: usize) {
        let mut i = (self.cap + leaf) >> 1;
        while i >= 1 {
            let merged = match (&self.nodes[2 * i], &self.nodes[2 * i + 1]) {
                (Some(a), Some(b)) => Some((self.combine)(a, b)),
                (Some(a), None) => Some(a.clone()),
                (None, Some(b)) => Some(b.clone()),
                (None, None) => None,
            };
            self.nodes[i] = merged;
            i >>= 1;
        }
    }

    /// Merges `value` into the aggregate of `pane`, growing the ring if the
    /// pane span no longer fits.
    pub(crate) fn update(&mut self, pane: u64, value: A) {
        self.ensure_fits(pane);
        let slot = self.leaf_slot(pane);
        let node = self.cap + slot;
        match self.leaf_panes[slot] {
            Some(p) if p == pane => {
                let merged = self.nodes[node]
                    .as_ref()
                    .map_or_else(|| value.clone(), |old| (self.combine)(old, &value));
                self.nodes[node] = Some(merged);
            }
            Some(_) => {
                // The slot belongs to a retired pane that was never cleared;
                // live spans are maintained by the caller, so this is a bug.
                debug_assert!(false, "pane ring collision: slot {slot} still live");
            }
            None => {
                self.leaf_panes[slot] = Some(pane);
                self.nodes[node] = Some(value);
            }
        }
        self.rebuild_path(slot);
    }

    /// Evicts panes in `[from, to)`.
    pub(crate) fn clear_range(&mut self, from: u64, to: u64) {
        for pane in from..to {
            let slot = self.leaf_slot(pane);
            if self.leaf_panes[slot] == Some(pane) {
                self.leaf_panes[slot] = None;
                self.nodes[self.cap + slot] = None;
                self.rebuild_path(slot);
            }
        }
    }

    /// Range combine over panes `[from, from + count)`, left to right.
    /// Missing panes are skipped. Returns `None` when no pane is present.
    pub(crate) fn query(&self, from: u64, count: u64) -> Option<A> {
        if count == 0 {
            return None;
        }
        let start = self.leaf_slot(from);
        let len = count as usize;
        debug_assert!(len <= self.cap);
        if start + len <= self.cap {
            self.query_slots(start, start + len)
        } else {
            // The pane range wraps the ring: combine the tail then the head,
            // preserving pane order.
            let tail = self.query_slots(start, self.cap);
            let head = self.query_slots(0, start + len - self.cap);
            match (tail, head) {
                (Some(a), Some(b)) => Some((self.combine)(&a, &b)),
                (a, None) => a,
                (None, b) => b,
            }
        }
    }

    /// Order-preserving segment query over leaf slots `[l, r)`.
    fn query_slots(&self, l: usize, r: usize) -> Option<A> {
        let mut left: Option<A> = None;
        let mut right: Option<A> = None;
        let mut l = self.cap + l;
        let mut r = self.cap + r;
        while l < r {
            if l & 1 == 1 {
                if let Some(v) = &self.nodes[l] {
                    left = Some(match &left {
                        Some(acc) => (self.combine)(acc, v),
                        None => v.clone(),
                    });
                }
                l += 1;
            }
            if r & 1 == 1 {
                r -= 1;
                if let Some(v) = &self.nodes[r] {
                    right = Some(match &right {
                        Some(acc) => (self.combine)(v, acc),
                        None => v.clone(),
                    });
                }
            }
            l >>= 1;
            r >>= 1;
        }
        match (left, right) {
            (Some(a), Some(b)) => Some((self.combine)(&a, &b)),
            (a, None) => a,
            (None, b) => b,
        }
    }

    /// Grows the ring until the whole live pane span, including `pane`,
    /// maps to distinct slots.
    fn ensure_fits(&mut self, pane: u64) {
        let low = self.lowest_live_pane().map_or(pane, |l| l.min(pane));
        let high = self.highest_live_pane().map_or(pane, |h| h.max(pane));
        if high - low < self.cap as u64 {
            return;
        }
        let mut new_cap = self.cap;
        while high - low >= new_cap as u64 {
            new_cap *= 2;
        }
        let live: Vec<(u64, A)> = self
            .leaf_panes
            .iter()
            .enumerate()
            .filter_map(|(slot, p)| {
                p.map(|pane| (pane, self.nodes[self.cap + slot].clone().expect("live leaf")))
            })
            .collect();
        self.cap = new_cap;
        self.nodes = vec![None; 2 * new_cap];
        self.leaf_panes = vec![None; new_cap];
        for (pane, agg) in live {
            let slot = self.leaf_slot(pane);
            self.leaf_panes[slot] = Some(pane);
            self.nodes[self.cap + slot] = Some(agg);
            self.rebuild_path(slot);
        }
    }

    fn lowest_live_pane(&self) -> Option<u64> {
        self.leaf_panes.iter().flatten().copied().min()
    }

    fn highest_live_pane(&self) -> Option<u64> {
        self.leaf_panes.iter().flatten().copied().max()
    }
}

/// Per-pane geometry shared by both CB and TB FFAT operators.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PaneSpec {
    /// Pane width, in the window geometry's index unit.
    pub pane_units: u64,
    /// Panes per window (`win_len / pane_units`).
    pub panes_per_window: u64,
    /// Panes per slide (`slide_len / pane_units`).
    pub panes_per_slide: u64,
}

impl PaneSpec {
    /// Derives the pane geometry; `quantum` overrides the default pane
    /// width of `gcd(len, slide)` and must divide both.
    pub(crate) fn derive(spec: &WindowSpec, quantum: Option<u64>) -> Self {
        let pane_units = quantum.unwrap_or_else(|| gcd(spec.win_len, spec.slide_len));
        debug_assert!(pane_units > 0);
        debug_assert_eq!(spec.win_len % pane_units, 0);
        debug_assert_eq!(spec.slide_len % pane_units, 0);
        Self {
            pane_units,
            panes_per_window: spec.win_len / pane_units,
            panes_per_slide: spec.slide_len / pane_units,
        }
    }
}

/// Greatest common divisor (pane width of paned and FFAT windows).
pub(crate) fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

struct KeyFat<A, C> {
    fat: FlatFat<A, C>,
    /// Next window to fire; windows fire strictly in order.
    next_window: u64,
    /// CB arrival counter.
    arrivals: u64,
}

/// Per-replica FFAT state for one keyed aggregator.
pub(crate) struct FfatManager<K, I, A, L, C> {
    spec: WindowSpec,
    panes: PaneSpec,
    lift: L,
    combine: C,
    keys: FxHashMap<K, KeyFat<A, C>>,
    ignored: u64,
    _marker: std::marker::PhantomData<fn(&I)>,
}

impl<K, I, A, L, C> FfatManager<K, I, A, L, C>
where
    K: std::hash::Hash + Eq + Clone,
    A: Clone,
    L: FnMut(&I) -> A,
    C: Fn(&A, &A) -> A + Clone,
{
    pub(crate) fn new(spec: WindowSpec, panes: PaneSpec, lift: L, combine: C) -> Self {
        Self {
            spec,
            panes,
            lift,
            combine,
            keys: FxHashMap::default(),
            ignored: 0,
            _marker: std::marker::PhantomData,
        }
    }

    pub(crate) fn ignored(&self) -> u64 {
        self.ignored
    }

    /// Lifts a tuple into its pane. CB windows that complete fire into
    /// `fired` immediately.
    pub(crate) fn on_tuple(
        &mut self,
        key: K,
        payload: &I,
        timestamp: u64,
        fired: &mut SmallVec<[FiredWindow<K, A>; 2]>,
    ) {
        let panes = self.panes;
        let spec = self.spec;
        let lift = &mut self.lift;
        let combine = self.combine.clone();
        let state = self.keys.entry(key.clone()).or_insert_with(|| KeyFat {
            fat: FlatFat::new((panes.panes_per_window + panes.panes_per_slide) as usize, combine),
            next_window: 0,
            arrivals: 0,
        });

        let idx = match spec.win_type {
            WinType::TimeBased => timestamp,
            WinType::CountBased => {
                let c = state.arrivals;
                state.arrivals += 1;
                c
            }
        };
        let pane = idx / panes.pane_units;
        if pane < state.next_window * panes.panes_per_slide {
            // Every window covering this pane has fired.
            self.ignored += 1;
            return;
        }
        state.fat.update(pane, lift(payload));

        if spec.win_type == WinType::CountBased {
            // Window w completes on index w·slide + len − 1.
            while spec.window_end(state.next_window) <= idx + 1 {
                let w = state.next_window;
                let first_pane = w * panes.panes_per_slide;
                let result = state
                    .fat
                    .query(first_pane, panes.panes_per_window)
                    .expect("completed window has panes");
                state.fat.clear_range(first_pane, first_pane + panes.panes_per_slide);
                state.next_window += 1;
                fired.push(FiredWindow {
                    key: key.clone(),
                    result,
                    id: w,
                    timestamp,
                    end: spec.window_end(w),
                });
            }
        }
    }

    /// Fires every TB window covered by the watermark, per key in window
    /// order, sorted by end across keys.
    pub(crate) fn on_watermark(&mut self, watermark: u64, fired: &mut Vec<FiredWindow<K, A>>) {
        if self.spec.win_type != WinType::TimeBased {
            return;
        }
        let before = fired.len();
        let spec = self.spec;
        let panes = self.panes;
        for (key, state) in &mut self.keys {
            loop {
                // Firing walks live panes, not window ids, so a large
                // watermark jump (end-of-stream advances to u64::MAX)
                // terminates once the tree is empty.
                let Some(low) = state.fat.lowest_live_pane() else {
                    break;
                };
                let next_first = state.next_window * panes.panes_per_slide;
                if low < next_first {
                    // Leftover panes in the gap below every unfired window.
                    state.fat.clear_range(low, next_first);
                    continue;
                }
                // Skip ahead to the earliest window covering a live pane.
                let w_min = if low + 1 > panes.panes_per_window {
                    (low + 1 - panes.panes_per_window).div_ceil(panes.panes_per_slide)
                } else {
                    0
                };
                state.next_window = state.next_window.max(w_min);

                let w = state.next_window;
                let end = spec.window_end(w);
                if end.saturating_add(spec.lateness) > watermark {
                    break;
                }
                let first_pane = w * panes.panes_per_slide;
                let result = state.fat.query(first_pane, panes.panes_per_window);
                state.fat.clear_range(first_pane, first_pane + panes.panes_per_slide);
                state.next_window = w + 1;
                if let Some(result) = result {
                    fired.push(FiredWindow {
                        key: key.clone(),
                        result,
                        id: w,
                        timestamp: end - 1,
                        end,
                    });
                }
            }
        }
        fired[before..].sort_by_key(|f| f.end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_fat(leaves: usize) -> FlatFat<u64, impl Fn(&u64, &u64) -> u64> {
        FlatFat::new(leaves, |a: &u64, b: &u64| a + b)
    }

    #[test]
    fn update_and_query() {
        let mut fat = sum_fat(4);
        fat.update(0, 1);
        fat.update(1, 2);
        fat.update(2, 3);
        fat.update(3, 4);
        assert_eq!(fat.query(0, 4), Some(10));
        assert_eq!(fat.query(1, 2), Some(5));
        assert_eq!(fat.query(0, 1), Some(1));
    }

    #[test]
    fn repeated_updates_merge_into_pane() {
        let mut fat = sum_fat(4);
        fat.update(0, 1);
        fat.update(0, 2);
        assert_eq!(fat.query(0, 1), Some(3));
    }

    #[test]
    fn clear_then_wrap() {
        let mut fat = sum_fat(4);
        for pane in 0..4u64 {
            fat.update(pane, pane + 1);
        }
        fat.clear_range(0, 2);
        fat.update(4, 50);
        fat.update(5, 60);
        assert_eq!(fat.query(2, 4), Some(3 + 4 + 50 + 60));
    }

    #[test]
    fn non_commutative_combine_preserves_order() {
        // String concatenation is associative but not commutative.
        let mut fat = FlatFat::new(4, |a: &String, b: &String| format!("{a}{b}"));
        fat.update(0, "a".to_string());
        fat.update(1, "b".to_string());
        fat.update(2, "c".to_string());
        fat.update(3, "d".to_string());
        assert_eq!(fat.query(0, 4), Some("abcd".to_string()));
        assert_eq!(fat.query(1, 3), Some("bcd".to_string()));

        // Across the ring boundary.
        fat.clear_range(0, 2);
        fat.update(4, "e".to_string());
        fat.update(5, "f".to_string());
        assert_eq!(fat.query(2, 4), Some("cdef".to_string()));
    }

    #[test]
    fn late_pane_below_live_span_grows() {
        let mut fat = sum_fat(4);
        for pane in 8..12u64 {
            fat.update(pane, 1);
        }
        // A late pane below the live span must not collide in the ring.
        fat.update(5, 7);
        assert_eq!(fat.query(5, 7), Some(7 + 4));
    }

    #[test]
    fn growth_keeps_live_panes() {
        let mut fat = sum_fat(2);
        fat.update(0, 1);
        fat.update(1, 2);
        // Pane 5 forces growth past the 2-leaf ring with pane 0 still live.
        fat.update(5, 32);
        assert_eq!(fat.query(0, 6), Some(35));
    }

    #[test]
    fn gcd_panes() {
        assert_eq!(gcd(1000, 500), 500);
        assert_eq!(gcd(4, 2), 2);
        assert_eq!(gcd(7, 3), 1);
        assert_eq!(gcd(6, 6), 6);
    }

    fn cb_spec(len: u64, slide: u64) -> WindowSpec {
        WindowSpec {
            win_type: WinType::CountBased,
            win_len: len,
            slide_len: slide,
            lateness: 0,
        }
    }

    fn tb_spec(len: u64, slide: u64, lateness: u64) -> WindowSpec {
        WindowSpec {
            win_type: WinType::TimeBased,
            win_len: len,
            slide_len: slide,
            lateness,
        }
    }

    #[test]
    fn cb_ffat_matches_direct_sums() {
        // len=4, slide=2 over 1..=12, same as the plain window manager.
        let spec = cb_spec(4, 2);
        let panes = PaneSpec::derive(&spec, None);
        let mut mgr = FfatManager::new(spec, panes, |v: &u64| *v, |a: &u64, b: &u64| a + b);
        let mut sums = Vec::new();
        for v in 1..=12u64 {
            let mut fired = SmallVec::new();
            mgr.on_tuple(0u64, &v, v, &mut fired);
            for f in fired {
                sums.push(f.result);
            }
        }
        assert_eq!(sums, vec![10, 18, 26, 34, 42]);
    }

    #[test]
    fn tb_ffat_fires_on_watermark() {
        // Tumbling 1000µs windows, count aggregation.
        let spec = tb_spec(1000, 1000, 0);
        let panes = PaneSpec::derive(&spec, Some(500));
        let mut mgr = FfatManager::new(spec, panes, |_: &u64| 1u64, |a: &u64, b: &u64| a + b);
        for ts in [0u64, 400, 600, 1100] {
            let mut fired = SmallVec::new();
            mgr.on_tuple(0u64, &ts, ts, &mut fired);
            assert!(fired.is_empty());
        }
        let mut fired = Vec::new();
        mgr.on_watermark(2000, &mut fired);
        let results: Vec<u64> = fired.iter().map(|f| f.result).collect();
        assert_eq!(results, vec![3, 1]);
        assert_eq!(fired[0].end, 1000);
    }

    #[test]
    fn late_pane_update_then_ignored_after_firing() {
        let spec = tb_spec(1000, 1000, 0);
        let panes = PaneSpec::derive(&spec, None);
        let mut mgr = FfatManager::new(spec, panes, |_: &u64| 1u64, |a: &u64, b: &u64| a + b);

        let mut buf = SmallVec::new();
        mgr.on_tuple(0u64, &900, 900, &mut buf);
        // Late-but-in-time tuple lands in the still-live pane.
        mgr.on_tuple(0u64, &100, 100, &mut buf);

        let mut fired = Vec::new();
        mgr.on_watermark(1000, &mut fired);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].result, 2);

        // Straggler into the fired window: ignored.
        mgr.on_tuple(0u64, &300, 300, &mut buf);
        assert_eq!(mgr.ignored(), 1);
    }
}

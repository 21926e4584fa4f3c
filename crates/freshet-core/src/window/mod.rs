//! Windowing engine: count-based and time-based sliding windows.
//!
//! A window is identified by `(key, window id)`. Window `w` of a keyed
//! substream covers index range `[w·slide, w·slide + len)` — tuple arrival
//! indices for count-based (CB) windows, microseconds for time-based (TB)
//! windows. Windows are created lazily when the first in-range tuple
//! arrives, folded in place on every subsequent tuple, fired exactly once,
//! and destroyed immediately after firing.
//!
//! Firing:
//! - CB: a window fires the moment it receives its `len`-th tuple.
//! - TB: all windows with `end + lateness ≤ watermark` fire, in
//!   non-decreasing end order, when the replica's watermark advances.
//!
//! Parallel distribution: with `P` replicas over one broadcast substream,
//! replica `i` owns the windows whose id is congruent to `i` modulo `P`
//! (equivalently: an effective slide of `P·slide` starting at offset
//! `i·slide`). Tuples belonging only to foreign windows are dropped
//! silently; tuples whose owned windows have all already fired count as
//! *ignored*.

pub(crate) mod ffat;

use std::collections::BTreeMap;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::message::Data;
use crate::operator::ConfigError;

/// Count-based or time-based semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinType {
    /// Window bounds count tuple arrivals per key.
    CountBased,
    /// Window bounds are event-time microseconds.
    TimeBased,
}

impl WinType {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::CountBased => "count-based",
            Self::TimeBased => "time-based",
        }
    }
}

/// How CB window membership is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CbIndex {
    /// Per-key arrival counter maintained by the replica.
    ByCount,
    /// The envelope identifier (used by the pane-combining level of paned
    /// windows, where each pane id occurs exactly once per key and may
    /// arrive out of order).
    ById,
}

/// Validated window geometry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WindowSpec {
    pub win_type: WinType,
    /// Window length, in tuples (CB) or microseconds (TB).
    pub win_len: u64,
    /// Slide length, same unit as `win_len`.
    pub slide_len: u64,
    /// Firing delay in microseconds; TB only.
    pub lateness: u64,
}

impl WindowSpec {
    pub(crate) fn validate(&self, op_name: &str) -> Result<(), ConfigError> {
        if self.win_len == 0 {
            return Err(ConfigError::ZeroWindowLength(op_name.to_string()));
        }
        if self.slide_len == 0 {
            return Err(ConfigError::ZeroSlideLength(op_name.to_string()));
        }
        if self.win_type == WinType::CountBased && self.lateness > 0 {
            return Err(ConfigError::LatenessOnCountBased(op_name.to_string()));
        }
        Ok(())
    }

    /// Ids of the windows containing index `idx`:
    /// all `w` with `w·slide ≤ idx < w·slide + len`.
    pub(crate) fn windows_containing(&self, idx: u64) -> (u64, u64) {
        let last = idx / self.slide_len;
        let first = if idx + 1 > self.win_len {
            (idx + 1 - self.win_len).div_ceil(self.slide_len)
        } else {
            0
        };
        (first, last)
    }

    /// Exclusive end of window `w`, in the geometry's index unit.
    pub(crate) fn window_end(&self, w: u64) -> u64 {
        w * self.slide_len + self.win_len
    }
}

/// A fired window, ready for emission downstream.
pub(crate) struct FiredWindow<K, O> {
    pub key: K,
    pub result: O,
    /// Window id; rides the envelope identifier of the emitted result.
    pub id: u64,
    /// Event time stamped on the emitted result.
    pub timestamp: u64,
    /// End index of the fired window, used for cross-key ordering.
    pub end: u64,
}

struct OpenWindow<O> {
    acc: O,
    count: u64,
    /// Timestamp of the last folded tuple.
    last_ts: u64,
}

struct KeyState<O> {
    /// Arrival counter (CB by-count indexing).
    arrivals: u64,
    /// All windows with id below this have fired (or will never exist for
    /// this replica); guards against resurrecting fired windows.
    fired_below: u64,
    /// Open windows by id; iteration order is firing order.
    open: BTreeMap<u64, OpenWindow<O>>,
}

impl<O> Default for KeyState<O> {
    fn default() -> Self {
        Self {
            arrivals: 0,
            fired_below: 0,
            open: BTreeMap::new(),
        }
    }
}

/// Per-replica window state for one keyed operator.
///
/// `F` is the incremental fold invoked once per (tuple, window) pair.
pub(crate) struct WindowManager<K, I, O, F> {
    spec: WindowSpec,
    fold: F,
    cb_index: CbIndex,
    replica_index: u64,
    num_replicas: u64,
    keys: FxHashMap<K, KeyState<O>>,
    ignored: u64,
    /// Fire still-open windows when the end-of-stream watermark arrives.
    /// Used by the pane-combining level of paned windows, whose count-based
    /// windows stand in for time-based ones.
    eos_flush: bool,
    _marker: std::marker::PhantomData<fn(&I)>,
}

impl<K, I, O, F> WindowManager<K, I, O, F>
where
    K: std::hash::Hash + Eq + Clone,
    O: Default + Data,
    F: FnMut(&I, &mut O),
{
    pub(crate) fn new(
        spec: WindowSpec,
        fold: F,
        cb_index: CbIndex,
        replica_index: usize,
        num_replicas: usize,
    ) -> Self {
        Self {
            spec,
            fold,
            cb_index,
            replica_index: replica_index as u64,
            num_replicas: (num_replicas.max(1)) as u64,
            keys: FxHashMap::default(),
            ignored: 0,
            eos_flush: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Enables firing of still-open windows on the end-of-stream watermark.
    pub(crate) fn with_eos_flush(mut self) -> Self {
        self.eos_flush = true;
        self
    }

    /// Tuples counted as ignored (all their owned windows already fired).
    pub(crate) fn ignored(&self) -> u64 {
        self.ignored
    }

    /// Folds a tuple into every open window it belongs to. CB windows that
    /// reach their length fire immediately into `fired`.
    pub(crate) fn on_tuple(
        &mut self,
        key: K,
        payload: &I,
        identifier: u64,
        timestamp: u64,
        fired: &mut SmallVec<[FiredWindow<K, O>; 2]>,
    ) {
        let spec = self.spec;
        let cb_index = self.cb_index;
        let num_replicas = self.num_replicas;
        let replica_index = self.replica_index;
        let owns = |w: u64| num_replicas == 1 || w % num_replicas == replica_index;

        let fold = &mut self.fold;
        let state = self.keys.entry(key.clone()).or_default();

        let idx = match (spec.win_type, cb_index) {
            (WinType::TimeBased, _) => timestamp,
            (WinType::CountBased, CbIndex::ByCount) => {
                let c = state.arrivals;
                state.arrivals += 1;
                c
            }
            (WinType::CountBased, CbIndex::ById) => identifier,
        };

        let (first, last) = spec.windows_containing(idx);
        let mut touched_owned = false;
        let mut all_fired = true;
        for w in first..=last {
            if !owns(w) {
                continue;
            }
            touched_owned = true;
            if w < state.fired_below {
                continue;
            }
            all_fired = false;
            let win = state.open.entry(w).or_insert_with(|| OpenWindow {
                acc: O::default(),
                count: 0,
                last_ts: timestamp,
            });
            fold(payload, &mut win.acc);
            win.count += 1;
            win.last_ts = win.last_ts.max(timestamp);

            if spec.win_type == WinType::CountBased && win.count >= spec.win_len {
                let win = state.open.remove(&w).expect("window just updated");
                if cb_index == CbIndex::ByCount {
                    state.fired_below = state.fired_below.max(w + 1);
                }
                fired.push(FiredWindow {
                    key: key.clone(),
                    result: win.acc,
                    id: w,
                    timestamp,
                    end: spec.window_end(w),
                });
            }
        }
        if touched_owned && all_fired {
            self.ignored += 1;
        }
    }

    /// Fires every TB window whose `end + lateness` is covered by the
    /// watermark. Results come out in non-decreasing end order across keys.
    ///
    /// With `eos_flush` set, the end-of-stream watermark also drains
    /// still-open count-based windows in id order.
    pub(crate) fn on_watermark(&mut self, watermark: u64, fired: &mut Vec<FiredWindow<K, O>>) {
        let flush_open = watermark == u64::MAX && self.eos_flush;
        if self.spec.win_type != WinType::TimeBased && !flush_open {
            return;
        }
        let before = fired.len();
        let spec = self.spec;
        for (key, state) in &mut self.keys {
            if flush_open && spec.win_type == WinType::CountBased {
                let open = std::mem::take(&mut state.open);
                for (w, win) in open {
                    state.fired_below = state.fired_below.max(w + 1);
                    fired.push(FiredWindow {
                        key: key.clone(),
                        result: win.acc,
                        id: w,
                        timestamp: win.last_ts,
                        end: spec.window_end(w),
                    });
                }
                continue;
            }
            while let Some((&w, _)) = state.open.iter().next() {
                let end = spec.window_end(w);
                if end.saturating_add(spec.lateness) > watermark {
                    break;
                }
                let win = state.open.remove(&w).expect("head window exists");
                state.fired_below = state.fired_below.max(w + 1);
                fired.push(FiredWindow {
                    key: key.clone(),
                    result: win.acc,
                    id: w,
                    timestamp: end - 1,
                    end,
                });
            }
        }
        fired[before..].sort_by_key(|f| f.end);
    }
}

//! Caller/callee arcs with self and cumulative counts, plus the
//! leaf-pruning fixpoint that keeps reports readable.

use std::collections::BTreeMap;

use crate::container::CountArray;
use crate::interning::{ImageNameId, SymbolNameId};

/// Identity of a node in the callgraph; ordering gives deterministic
/// report output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CgKey {
    pub image: ImageNameId,
    pub app: ImageNameId,
    pub name: SymbolNameId,
    pub vma: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CgEntry {
    /// Samples taken in this function itself.
    pub self_counts: CountArray,
    /// Samples on arcs into the listed callees; kept consistent with
    /// `callees` by [`CallgraphContainer::fixup_callee_counts`].
    pub callee_counts: CountArray,
    callees: BTreeMap<CgKey, CountArray>,
    callers: Vec<CgKey>,
}

/// One arc for display: the neighbor and the counts along the arc.
#[derive(Debug, Clone)]
pub struct CgArc {
    pub key: CgKey,
    pub counts: CountArray,
}

/// Two symmetric multi-maps over the arcs, so "callers of X" is as cheap
/// as "callees of X".
#[derive(Default)]
pub struct CallgraphContainer {
    entries: BTreeMap<CgKey, CgEntry>,
    total: CountArray,
}

impl CallgraphContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> &CountArray {
        &self.total
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&mut self, key: CgKey) -> &mut CgEntry {
        self.entries.entry(key).or_default()
    }

    /// Record self samples for a function (a leaf contribution).
    pub fn add_self(&mut self, key: CgKey, class: usize, count: u32) {
        self.entry(key).self_counts.add(class, count);
        self.total.add(class, count);
    }

    /// Record samples on the arc `caller -> callee`.
    pub fn add_arc(&mut self, caller: CgKey, callee: CgKey, class: usize, count: u32) {
        {
            let entry = self.entry(caller);
            entry.callees.entry(callee).or_default().add(class, count);
        }
        let callee_entry = self.entry(callee);
        if !callee_entry.callers.contains(&caller) {
            callee_entry.callers.push(caller);
        }
    }

    /// Drop leaves below `threshold` percent of the running total,
    /// repeating until nothing qualifies. Each removal shrinks the
    /// total, so the loop is bounded by the graph depth.
    pub fn fixup_callee_counts(&mut self, threshold_pct: f64) {
        let fraction = threshold_pct / 100.0;

        loop {
            let total0 = self.total.get(0) as f64;
            let doomed: Vec<CgKey> = self
                .entries
                .iter()
                .filter(|(_, e)| e.callees.is_empty())
                .filter(|(_, e)| {
                    let percent = if total0 > 0.0 {
                        e.self_counts.get(0) as f64 / total0
                    } else {
                        0.0
                    };
                    percent < fraction
                })
                .map(|(&key, _)| key)
                .collect();
            if doomed.is_empty() {
                break;
            }
            for key in doomed {
                let Some(entry) = self.entries.remove(&key) else { continue };
                self.total.subtract(&entry.self_counts);
                for caller in &entry.callers {
                    if let Some(caller_entry) = self.entries.get_mut(caller) {
                        caller_entry.callees.remove(&key);
                    }
                }
                // Forget the removed node on the callee side too.
                for other in self.entries.values_mut() {
                    other.callers.retain(|c| *c != key);
                }
            }
        }

        // Recompute each entry's cumulative counts from its surviving
        // arcs so display totals stay internally consistent.
        let keys: Vec<CgKey> = self.entries.keys().copied().collect();
        for key in keys {
            let mut counts = CountArray::new();
            for arc_counts in self.entries[&key].callees.values() {
                counts.accumulate(arc_counts);
            }
            self.entries.get_mut(&key).unwrap().callee_counts = counts;
        }
    }

    pub fn get(&self, key: &CgKey) -> Option<&CgEntry> {
        self.entries.get(key)
    }

    /// All surviving entries, heaviest cumulative counts first.
    pub fn arcs(&self) -> Vec<(CgKey, &CgEntry)> {
        let mut result: Vec<(CgKey, &CgEntry)> = self.entries.iter().map(|(&k, e)| (k, e)).collect();
        result.sort_by(|a, b| b.1.callee_counts.get(0).cmp(&a.1.callee_counts.get(0)));
        result
    }

    /// Functions calling into `key`, fewest arc samples first (they
    /// print above the function, nearest last).
    pub fn callers_of(&self, key: &CgKey) -> Vec<CgArc> {
        let Some(entry) = self.entries.get(key) else { return Vec::new() };
        let mut result: Vec<CgArc> = entry
            .callers
            .iter()
            .filter_map(|caller| {
                let caller_entry = self.entries.get(caller)?;
                let counts = caller_entry.callees.get(key)?.clone();
                Some(CgArc { key: *caller, counts })
            })
            .collect();
        result.sort_by(|a, b| a.counts.get(0).cmp(&b.counts.get(0)));
        result
    }

    /// Functions `key` calls into, most arc samples first.
    pub fn callees_of(&self, key: &CgKey) -> Vec<CgArc> {
        let Some(entry) = self.entries.get(key) else { return Vec::new() };
        let mut result: Vec<CgArc> = entry
            .callees
            .iter()
            .map(|(&callee, counts)| CgArc { key: callee, counts: counts.clone() })
            .collect();
        result.sort_by(|a, b| b.counts.get(0).cmp(&a.counts.get(0)));
        result
    }
}

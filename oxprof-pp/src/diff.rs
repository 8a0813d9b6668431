//! Join two profiles by (image, app, symbol) and report relative
//! per-class deltas.

use std::cmp::Ordering;

use crate::container::{CountArray, ProfileContainer, SymbolEntry};
use crate::interning::Names;

/// A symbol with its per-class relative change, names resolved so the
/// result is independent of either container's name table. `INFINITY`
/// marks a symbol only present in the new profile, `-INFINITY` one that
/// disappeared.
#[derive(Debug, Clone)]
pub struct DiffSymbol {
    pub image: String,
    pub app: String,
    pub name: String,
    pub vma: u64,
    /// Counts from the profile the symbol was taken from (the new one
    /// for matched symbols).
    pub counts: CountArray,
    pub diffs: Vec<f64>,
}

pub struct DiffContainer {
    symbols: Vec<DiffSymbol>,
    /// Totals of the new profile; relative percentages report against
    /// these.
    total: CountArray,
}

fn ratio(dividend: f64, divisor: f64) -> f64 {
    if divisor == 0.0 {
        0.0
    } else {
        dividend / divisor
    }
}

/// Order suitable for joining: by image, then app, then symbol name.
fn rough_order(
    a: &SymbolEntry,
    b: &SymbolEntry,
    names_a: &Names,
    names_b: &Names,
) -> Ordering {
    names_a
        .image(a.image)
        .cmp(names_b.image(b.image))
        .then_with(|| names_a.image(a.app).cmp(names_b.image(b.app)))
        .then_with(|| names_a.symbol(a.name).cmp(names_b.symbol(b.name)))
}

fn resolved(entry: &SymbolEntry, names: &Names, diffs: Vec<f64>) -> DiffSymbol {
    DiffSymbol {
        image: names.image(entry.image).to_string(),
        app: names.image(entry.app).to_string(),
        name: names.symbol(entry.name).to_string(),
        vma: entry.vma,
        counts: entry.counts.clone(),
        diffs,
    }
}

fn one_sided(entry: &SymbolEntry, names: &Names, delta: f64) -> DiffSymbol {
    let nr_classes = entry.counts.nr_classes().max(1);
    resolved(entry, names, vec![delta; nr_classes])
}

fn diff_entry(
    old: &SymbolEntry,
    old_total: &CountArray,
    new: &SymbolEntry,
    new_total: &CountArray,
    new_names: &Names,
) -> DiffSymbol {
    let nr_classes = new.counts.nr_classes().max(old.counts.nr_classes()).max(1);
    let mut diffs = Vec::with_capacity(nr_classes);
    for class in 0..nr_classes {
        let percent1 = ratio(old.counts.get(class) as f64, old_total.get(class) as f64);
        let percent2 = ratio(new.counts.get(class) as f64, new_total.get(class) as f64);
        diffs.push(ratio(percent2 - percent1, percent1) * 100.0);
    }
    resolved(new, new_names, diffs)
}

impl DiffContainer {
    /// Merge-join two containers' symbol lists.
    pub fn new(old: &ProfileContainer, new: &ProfileContainer) -> DiffContainer {
        let old_total = old.samples_count().clone();
        let new_total = new.samples_count().clone();

        let mut old_symbols: Vec<&SymbolEntry> = old.symbols().iter().collect();
        let mut new_symbols: Vec<&SymbolEntry> = new.symbols().iter().collect();
        old_symbols.sort_by(|a, b| rough_order(a, b, &old.names, &old.names));
        new_symbols.sort_by(|a, b| rough_order(a, b, &new.names, &new.names));

        let mut symbols = Vec::new();
        let mut it1 = old_symbols.iter().peekable();
        let mut it2 = new_symbols.iter().peekable();

        loop {
            match (it1.peek(), it2.peek()) {
                (Some(&&a), Some(&&b)) => match rough_order(a, b, &old.names, &new.names) {
                    Ordering::Less => {
                        symbols.push(one_sided(a, &old.names, f64::NEG_INFINITY));
                        it1.next();
                    }
                    Ordering::Greater => {
                        symbols.push(one_sided(b, &new.names, f64::INFINITY));
                        it2.next();
                    }
                    Ordering::Equal => {
                        symbols.push(diff_entry(a, &old_total, b, &new_total, &new.names));
                        it1.next();
                        it2.next();
                    }
                },
                (Some(&&a), None) => {
                    symbols.push(one_sided(a, &old.names, f64::NEG_INFINITY));
                    it1.next();
                }
                (None, Some(&&b)) => {
                    symbols.push(one_sided(b, &new.names, f64::INFINITY));
                    it2.next();
                }
                (None, None) => break,
            }
        }

        DiffContainer { symbols, total: new_total }
    }

    pub fn symbols(&self) -> &[DiffSymbol] {
        &self.symbols
    }

    pub fn samples_count(&self) -> &CountArray {
        &self.total
    }
}

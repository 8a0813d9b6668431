//! The in-memory join of sample data with symbol tables: per-symbol
//! per-class counts, optional per-address detail, selection and sorting.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::binary::BinaryImage;
use crate::error::PpError;
use crate::interning::{FileNameId, ImageNameId, Names, SymbolNameId};
use crate::profile::ProfileData;

/// A sparse per-class count vector: reads of an unset class return 0,
/// writes extend with zero fill. Counts saturate at `u32::MAX`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountArray(Vec<u32>);

impl CountArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, class: usize) -> u32 {
        self.0.get(class).copied().unwrap_or(0)
    }

    pub fn add(&mut self, class: usize, count: u32) {
        if class >= self.0.len() {
            self.0.resize(class + 1, 0);
        }
        self.0[class] = self.0[class].saturating_add(count);
    }

    pub fn accumulate(&mut self, other: &CountArray) {
        for (class, &count) in other.0.iter().enumerate() {
            self.add(class, count);
        }
    }

    pub fn subtract(&mut self, other: &CountArray) {
        for (class, &count) in other.0.iter().enumerate() {
            if class < self.0.len() {
                self.0[class] = self.0[class].saturating_sub(count);
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&c| c == 0)
    }

    pub fn nr_classes(&self) -> usize {
        self.0.len()
    }
}

/// Source location of a symbol or sample; `line == 0` means the file is
/// known but no line information was available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileLocation {
    pub file: FileNameId,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub image: ImageNameId,
    pub app: ImageNameId,
    pub name: SymbolNameId,
    pub vma: u64,
    pub size: u64,
    pub file_loc: Option<FileLocation>,
    pub counts: CountArray,
}

/// Hints the formatter uses to pick column widths and visibility.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectHints {
    pub need_wide_vma: bool,
    pub multiple_apps: bool,
    pub multiple_images: bool,
}

/// Symbol-level join of profiles and images.
#[derive(Default)]
pub struct ProfileContainer {
    pub names: Names,
    symbols: Vec<SymbolEntry>,
    by_identity: FxHashMap<(ImageNameId, ImageNameId, SymbolNameId, u64), usize>,
    /// Per-address detail: `(symbol index, vma) -> counts`.
    details: BTreeMap<(usize, u64), CountArray>,
    detail_locs: FxHashMap<(usize, u64), FileLocation>,
    total: CountArray,
    record_details: bool,
    record_debug_info: bool,
}

impl ProfileContainer {
    pub fn new(record_details: bool, record_debug_info: bool) -> Self {
        ProfileContainer { record_details, record_debug_info, ..Default::default() }
    }

    pub fn samples_count(&self) -> &CountArray {
        &self.total
    }

    pub fn nr_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbols(&self) -> &[SymbolEntry] {
        &self.symbols
    }

    /// Accumulate one class's profile of one image into the container.
    pub fn add(
        &mut self,
        profile: &ProfileData,
        image: &BinaryImage,
        app_name: &str,
        class: usize,
    ) -> Result<(), PpError> {
        let image_id = self.names.intern_image(&image.path().display().to_string());
        let app_id = self.names.intern_image(app_name);
        let resolver = if self.record_debug_info { image.line_resolver() } else { None };

        for symbol in image.symbols() {
            // Query in the display domain: sample keys shifted by the
            // image's start offset, which is how ProfileData yields them.
            let start = symbol.key_start + image.start_offset();
            let end = start + symbol.size.max(1);
            let mut sym_count = 0u64;

            let mut detail: Vec<(u64, u32)> = Vec::new();
            for (addr, count) in profile.samples_range(start, end)? {
                sym_count += count as u64;
                if self.record_details {
                    detail.push((addr, count));
                }
            }
            if sym_count == 0 {
                continue;
            }

            let name_id = self.names.intern_symbol(&symbol.name);
            let identity = (image_id, app_id, name_id, symbol.vma);
            let idx = match self.by_identity.get(&identity) {
                Some(&idx) => idx,
                None => {
                    let file_loc = resolver
                        .as_ref()
                        .and_then(|r| r.lookup(symbol.vma))
                        .map(|(file, line)| FileLocation {
                            file: self.names.intern_file(&file),
                            line,
                        });
                    let idx = self.symbols.len();
                    self.symbols.push(SymbolEntry {
                        image: image_id,
                        app: app_id,
                        name: name_id,
                        vma: symbol.vma,
                        size: symbol.size,
                        file_loc,
                        counts: CountArray::new(),
                    });
                    self.by_identity.insert(identity, idx);
                    idx
                }
            };

            let clamped = sym_count.min(u32::MAX as u64) as u32;
            self.symbols[idx].counts.add(class, clamped);
            self.total.add(class, clamped);

            for (addr, count) in detail {
                // Detail addresses: the sample key shifted into the
                // symbol's VMA space.
                let vma = symbol.vma + (addr - start);
                self.details.entry((idx, vma)).or_default().add(class, count);
                if self.record_debug_info && !self.detail_locs.contains_key(&(idx, vma)) {
                    if let Some((file, line)) = resolver.as_ref().and_then(|r| r.lookup(vma)) {
                        let file = self.names.intern_file(&file);
                        self.detail_locs.insert((idx, vma), FileLocation { file, line });
                    }
                }
            }
        }
        Ok(())
    }

    /// Account an image whose binary could not be opened: one synthetic
    /// entry carrying the whole count, so totals stay right and the
    /// report shows the image with address-only attribution.
    pub fn add_unresolved(&mut self, image_name: &str, app_name: &str, class: usize, count: u32) {
        if count == 0 {
            return;
        }
        let image = self.names.intern_image(image_name);
        let app = self.names.intern_image(app_name);
        let basename = image_name.rsplit('/').next().unwrap_or(image_name).to_string();
        let name = self.names.intern_symbol(&basename);
        let identity = (image, app, name, 0);
        let idx = match self.by_identity.get(&identity) {
            Some(&idx) => idx,
            None => {
                let idx = self.symbols.len();
                self.symbols.push(SymbolEntry {
                    image,
                    app,
                    name,
                    vma: 0,
                    size: 0,
                    file_loc: None,
                    counts: CountArray::new(),
                });
                self.by_identity.insert(identity, idx);
                idx
            }
        };
        self.symbols[idx].counts.add(class, count);
        self.total.add(class, count);
    }

    #[cfg(test)]
    pub(crate) fn push_symbol_for_tests(&mut self, entry: SymbolEntry) {
        let identity = (entry.image, entry.app, entry.name, entry.vma);
        self.total.accumulate(&entry.counts);
        self.by_identity.insert(identity, self.symbols.len());
        self.symbols.push(entry);
    }

    /// Retain symbols whose class-0 share is at least `threshold_pct`,
    /// returning them unsorted plus formatting hints.
    pub fn select(&self, threshold_pct: f64) -> (Vec<&SymbolEntry>, SelectHints) {
        let mut hints = SelectHints::default();
        let total0 = self.total.get(0) as f64;
        let mut selected = Vec::new();
        let mut first_app = None;
        let mut first_image = None;

        for symbol in &self.symbols {
            let percent = if total0 > 0.0 {
                symbol.counts.get(0) as f64 * 100.0 / total0
            } else {
                0.0
            };
            if percent < threshold_pct {
                continue;
            }
            if symbol.vma > u32::MAX as u64 {
                hints.need_wide_vma = true;
            }
            match first_app {
                None => first_app = Some(symbol.app),
                Some(app) if app != symbol.app => hints.multiple_apps = true,
                _ => {}
            }
            match first_image {
                None => first_image = Some(symbol.image),
                Some(image) if image != symbol.image => hints.multiple_images = true,
                _ => {}
            }
            selected.push(symbol);
        }
        (selected, hints)
    }

    pub fn find_by_vma(&self, image: ImageNameId, vma: u64) -> Option<&SymbolEntry> {
        self.symbols
            .iter()
            .find(|s| s.image == image && vma >= s.vma && vma < s.vma + s.size.max(1))
    }

    /// Names may repeat across images; all matches are returned.
    pub fn find_by_name(&self, name: &str) -> Vec<&SymbolEntry> {
        self.symbols
            .iter()
            .filter(|s| self.names.symbol(s.name) == name)
            .collect()
    }

    pub fn find_by_file_line(&self, file: FileNameId, line: u32) -> Vec<&SymbolEntry> {
        self.symbols
            .iter()
            .filter(|s| s.file_loc == Some(FileLocation { file, line }))
            .collect()
    }

    /// Per-address detail of one symbol, in VMA order.
    pub fn details_for(&self, symbol: &SymbolEntry) -> Vec<(u64, Option<FileLocation>, &CountArray)> {
        let Some(idx) = self.index_of(symbol) else { return Vec::new() };
        self.details
            .range((idx, 0)..(idx, u64::MAX))
            .map(|(&(_, vma), counts)| (vma, self.detail_locs.get(&(idx, vma)).copied(), counts))
            .collect()
    }

    fn index_of(&self, symbol: &SymbolEntry) -> Option<usize> {
        self.by_identity
            .get(&(symbol.image, symbol.app, symbol.name, symbol.vma))
            .copied()
    }

    /// Total detail samples attributed to `file`.
    pub fn samples_count_file(&self, file: FileNameId) -> u64 {
        self.detail_samples(|loc| loc.file == file)
    }

    /// Total detail samples attributed to `file:line`.
    pub fn samples_count_file_line(&self, file: FileNameId, line: u32) -> u64 {
        self.detail_samples(|loc| loc.file == file && loc.line == line)
    }

    fn detail_samples(&self, pred: impl Fn(&FileLocation) -> bool) -> u64 {
        self.details
            .iter()
            .filter_map(|(key, counts)| {
                let loc = self.detail_locs.get(key)?;
                pred(loc).then(|| counts.get(0) as u64)
            })
            .sum()
    }
}

/// One sort criterion; ties fall through to the next one listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Sample,
    Vma,
    Symbol,
    Image,
    AppName,
    Debug,
}

impl SortOrder {
    pub fn parse(name: &str) -> Option<SortOrder> {
        match name {
            "sample" => Some(SortOrder::Sample),
            "vma" => Some(SortOrder::Vma),
            "symbol" => Some(SortOrder::Symbol),
            "image" => Some(SortOrder::Image),
            "app-name" => Some(SortOrder::AppName),
            "debug" => Some(SortOrder::Debug),
            _ => None,
        }
    }
}

fn compare_by(order: SortOrder, a: &SymbolEntry, b: &SymbolEntry, names: &Names) -> Ordering {
    match order {
        // Highest count first.
        SortOrder::Sample => b.counts.get(0).cmp(&a.counts.get(0)),
        SortOrder::Vma => a.vma.cmp(&b.vma),
        SortOrder::Symbol => names.symbol(a.name).cmp(names.symbol(b.name)),
        SortOrder::Image => names.image_basename(a.image).cmp(names.image_basename(b.image)),
        SortOrder::AppName => names.image_basename(a.app).cmp(names.image_basename(b.app)),
        SortOrder::Debug => a.file_loc.cmp(&b.file_loc),
    }
}

/// Sort a selection by the given orders; ties break by the next order.
pub fn sort_symbols(
    symbols: &mut [&SymbolEntry],
    orders: &[SortOrder],
    reverse: bool,
    names: &Names,
) {
    symbols.sort_by(|a, b| {
        let mut ordering = Ordering::Equal;
        for &order in orders {
            ordering = compare_by(order, a, b, names);
            if ordering != Ordering::Equal {
                break;
            }
        }
        if reverse {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_array_is_sparse_and_saturating() {
        let mut counts = CountArray::new();
        assert_eq!(counts.get(7), 0);
        counts.add(2, 5);
        assert_eq!(counts.get(2), 5);
        assert_eq!(counts.get(0), 0);
        assert_eq!(counts.nr_classes(), 3);

        counts.add(2, u32::MAX);
        assert_eq!(counts.get(2), u32::MAX);

        let mut other = CountArray::new();
        other.add(0, 1);
        other.add(2, 2);
        counts.subtract(&other);
        assert_eq!(counts.get(2), u32::MAX - 2);
    }

    fn entry(names: &mut Names, image: &str, name: &str, vma: u64, count: u32) -> SymbolEntry {
        let mut counts = CountArray::new();
        counts.add(0, count);
        SymbolEntry {
            image: names.intern_image(image),
            app: names.intern_image(image),
            name: names.intern_symbol(name),
            vma,
            size: 0x10,
            file_loc: None,
            counts,
        }
    }

    #[test]
    fn sorting_breaks_ties_with_later_orders() {
        let mut names = Names::new();
        let a = entry(&mut names, "/bin/A", "zeta", 0x100, 10);
        let b = entry(&mut names, "/bin/A", "alpha", 0x200, 10);
        let c = entry(&mut names, "/bin/A", "mid", 0x300, 99);

        let mut selection: Vec<&SymbolEntry> = vec![&a, &b, &c];
        sort_symbols(&mut selection, &[SortOrder::Sample, SortOrder::Symbol], false, &names);
        let names_in_order: Vec<&str> =
            selection.iter().map(|s| names.symbol(s.name)).collect();
        assert_eq!(names_in_order, vec!["mid", "alpha", "zeta"]);

        sort_symbols(&mut selection, &[SortOrder::Vma], true, &names);
        let vmas: Vec<u64> = selection.iter().map(|s| s.vma).collect();
        assert_eq!(vmas, vec![0x300, 0x200, 0x100]);
    }
}

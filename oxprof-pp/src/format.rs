//! Column-oriented rendering of symbol lists: the count columns repeat
//! once per profile class for side-by-side comparison.

use std::io::{self, Write};

use crate::arrange::ProfileClasses;
use crate::container::{CountArray, ProfileContainer, SelectHints, SymbolEntry};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FormatFlags: u32 {
        const VMA         = 1 << 0;
        const SAMPLES     = 1 << 1;
        const CUM_SAMPLES = 1 << 2;
        const PERCENT     = 1 << 3;
        const CUM_PERCENT = 1 << 4;
        const LINENR      = 1 << 5;
        const IMAGE       = 1 << 6;
        const APP         = 1 << 7;
        const SYMBOL      = 1 << 8;
    }
}

impl Default for FormatFlags {
    fn default() -> Self {
        FormatFlags::SAMPLES | FormatFlags::PERCENT | FormatFlags::IMAGE | FormatFlags::SYMBOL
    }
}

#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub flags: FormatFlags,
    pub nr_classes: usize,
    pub show_header: bool,
    pub long_filenames: bool,
    pub show_details: bool,
    /// Accumulate percentages down the column.
    pub accumulated: bool,
    pub vma_64: bool,
    pub demangle: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            flags: FormatFlags::default(),
            nr_classes: 1,
            show_header: true,
            long_filenames: false,
            show_details: false,
            accumulated: false,
            vma_64: false,
            demangle: true,
        }
    }
}

impl FormatOptions {
    pub fn apply_hints(&mut self, hints: &SelectHints) {
        if hints.need_wide_vma {
            self.vma_64 = true;
        }
        if hints.multiple_apps {
            self.flags |= FormatFlags::APP;
        }
    }
}

const COUNT_WIDTH: usize = 9;
const PERCENT_WIDTH: usize = 9;

fn format_percent(count: u64, total: u64) -> String {
    let percent = if total == 0 { 0.0 } else { count as f64 * 100.0 / total as f64 };
    format!("{percent:>width$.4}", width = PERCENT_WIDTH)
}

pub struct Formatter<'a> {
    container: &'a mut ProfileContainer,
    options: FormatOptions,
}

impl<'a> Formatter<'a> {
    pub fn new(container: &'a mut ProfileContainer, options: FormatOptions) -> Self {
        Formatter { container, options }
    }

    fn vma_cell(&self, vma: u64) -> String {
        if self.options.vma_64 {
            format!("{vma:016x}")
        } else {
            format!("{vma:08x}")
        }
    }

    /// The event/class description block at the top of a report.
    pub fn write_header(
        &self,
        out: &mut impl Write,
        classes: &ProfileClasses,
    ) -> io::Result<()> {
        if !self.options.show_header {
            return Ok(());
        }
        if !classes.event.is_empty() {
            writeln!(out, "Counted {}", classes.event)?;
        }
        if classes.classes.len() > 1 {
            for class in &classes.classes {
                writeln!(out, "{}: {}", class.name, class.longname)?;
            }
        }

        let mut columns = String::new();
        if self.options.flags.contains(FormatFlags::VMA) {
            let width = if self.options.vma_64 { 16 } else { 8 };
            columns.push_str(&format!("{:>width$} ", "vma", width = width));
        }
        for _ in 0..self.options.nr_classes {
            if self.options.flags.contains(FormatFlags::SAMPLES) {
                columns.push_str(&format!("{:>COUNT_WIDTH$} ", "samples"));
            }
            if self.options.flags.contains(FormatFlags::CUM_SAMPLES) {
                columns.push_str(&format!("{:>COUNT_WIDTH$} ", "cum. smpl"));
            }
            if self.options.flags.contains(FormatFlags::PERCENT) {
                columns.push_str(&format!("{:>PERCENT_WIDTH$} ", "%"));
            }
            if self.options.flags.contains(FormatFlags::CUM_PERCENT) {
                columns.push_str(&format!("{:>PERCENT_WIDTH$} ", "cum. %"));
            }
        }
        if self.options.flags.contains(FormatFlags::LINENR) {
            columns.push_str("linenr info          ");
        }
        if self.options.flags.contains(FormatFlags::IMAGE) {
            columns.push_str(&format!("{:<24} ", "image name"));
        }
        if self.options.flags.contains(FormatFlags::APP) {
            columns.push_str(&format!("{:<24} ", "app name"));
        }
        if self.options.flags.contains(FormatFlags::SYMBOL) {
            columns.push_str("symbol name");
        }
        writeln!(out, "{}", columns.trim_end())
    }

    fn location_cell(&mut self, symbol: &SymbolEntry) -> String {
        match symbol.file_loc {
            Some(loc) => {
                let file = if self.options.long_filenames {
                    self.container.names.file(loc.file).to_string()
                } else {
                    self.container.names.file_basename(loc.file).to_string()
                };
                format!("{file}:{}", loc.line)
            }
            None => "(no location information)".to_string(),
        }
    }

    fn count_cells(
        &self,
        counts: &CountArray,
        totals: &CountArray,
        cumulative: &mut CountArray,
    ) -> String {
        let mut row = String::new();
        for class in 0..self.options.nr_classes {
            cumulative.add(class, counts.get(class));
            if self.options.flags.contains(FormatFlags::SAMPLES) {
                row.push_str(&format!("{:>COUNT_WIDTH$} ", counts.get(class)));
            }
            if self.options.flags.contains(FormatFlags::CUM_SAMPLES) {
                row.push_str(&format!("{:>COUNT_WIDTH$} ", cumulative.get(class)));
            }
            if self.options.flags.contains(FormatFlags::PERCENT) {
                row.push_str(&format_percent(
                    counts.get(class) as u64,
                    totals.get(class) as u64,
                ));
                row.push(' ');
            }
            if self.options.flags.contains(FormatFlags::CUM_PERCENT) {
                row.push_str(&format_percent(
                    cumulative.get(class) as u64,
                    totals.get(class) as u64,
                ));
                row.push(' ');
            }
        }
        row
    }

    /// Render the selected symbols. `totals` are the percentages' base:
    /// the container totals, or the whole-session totals for
    /// global-percent output.
    pub fn write_symbols(
        &mut self,
        out: &mut impl Write,
        symbols: &[&SymbolEntry],
        totals: &CountArray,
    ) -> io::Result<()> {
        let mut cumulative = CountArray::new();
        for symbol in symbols {
            let mut row = String::new();
            if self.options.flags.contains(FormatFlags::VMA) {
                row.push_str(&self.vma_cell(symbol.vma));
                row.push(' ');
            }
            row.push_str(&self.count_cells(&symbol.counts, totals, &mut cumulative));
            if self.options.flags.contains(FormatFlags::LINENR) {
                row.push_str(&format!("{:<20} ", self.location_cell(symbol)));
            }
            if self.options.flags.contains(FormatFlags::IMAGE) {
                row.push_str(&format!(
                    "{:<24} ",
                    self.container.names.image_basename(symbol.image)
                ));
            }
            if self.options.flags.contains(FormatFlags::APP) {
                row.push_str(&format!(
                    "{:<24} ",
                    self.container.names.image_basename(symbol.app)
                ));
            }
            if self.options.flags.contains(FormatFlags::SYMBOL) {
                let name = if self.options.demangle {
                    self.container.names.symbol_demangled(symbol.name).to_string()
                } else {
                    self.container.names.symbol(symbol.name).to_string()
                };
                row.push_str(&name);
            }
            writeln!(out, "{}", row.trim_end())?;

            if self.options.show_details {
                self.write_details(out, symbol)?;
            }
        }
        Ok(())
    }

    /// Per-address rows below a symbol, indented, percentages relative
    /// to the symbol's own total.
    fn write_details(&mut self, out: &mut impl Write, symbol: &SymbolEntry) -> io::Result<()> {
        let details = self.container.details_for(symbol);
        let rows: Vec<(u64, Option<crate::container::FileLocation>, CountArray)> = details
            .into_iter()
            .map(|(vma, loc, counts)| (vma, loc, counts.clone()))
            .collect();
        for (vma, loc, counts) in rows {
            let mut row = String::from("  ");
            row.push_str(&self.vma_cell(vma));
            row.push(' ');
            let mut scratch = CountArray::new();
            row.push_str(&self.count_cells(&counts, &symbol.counts, &mut scratch));
            if let Some(loc) = loc {
                let file = if self.options.long_filenames {
                    self.container.names.file(loc.file).to_string()
                } else {
                    self.container.names.file_basename(loc.file).to_string()
                };
                row.push_str(&format!("{file}:{}", loc.line));
            }
            writeln!(out, "{}", row.trim_end())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FileLocation;

    fn sample_container() -> ProfileContainer {
        let mut container = ProfileContainer::new(false, false);
        let image = container.names.intern_image("/bin/A");
        let libc = container.names.intern_image("/lib/libc.so");
        let main_name = container.names.intern_symbol("main");
        let memcpy = container.names.intern_symbol("memcpy");
        let file = container.names.intern_file("/src/a.c");

        let mut counts = CountArray::new();
        counts.add(0, 75);
        container.push_symbol_for_tests(SymbolEntry {
            image,
            app: image,
            name: main_name,
            vma: 0x400100,
            size: 0x40,
            file_loc: Some(FileLocation { file, line: 42 }),
            counts,
        });
        let mut counts = CountArray::new();
        counts.add(0, 25);
        container.push_symbol_for_tests(SymbolEntry {
            image: libc,
            app: image,
            name: memcpy,
            vma: 0x500200,
            size: 0x40,
            file_loc: None,
            counts,
        });
        container
    }

    #[test]
    fn rows_carry_percentages_and_names() {
        let mut container = sample_container();
        let mut totals = CountArray::new();
        totals.add(0, 100);

        // Clone the selection so the formatter can borrow the container.
        let cloned: Vec<SymbolEntry> = container.symbols().to_vec();
        let refs: Vec<&SymbolEntry> = cloned.iter().collect();
        let mut out = Vec::new();
        let mut formatter = Formatter::new(&mut container, FormatOptions::default());
        formatter.write_symbols(&mut out, &refs, &totals).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("75"));
        assert!(lines[0].contains("75.0000"));
        assert!(lines[0].contains("A"));
        assert!(lines[0].ends_with("main"));
        assert!(lines[1].contains("25.0000"));
        assert!(lines[1].contains("libc.so"));
        assert!(lines[1].ends_with("memcpy"));
    }

    #[test]
    fn vma_and_cumulative_columns() {
        let mut container = sample_container();
        let mut totals = CountArray::new();
        totals.add(0, 100);

        let options = FormatOptions {
            flags: FormatFlags::VMA
                | FormatFlags::SAMPLES
                | FormatFlags::CUM_SAMPLES
                | FormatFlags::PERCENT
                | FormatFlags::CUM_PERCENT
                | FormatFlags::SYMBOL,
            ..Default::default()
        };
        let cloned: Vec<SymbolEntry> = container.symbols().to_vec();
        let refs: Vec<&SymbolEntry> = cloned.iter().collect();
        let mut out = Vec::new();
        let mut formatter = Formatter::new(&mut container, options);
        formatter.write_symbols(&mut out, &refs, &totals).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("00400100"));
        // Cumulative percent reaches 100 on the last row.
        assert!(lines[1].contains("100.0000") || lines[1].contains("100.000"));
    }

    #[test]
    fn percent_formatting_is_fixed_width() {
        assert_eq!(format_percent(75, 100), "  75.0000");
        assert_eq!(format_percent(0, 0), "   0.0000");
        assert_eq!(format_percent(1, 3), "  33.3333");
    }
}

mod cli;
mod populate;

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::warn;

use oxprof_pp::arrange::MergeOptions;
use oxprof_pp::binary::BinaryImage;
use oxprof_pp::callgraph::CallgraphContainer;
use oxprof_pp::container::{sort_symbols, CountArray, SortOrder, SymbolEntry};
use oxprof_pp::format::{FormatFlags, FormatOptions, Formatter};
use oxprof_pp::gprof::output_gprof;
use oxprof_pp::spec::ProfileSpec;
use oxprof_pp::PpError;

use cli::{Action, CommonArgs, DiffArgs, GprofArgs, Opt, ReportArgs, StackArgs};
use populate::{load_callgraph, load_profile, Loaded};

fn main() {
    env_logger::init();
    let opt = match Opt::try_parse() {
        Ok(opt) => opt,
        Err(err) => {
            use clap::error::ErrorKind;
            let _ = err.print();
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };
    let result = match opt.action {
        Action::Report(args) => do_report(args, false),
        Action::Annotate(args) => do_report(args, true),
        Action::Gprof(args) => do_gprof(args),
        Action::Stack(args) => do_stack(args),
        Action::Diff(args) => do_diff(args),
    };
    if let Err(err) = result {
        eprintln!("oxprof: {err}");
        std::process::exit(1);
    }
}

/// The samples directory a specification selects: `session:NAME` picks a
/// named (possibly rotated) session, the default is `current`.
fn samples_dir(session_dir: &Path, spec: &ProfileSpec) -> PathBuf {
    let session = spec.session.first().map(String::as_str).unwrap_or("current");
    session_dir.join("samples").join(session)
}

fn open_output(common: &CommonArgs) -> Result<Box<dyn Write>, PpError> {
    match &common.output_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|source| PpError::Io { path: path.clone(), source })?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(std::io::stdout())),
    }
}

fn parse_sort(sort: &str) -> Result<Vec<SortOrder>, PpError> {
    let mut orders = Vec::new();
    for name in sort.split(',').filter(|s| !s.is_empty()) {
        let order = SortOrder::parse(name)
            .ok_or_else(|| PpError::BadSpec(format!("unknown sort key: {name}")))?;
        orders.push(order);
    }
    if orders.is_empty() {
        orders.push(SortOrder::Sample);
    }
    // Ties break with the next orders in a fixed fallback chain.
    for fallback in [SortOrder::Image, SortOrder::AppName, SortOrder::Symbol, SortOrder::Vma] {
        if !orders.contains(&fallback) {
            orders.push(fallback);
        }
    }
    Ok(orders)
}

fn split_names(list: &Option<String>) -> Vec<String> {
    list.as_deref()
        .map(|s| s.split(',').filter(|n| !n.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

fn load_common(common: &CommonArgs, details: bool) -> Result<Loaded, PpError> {
    let spec = ProfileSpec::parse(&common.spec)?;
    let merge = MergeOptions::parse(&common.merge)?;
    load_profile(
        &samples_dir(&common.session_dir, &spec),
        &spec,
        &merge,
        common.exclude_dependent,
        details,
        common.debug_info,
    )
}

/// Symbol selection shared by report and annotate: threshold, name
/// filters and sorting.
fn select_symbols<'a>(
    loaded: &'a Loaded,
    common: &CommonArgs,
) -> (Vec<&'a SymbolEntry>, oxprof_pp::container::SelectHints) {
    let (mut selected, hints) = loaded.container.select(common.threshold);

    let include = split_names(&common.include_symbols);
    let exclude = split_names(&common.exclude_symbols);
    if !include.is_empty() || !exclude.is_empty() {
        selected.retain(|sym| {
            let name = loaded.container.names.symbol(sym.name);
            if !include.is_empty() && !include.iter().any(|n| n == name) {
                return false;
            }
            !exclude.iter().any(|n| n == name)
        });
    }

    let orders = match parse_sort(&common.sort) {
        Ok(orders) => orders,
        Err(err) => {
            warn!("{err}; sorting by sample count");
            vec![SortOrder::Sample]
        }
    };
    sort_symbols(&mut selected, &orders, common.reverse_sort, &loaded.container.names);
    (selected, hints)
}

fn do_report(args: ReportArgs, annotate: bool) -> Result<(), PpError> {
    let want_details = annotate || args.details;
    let mut loaded = load_common(&args.common, want_details)?;
    let mut out = open_output(&args.common)?;

    if !args.symbols && !annotate {
        return image_summary(&mut loaded, &mut out, &args.common);
    }

    let (selected, hints) = select_symbols(&loaded, &args.common);
    let selected: Vec<SymbolEntry> = selected.into_iter().cloned().collect();
    let refs: Vec<&SymbolEntry> = selected.iter().collect();

    let mut flags = FormatFlags::default();
    if annotate {
        flags = FormatFlags::VMA
            | FormatFlags::SAMPLES
            | FormatFlags::PERCENT
            | FormatFlags::LINENR
            | FormatFlags::SYMBOL;
    } else if args.common.debug_info {
        flags |= FormatFlags::LINENR;
    }
    if args.common.accumulated {
        flags |= FormatFlags::CUM_SAMPLES | FormatFlags::CUM_PERCENT;
    }

    let mut options = FormatOptions {
        flags,
        nr_classes: loaded.classes.classes.len(),
        long_filenames: args.common.long_filenames,
        show_details: want_details,
        accumulated: args.common.accumulated,
        demangle: !args.common.no_demangle,
        ..Default::default()
    };
    options.apply_hints(&hints);

    // Percentages are relative to the listed symbols, unless the whole
    // profile was asked for as the base.
    let totals = if args.common.global_percent {
        loaded.container.samples_count().clone()
    } else {
        let mut selection_totals = CountArray::new();
        for symbol in &selected {
            selection_totals.accumulate(&symbol.counts);
        }
        selection_totals
    };
    let classes = loaded.classes.clone();
    let mut formatter = Formatter::new(&mut loaded.container, options);
    formatter
        .write_header(&mut out, &classes)
        .and_then(|()| formatter.write_symbols(&mut out, &refs, &totals))
        .map_err(io_error)
}

/// The per-binary totals view: the default `report` output.
fn image_summary(
    loaded: &mut Loaded,
    out: &mut dyn Write,
    common: &CommonArgs,
) -> Result<(), PpError> {
    let nr_classes = loaded.classes.classes.len().max(1);
    let mut per_image: Vec<(String, CountArray)> = Vec::new();
    for symbol in loaded.container.symbols() {
        let name = if common.long_filenames {
            loaded.container.names.image(symbol.image).to_string()
        } else {
            loaded.container.names.image_basename(symbol.image).to_string()
        };
        match per_image.iter_mut().find(|(n, _)| *n == name) {
            Some((_, counts)) => counts.accumulate(&symbol.counts),
            None => per_image.push((name, symbol.counts.clone())),
        }
    }
    per_image.sort_by(|a, b| b.1.get(0).cmp(&a.1.get(0)));

    let totals = loaded.container.samples_count();
    if !loaded.classes.event.is_empty() {
        writeln!(out, "Counted {}", loaded.classes.event).map_err(io_error)?;
    }
    for (name, counts) in per_image {
        let mut row = String::new();
        for class in 0..nr_classes {
            let count = counts.get(class);
            let total = totals.get(class);
            let percent =
                if total == 0 { 0.0 } else { count as f64 * 100.0 / total as f64 };
            row.push_str(&format!("{count:>9} {percent:>9.4} "));
        }
        row.push_str(&name);
        writeln!(out, "{row}").map_err(io_error)?;
    }
    Ok(())
}

fn do_gprof(args: GprofArgs) -> Result<(), PpError> {
    let spec = ProfileSpec::parse(&args.common.spec)?;
    let merge = MergeOptions::parse(&args.common.merge)?;
    let loaded = load_profile(
        &samples_dir(&args.common.session_dir, &spec),
        &spec,
        &merge,
        args.common.exclude_dependent,
        true,
        false,
    )?;

    // gmon.out covers exactly one binary.
    let mut image_names: Vec<&str> = loaded
        .container
        .symbols()
        .iter()
        .map(|s| loaded.container.names.image(s.image))
        .collect();
    image_names.sort();
    image_names.dedup();
    let image_name = match image_names.as_slice() {
        [] => return Err(PpError::EmptyProfileSet),
        [single] => single.to_string(),
        [first, ..] => {
            return Err(PpError::ImageMultipleMatch(format!(
                "{} images including {first}",
                image_names.len()
            )))
        }
    };

    let image = BinaryImage::open(Path::new(&image_name), false)?;

    let (selected, _) = loaded.container.select(args.common.threshold);
    let mut out = std::io::BufWriter::new(
        std::fs::File::create(&args.output)
            .map_err(|source| PpError::Io { path: args.output.clone(), source })?,
    );
    output_gprof(&mut out, &loaded.container, &selected, &image).map_err(io_error)
}

fn do_stack(args: StackArgs) -> Result<(), PpError> {
    let spec = ProfileSpec::parse(&args.common.spec)?;
    let merge = MergeOptions::parse(&args.common.merge)?;
    let (mut loaded, cg) = load_callgraph(
        &samples_dir(&args.common.session_dir, &spec),
        &spec,
        &merge,
        args.prune,
    )?;
    let mut out = open_output(&args.common)?;
    write_callgraph(&mut out, &cg, &mut loaded).map_err(io_error)
}

/// Render arcs the classic way: callers above, the function itself
/// flush left, callees below.
fn write_callgraph(
    out: &mut dyn Write,
    cg: &CallgraphContainer,
    loaded: &mut Loaded,
) -> std::io::Result<()> {
    let total = cg.total().get(0) as u64;
    writeln!(out, "samples  %        image name               symbol name")?;
    for (key, entry) in cg.arcs() {
        writeln!(out, "{}", "-".repeat(60))?;
        for caller in cg.callers_of(&key) {
            let name = loaded.container.names.symbol_demangled(caller.key.name).to_string();
            let image = loaded.container.names.image_basename(caller.key.image).to_string();
            writeln!(out, "  {:>7}          {:<24} {}", caller.counts.get(0), image, name)?;
        }

        let self0 = entry.self_counts.get(0) as u64;
        let percent = if total == 0 { 0.0 } else { self0 as f64 * 100.0 / total as f64 };
        let name = loaded.container.names.symbol_demangled(key.name).to_string();
        let image = loaded.container.names.image_basename(key.image).to_string();
        writeln!(out, "{self0:>7}  {percent:>7.4} {image:<24} {name}")?;

        for callee in cg.callees_of(&key) {
            let name = loaded.container.names.symbol_demangled(callee.key.name).to_string();
            let image = loaded.container.names.image_basename(callee.key.image).to_string();
            writeln!(out, "  {:>7}          {:<24} {}", callee.counts.get(0), image, name)?;
        }
    }
    Ok(())
}

fn do_diff(args: DiffArgs) -> Result<(), PpError> {
    let spec = ProfileSpec::parse(&args.common.spec)?;
    let merge = MergeOptions::parse(&args.common.merge)?;

    let old = load_profile(
        &samples_dir(&args.base_session_dir, &spec),
        &spec,
        &merge,
        args.common.exclude_dependent,
        false,
        false,
    )?;
    let new = load_profile(
        &samples_dir(&args.common.session_dir, &spec),
        &spec,
        &merge,
        args.common.exclude_dependent,
        false,
        false,
    )?;

    let diff = oxprof_pp::diff::DiffContainer::new(&old.container, &new.container);
    let mut out = open_output(&args.common)?;
    let totals = diff.samples_count().clone();

    writeln!(out, "samples  %        diff %    image name               symbol name")
        .map_err(io_error)?;
    for symbol in diff.symbols() {
        let count = symbol.counts.get(0);
        let total = totals.get(0);
        let percent = if total == 0 { 0.0 } else { count as f64 * 100.0 / total as f64 };
        let delta = match symbol.diffs.first().copied().unwrap_or(0.0) {
            d if d == f64::INFINITY => "     +++".to_string(),
            d if d == f64::NEG_INFINITY => "     ---".to_string(),
            d => format!("{d:>8.2}"),
        };
        let image = if args.common.long_filenames {
            symbol.image.clone()
        } else {
            symbol.image.rsplit('/').next().unwrap_or(&symbol.image).to_string()
        };
        writeln!(out, "{count:>7}  {percent:>7.4} {delta}  {image:<24} {}", symbol.name)
            .map_err(io_error)?;
    }
    Ok(())
}

fn io_error(source: std::io::Error) -> PpError {
    PpError::Io { path: PathBuf::from("<output>"), source }
}

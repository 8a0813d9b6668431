//! Classify a candidate list of sample files into merged sets and
//! equivalence classes, one class per report column.

use std::collections::BTreeMap;

use oxprof_mangle::{parse_filename, ParsedFilename};

use crate::error::PpError;

/// Axes a report may merge over instead of splitting into classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    pub cpu: bool,
    pub lib: bool,
    pub tid: bool,
    pub tgid: bool,
    pub unitmask: bool,
}

impl MergeOptions {
    pub fn parse(axes: &str) -> Result<MergeOptions, PpError> {
        let mut merge = MergeOptions::default();
        for axis in axes.split(',').filter(|a| !a.is_empty()) {
            match axis {
                "cpu" => merge.cpu = true,
                "lib" | "library" => merge.lib = true,
                "tid" => merge.tid = true,
                "tgid" => merge.tgid = true,
                "unitmask" => merge.unitmask = true,
                "all" => {
                    merge = MergeOptions {
                        cpu: true,
                        lib: true,
                        tid: true,
                        tgid: true,
                        unitmask: true,
                    }
                }
                other => return Err(PpError::BadSpec(format!("unknown merge axis: {other}"))),
            }
        }
        Ok(merge)
    }
}

/// The axis values pinned for every member of a class. Merged axes stay
/// empty so they never distinguish classes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProfileTemplate {
    pub event: String,
    pub count: String,
    pub unitmask: String,
    pub tgid: String,
    pub tid: String,
    pub cpu: String,
}

/// The files of one primary image inside a class, with its dependent
/// images in sub-sets.
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    pub image: String,
    pub files: Vec<String>,
    pub cg_files: Vec<String>,
    pub deps: Vec<ProfileDepSet>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileDepSet {
    pub lib_image: String,
    pub files: Vec<String>,
    pub cg_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileClass {
    pub template: ProfileTemplate,
    pub name: String,
    pub longname: String,
    pub profiles: Vec<ProfileSet>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileClasses {
    pub classes: Vec<ProfileClass>,
    /// Event description shared by all classes, cleared when the event
    /// itself is the varying axis.
    pub event: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Event,
    Unitmask,
    Tgid,
    Tid,
    Cpu,
}

const AXES: [(Axis, &str, &str); 5] = [
    (Axis::Event, "event", "specify event: or count:"),
    (Axis::Unitmask, "unitmask", "specify unitmask: or -m unitmask"),
    (Axis::Tgid, "tgid", "specify tgid: or -m tgid"),
    (Axis::Tid, "tid", "specify tid: or -m tid"),
    (Axis::Cpu, "cpu", "specify cpu: or -m cpu"),
];

fn template_from(parsed: &ParsedFilename, merge_by: &MergeOptions) -> ProfileTemplate {
    let mut template = ProfileTemplate {
        event: parsed.event.clone(),
        count: parsed.count.clone(),
        ..Default::default()
    };
    if !merge_by.unitmask {
        template.unitmask = parsed.unitmask.clone();
    }
    if !merge_by.tgid {
        template.tgid = parsed.tgid.clone();
    }
    if !merge_by.tid {
        template.tid = parsed.tid.clone();
    }
    if !merge_by.cpu {
        template.cpu = parsed.cpu.clone();
    }
    template
}

fn set_files(set: &mut ProfileSet, is_cg: bool) -> &mut Vec<String> {
    if is_cg {
        &mut set.cg_files
    } else {
        &mut set.files
    }
}

fn dep_set_files(dep: &mut ProfileDepSet, is_cg: bool) -> &mut Vec<String> {
    if is_cg {
        &mut dep.cg_files
    } else {
        &mut dep.files
    }
}

fn add_to_profile_set(set: &mut ProfileSet, parsed: &ParsedFilename, is_cg: bool) {
    if parsed.image == parsed.lib_image {
        set_files(set, is_cg).push(parsed.filename.clone());
        return;
    }
    if let Some(dep) = set.deps.iter_mut().find(|d| d.lib_image == parsed.lib_image) {
        dep_set_files(dep, is_cg).push(parsed.filename.clone());
        return;
    }
    let mut dep = ProfileDepSet { lib_image: parsed.lib_image.clone(), ..Default::default() };
    dep_set_files(&mut dep, is_cg).push(parsed.filename.clone());
    set.deps.push(dep);
}

fn add_profile(class: &mut ProfileClass, parsed: &ParsedFilename) {
    let is_cg = !parsed.cg_image.is_empty();
    if let Some(set) = class.profiles.iter_mut().find(|s| s.image == parsed.image) {
        add_to_profile_set(set, parsed, is_cg);
        return;
    }
    let mut set = ProfileSet { image: parsed.image.clone(), ..Default::default() };
    add_to_profile_set(&mut set, parsed, is_cg);
    class.profiles.push(set);
}

/// "all" sorts below any number; numbers compare numerically.
fn numeric_compare(lhs: &str, rhs: &str) -> std::cmp::Ordering {
    let parse = |s: &str| s.parse::<u64>().ok();
    match (parse(lhs), parse(rhs)) {
        (Some(l), Some(r)) => l.cmp(&r),
        (None, None) => lhs.cmp(rhs),
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
    }
}

fn class_order(lhs: &ProfileTemplate, rhs: &ProfileTemplate) -> std::cmp::Ordering {
    numeric_compare(&lhs.cpu, &rhs.cpu)
        .then_with(|| numeric_compare(&lhs.tgid, &rhs.tgid))
        .then_with(|| numeric_compare(&lhs.tid, &rhs.tid))
        .then_with(|| numeric_compare(&lhs.unitmask, &rhs.unitmask))
        .then_with(|| lhs.event.cmp(&rhs.event))
        .then_with(|| lhs.count.cmp(&rhs.count))
}

/// Work out which single axis distinguishes the classes; a second
/// varying axis is a taxonomy error naming the first conflict and the
/// switch that would merge it away.
fn identify_classes(
    classes: &mut ProfileClasses,
    merge_by: &MergeOptions,
) -> Result<(), PpError> {
    let template = classes.classes[0].template.clone();
    let mut changed = [false; 5];

    // A single class is named after its event.
    if classes.classes.len() == 1 {
        changed[0] = true;
    }

    for class in &classes.classes[1..] {
        let t = &class.template;
        if t.event != template.event || t.count != template.count {
            changed[0] = true;
        }
        // The merge checks matter here: each template is filled from the
        // first non-matching profile, so a difference on a merged axis
        // is not the axis we care about.
        if !merge_by.unitmask && t.unitmask != template.unitmask {
            changed[1] = true;
        }
        if !merge_by.tgid && t.tgid != template.tgid {
            changed[2] = true;
        }
        if !merge_by.tid && t.tid != template.tid {
            changed[3] = true;
        }
        if !merge_by.cpu && t.cpu != template.cpu {
            changed[4] = true;
        }
    }

    let mut axis: Option<usize> = None;
    for (i, &was_changed) in changed.iter().enumerate() {
        if !was_changed {
            continue;
        }
        if let Some(previous) = axis {
            // Name the first varying axis and how to pin it; once that
            // one is merged or specified, only `i` remains.
            return Err(PpError::TaxonomyConflict {
                axis: AXES[previous].1,
                other_axis: AXES[i].1,
                suggestion: AXES[previous].2,
            });
        }
        axis = Some(i);
    }
    let axis = axis.unwrap_or(0);

    name_classes(classes, AXES[axis].0);
    Ok(())
}

fn name_classes(classes: &mut ProfileClasses, axis: Axis) {
    classes.event = format!(
        "event {} with a unit mask of {} and count {}",
        classes.classes[0].template.event,
        classes.classes[0].template.unitmask,
        classes.classes[0].template.count
    );
    if axis == Axis::Event {
        classes.event.clear();
    }

    for class in &mut classes.classes {
        let t = &class.template;
        match axis {
            Axis::Event => {
                class.name = format!("{}:{}", t.event, t.count);
                class.longname =
                    format!("event {} with count {}", t.event, t.count);
            }
            Axis::Unitmask => {
                class.name = format!("unitmask:{}", t.unitmask);
                class.longname =
                    format!("Samples matching a unit mask of {}", t.unitmask);
            }
            Axis::Tgid => {
                class.name = format!("tgid:{}", t.tgid);
                class.longname =
                    format!("Processes with a thread group ID of {}", t.tgid);
            }
            Axis::Tid => {
                class.name = format!("tid:{}", t.tid);
                class.longname = format!("Processes with a thread ID of {}", t.tid);
            }
            Axis::Cpu => {
                class.name = format!("cpu:{}", t.cpu);
                class.longname = format!("Samples on CPU {}", t.cpu);
            }
        }
    }
}

/// The heart of merging and classification: bucket files by template,
/// group by primary image, order the classes, and verify the taxonomy.
pub fn arrange_profiles(
    files: &[String],
    merge_by: &MergeOptions,
) -> Result<ProfileClasses, PpError> {
    let mut by_template: BTreeMap<ProfileTemplate, ProfileClass> = BTreeMap::new();

    for file in files {
        let mut parsed = parse_filename(file)?;
        if parsed.lib_image.is_empty() {
            parsed.lib_image = parsed.image.clone();
        }
        // When merging libraries the owning application cannot matter;
        // afterwards any non-dependent file has image == lib_image.
        if merge_by.lib {
            parsed.image = parsed.lib_image.clone();
        }

        let template = template_from(&parsed, merge_by);
        let class = by_template.entry(template.clone()).or_insert_with(|| ProfileClass {
            template,
            ..Default::default()
        });
        add_profile(class, &parsed);
    }

    let mut classes =
        ProfileClasses { classes: by_template.into_values().collect(), event: String::new() };
    if classes.classes.is_empty() {
        return Ok(classes);
    }

    classes.classes.sort_by(|a, b| class_order(&a.template, &b.template));
    identify_classes(&mut classes, merge_by)?;
    Ok(classes)
}

/// The class collection re-keyed by binary image, one entry per image,
/// carrying a parallel vector of per-class file groups.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    pub app_image: String,
    pub files: Vec<String>,
    pub cg_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InvertedProfile {
    pub image: String,
    /// One group list per class, class order preserved.
    pub groups: Vec<Vec<ImageSet>>,
}

fn get_inverted<'a>(
    by_image: &'a mut BTreeMap<String, InvertedProfile>,
    image: &str,
    nr_classes: usize,
) -> &'a mut InvertedProfile {
    by_image
        .entry(image.to_string())
        .or_insert_with(|| InvertedProfile {
            image: image.to_string(),
            groups: vec![Vec::new(); nr_classes],
        })
}

pub fn invert_profiles(classes: &ProfileClasses) -> Vec<InvertedProfile> {
    let nr_classes = classes.classes.len();
    let mut by_image: BTreeMap<String, InvertedProfile> = BTreeMap::new();

    for (i, class) in classes.classes.iter().enumerate() {
        for set in &class.profiles {
            // A set can be empty when only a library of the app was hit.
            if !set.files.is_empty() || !set.cg_files.is_empty() {
                let ip = get_inverted(&mut by_image, &set.image, nr_classes);
                ip.groups[i].push(ImageSet {
                    app_image: set.image.clone(),
                    files: set.files.clone(),
                    cg_files: set.cg_files.clone(),
                });
            }
            for dep in &set.deps {
                let ip = get_inverted(&mut by_image, &dep.lib_image, nr_classes);
                ip.groups[i].push(ImageSet {
                    app_image: set.image.clone(),
                    files: dep.files.clone(),
                    cg_files: dep.cg_files.clone(),
                });
            }
        }
    }

    by_image.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(image: &str, event: &str, um: &str, cpu: &str) -> String {
        format!("{{root}}{image}/{event}.100000.{um}.all.all.{cpu}")
    }

    #[test]
    fn identical_templates_form_one_class() {
        let files = vec![file("/bin/A", "CLK", "0", "all"), file("/lib/libc.so", "CLK", "0", "all")];
        let classes = arrange_profiles(&files, &MergeOptions::default()).unwrap();
        assert_eq!(classes.classes.len(), 1);
        assert_eq!(classes.classes[0].profiles.len(), 2);
        // A single class is named after the event.
        assert_eq!(classes.classes[0].name, "CLK:100000");
    }

    #[test]
    fn cpu_axis_splits_and_names_classes() {
        let files = vec![file("/bin/A", "CLK", "0", "0"), file("/bin/A", "CLK", "0", "3")];
        let classes = arrange_profiles(&files, &MergeOptions::default()).unwrap();
        assert_eq!(classes.classes.len(), 2);
        assert_eq!(classes.classes[0].name, "cpu:0");
        assert_eq!(classes.classes[1].name, "cpu:3");
        assert_eq!(classes.classes[1].longname, "Samples on CPU 3");
    }

    #[test]
    fn merged_axes_do_not_split() {
        let files = vec![file("/bin/A", "CLK", "0", "0"), file("/bin/A", "CLK", "0", "3")];
        let merge = MergeOptions { cpu: true, ..Default::default() };
        let classes = arrange_profiles(&files, &merge).unwrap();
        assert_eq!(classes.classes.len(), 1);
        assert_eq!(classes.classes[0].profiles[0].files.len(), 2);
    }

    #[test]
    fn two_varying_axes_name_the_first_conflict() {
        let files = vec![file("/bin/A", "CLK", "0", "0"), file("/bin/A", "CLK", "1", "3")];
        match arrange_profiles(&files, &MergeOptions::default()) {
            Err(PpError::TaxonomyConflict { axis, other_axis, suggestion }) => {
                assert_eq!(axis, "unitmask");
                assert_eq!(other_axis, "cpu");
                assert_eq!(suggestion, "specify unitmask: or -m unitmask");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn arrangement_is_order_independent() {
        let mut files = vec![
            file("/bin/A", "CLK", "0", "0"),
            file("/bin/A", "CLK", "0", "1"),
            file("/lib/libc.so", "CLK", "0", "0"),
            file("/lib/libc.so", "CLK", "0", "1"),
        ];
        let a = arrange_profiles(&files, &MergeOptions::default()).unwrap();
        files.reverse();
        let b = arrange_profiles(&files, &MergeOptions::default()).unwrap();
        let names = |c: &ProfileClasses| {
            c.classes.iter().map(|cl| cl.name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&a), names(&b));
        for (ca, cb) in a.classes.iter().zip(&b.classes) {
            let images = |c: &ProfileClass| {
                let mut v: Vec<String> = c.profiles.iter().map(|p| p.image.clone()).collect();
                v.sort();
                v
            };
            assert_eq!(images(ca), images(cb));
        }
    }

    #[test]
    fn dependent_images_group_under_their_app() {
        let files = vec![
            "{root}/bin/A/CLK.100000.0.all.all.all".to_string(),
            "{root}/lib/libc.so/{dep}/{root}/bin/A/CLK.100000.0.all.all.all".to_string(),
        ];
        let classes = arrange_profiles(&files, &MergeOptions::default()).unwrap();
        assert_eq!(classes.classes.len(), 1);
        let set = &classes.classes[0].profiles[0];
        assert_eq!(set.image, "/bin/A");
        assert_eq!(set.files.len(), 1);
        assert_eq!(set.deps.len(), 1);
        assert_eq!(set.deps[0].lib_image, "/lib/libc.so");

        let inverted = invert_profiles(&classes);
        assert_eq!(inverted.len(), 2);
        assert_eq!(inverted[0].image, "/bin/A");
        assert_eq!(inverted[1].image, "/lib/libc.so");
        assert_eq!(inverted[1].groups[0][0].app_image, "/bin/A");
    }

    #[test]
    fn callgraph_files_ride_in_their_own_list() {
        let files = vec![
            "{root}/bin/A/CLK.100000.0.all.all.all".to_string(),
            "{root}/bin/A/{cg}/{root}/lib/libc.so/CLK.100000.0.all.all.all".to_string(),
        ];
        let classes = arrange_profiles(&files, &MergeOptions::default()).unwrap();
        let set = &classes.classes[0].profiles[0];
        assert_eq!(set.files.len(), 1);
        assert_eq!(set.cg_files.len(), 1);
    }
}

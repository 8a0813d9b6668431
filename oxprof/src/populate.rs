//! Loading: turn a profile specification into populated containers.

use std::path::Path;

use log::debug;

use oxprof_db::{Odb, OdbMode};
use oxprof_mangle::parse_filename;
use oxprof_pp::arrange::{arrange_profiles, invert_profiles, MergeOptions, ProfileClasses};
use oxprof_pp::binary::{BinaryImage, ImageErrors};
use oxprof_pp::callgraph::{CallgraphContainer, CgKey};
use oxprof_pp::container::ProfileContainer;
use oxprof_pp::profile::ProfileData;
use oxprof_pp::spec::{generate_file_list, ProfileSpec};
use oxprof_pp::PpError;

pub struct Loaded {
    pub classes: ProfileClasses,
    pub container: ProfileContainer,
}

/// Peek at one sample file's header to learn whether its image is a
/// kernel image (whose sample keys are text-relative).
fn file_is_kernel(path: &str) -> bool {
    Odb::open(Path::new(path), OdbMode::ReadOnly)
        .map(|odb| odb.header().is_kernel != 0)
        .unwrap_or(false)
}

fn open_image(
    image_name: &str,
    is_kernel: bool,
    errors: &mut ImageErrors,
) -> Option<BinaryImage> {
    match BinaryImage::open(Path::new(image_name), is_kernel) {
        Ok(image) => Some(image),
        Err(err) => {
            errors.report(image_name, &err);
            None
        }
    }
}

/// Arrange the matching sample files and populate a symbol container,
/// one class per report column.
pub fn load_profile(
    samples_dir: &Path,
    spec: &ProfileSpec,
    merge: &MergeOptions,
    exclude_dependent: bool,
    record_details: bool,
    record_debug_info: bool,
) -> Result<Loaded, PpError> {
    let files = generate_file_list(samples_dir, spec)?;
    let classes = arrange_profiles(&files, merge)?;
    let inverted = invert_profiles(&classes);

    let mut container = ProfileContainer::new(record_details, record_debug_info);
    let mut errors = ImageErrors::new();

    for ip in &inverted {
        let mut image = None;
        let mut image_opened = false;

        for (class, groups) in ip.groups.iter().enumerate() {
            for set in groups {
                if exclude_dependent && set.app_image != ip.image {
                    continue;
                }
                if set.files.is_empty() {
                    continue;
                }
                if !image_opened {
                    let is_kernel = file_is_kernel(&set.files[0]);
                    image = open_image(&ip.image, is_kernel, &mut errors);
                    image_opened = true;
                }

                let mut profile = ProfileData::new();
                let start_offset = image.as_ref().map(|i| i.start_offset()).unwrap_or(0);
                for file in &set.files {
                    profile.add_sample_file(Path::new(file), start_offset)?;
                }

                match &image {
                    Some(image) => {
                        profile.check_mtime(&ip.image, image.mtime());
                        container.add(&profile, image, &set.app_image, class)?;
                    }
                    None => {
                        let total = profile.total().min(u32::MAX as u64) as u32;
                        container.add_unresolved(&ip.image, &set.app_image, class, total);
                    }
                }
            }
        }
    }

    Ok(Loaded { classes, container })
}

/// Populate a callgraph: leaf entries from the linear profile, arcs from
/// the callgraph sample files, resolved through both ends' images.
pub fn load_callgraph(
    samples_dir: &Path,
    spec: &ProfileSpec,
    merge: &MergeOptions,
    prune_pct: f64,
) -> Result<(Loaded, CallgraphContainer), PpError> {
    let mut loaded = load_profile(samples_dir, spec, merge, false, false, false)?;
    let inverted = invert_profiles(&loaded.classes);
    let mut cg = CallgraphContainer::new();
    let mut errors = ImageErrors::new();

    // Every symbol with linear samples is a (potential) leaf.
    let entries: Vec<(CgKey, Vec<(usize, u32)>)> = loaded
        .container
        .symbols()
        .iter()
        .map(|sym| {
            let key = CgKey { image: sym.image, app: sym.app, name: sym.name, vma: sym.vma };
            let counts = (0..sym.counts.nr_classes())
                .map(|class| (class, sym.counts.get(class)))
                .collect();
            (key, counts)
        })
        .collect();
    for (key, counts) in entries {
        for (class, count) in counts {
            if count > 0 {
                cg.add_self(key, class, count);
            }
        }
    }

    for ip in &inverted {
        for (class, groups) in ip.groups.iter().enumerate() {
            for set in groups {
                for cg_file in &set.cg_files {
                    let parsed = parse_filename(cg_file)?;
                    let caller_name = &parsed.image;
                    let callee_name = &parsed.cg_image;

                    let Some(caller_image) =
                        open_image(caller_name, file_is_kernel(cg_file), &mut errors)
                    else {
                        continue;
                    };
                    let Some(callee_image) = open_image(callee_name, false, &mut errors) else {
                        continue;
                    };

                    let odb = Odb::open(Path::new(cg_file), OdbMode::ReadOnly)?;
                    for (key, count) in odb.iter() {
                        let from = key >> 32;
                        let to = key & 0xffff_ffff;
                        let (Some(caller_sym), Some(callee_sym)) =
                            (caller_image.find_by_key(from), callee_image.find_by_key(to))
                        else {
                            debug!("unresolvable arc {from:#x} -> {to:#x} in {cg_file}");
                            continue;
                        };
                        let names = &mut loaded.container.names;
                        let caller_key = CgKey {
                            image: names.intern_image(caller_name),
                            app: names.intern_image(&set.app_image),
                            name: names.intern_symbol(&caller_sym.name),
                            vma: caller_sym.vma,
                        };
                        let callee_key = CgKey {
                            image: names.intern_image(callee_name),
                            app: names.intern_image(&set.app_image),
                            name: names.intern_symbol(&callee_sym.name),
                            vma: callee_sym.vma,
                        };
                        let count = count.min(u32::MAX);
                        cg.add_arc(caller_key, callee_key, class, count);
                    }
                }
            }
        }
    }

    cg.fixup_callee_counts(prune_pct);
    Ok((loaded, cg))
}

//! End-to-end reporting over a synthetic session directory. The fake
//! binaries do not exist on disk, so the pipeline takes its address-only
//! path; totals and percentages must still come out right.

use std::path::Path;

use oxprof_db::{Odb, OdbMode, SampleFileHeader};
use oxprof_pp::arrange::MergeOptions;
use oxprof_pp::spec::ProfileSpec;

fn write_sample_file(samples_dir: &Path, rel: &str, entries: &[(u64, u32)]) {
    let path = samples_dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut odb = Odb::open(&path, OdbMode::ReadWrite).unwrap();
    let header = SampleFileHeader {
        event_id: 60,
        reset_count: 100_000,
        created_at: 1,
        ..Default::default()
    };
    odb.set_header(&header).unwrap();
    for &(key, value) in entries {
        odb.insert(key, value).unwrap();
    }
}

#[test]
fn linear_report_splits_75_25() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_file(dir.path(), "{root}/bin/A/CLK.100000.0.all.all.all", &[(0x100, 3)]);
    write_sample_file(
        dir.path(),
        "{root}/lib/libc.so/CLK.100000.0.all.all.all",
        &[(0x200, 1)],
    );

    let spec = ProfileSpec::default();
    let files = oxprof_pp::spec::generate_file_list(dir.path(), &spec).unwrap();
    assert_eq!(files.len(), 2);

    let classes =
        oxprof_pp::arrange::arrange_profiles(&files, &MergeOptions::default()).unwrap();
    assert_eq!(classes.classes.len(), 1);

    let inverted = oxprof_pp::arrange::invert_profiles(&classes);
    let mut container = oxprof_pp::container::ProfileContainer::new(false, false);
    for ip in &inverted {
        for (class, groups) in ip.groups.iter().enumerate() {
            for set in groups {
                let mut profile = oxprof_pp::profile::ProfileData::new();
                for file in &set.files {
                    profile.add_sample_file(Path::new(file), 0).unwrap();
                }
                let total = profile.total() as u32;
                container.add_unresolved(&ip.image, &set.app_image, class, total);
            }
        }
    }

    assert_eq!(container.samples_count().get(0), 4);
    let (selected, _) = container.select(0.0);
    assert_eq!(selected.len(), 2);

    let total = container.samples_count().get(0) as f64;
    let mut shares: Vec<(String, f64)> = selected
        .iter()
        .map(|s| {
            (
                container.names.image(s.image).to_string(),
                s.counts.get(0) as f64 * 100.0 / total,
            )
        })
        .collect();
    shares.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    assert_eq!(shares[0].0, "/bin/A");
    assert!((shares[0].1 - 75.0).abs() < 1e-9);
    assert_eq!(shares[1].0, "/lib/libc.so");
    assert!((shares[1].1 - 25.0).abs() < 1e-9);
}

#[test]
fn threshold_select_drops_small_symbols() {
    let dir = tempfile::tempdir().unwrap();
    write_sample_file(dir.path(), "{root}/bin/A/CLK.100000.0.all.all.all", &[(0x100, 97)]);
    write_sample_file(
        dir.path(),
        "{root}/lib/libc.so/CLK.100000.0.all.all.all",
        &[(0x200, 3)],
    );

    let files =
        oxprof_pp::spec::generate_file_list(dir.path(), &ProfileSpec::default()).unwrap();
    let classes =
        oxprof_pp::arrange::arrange_profiles(&files, &MergeOptions::default()).unwrap();
    let inverted = oxprof_pp::arrange::invert_profiles(&classes);

    let mut container = oxprof_pp::container::ProfileContainer::new(false, false);
    for ip in &inverted {
        for (class, groups) in ip.groups.iter().enumerate() {
            for set in groups {
                let mut profile = oxprof_pp::profile::ProfileData::new();
                for file in &set.files {
                    profile.add_sample_file(Path::new(file), 0).unwrap();
                }
                container.add_unresolved(&ip.image, &set.app_image, class, profile.total() as u32);
            }
        }
    }

    let (selected, _) = container.select(5.0);
    assert_eq!(selected.len(), 1);
    assert_eq!(container.names.image(selected[0].image), "/bin/A");
}

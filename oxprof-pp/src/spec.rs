//! Profile specifications: the `event:NAME count:N image:PATTERN ...`
//! tokens a report invocation selects its sample files with, and the
//! session-directory walk that produces the candidate list.

use std::path::{Path, PathBuf};

use oxprof_mangle::{parse_filename, ParsedFilename};

use crate::error::PpError;

/// A parsed profile specification. Each axis holds the accepted values;
/// an empty list accepts anything.
#[derive(Debug, Clone, Default)]
pub struct ProfileSpec {
    pub event: Vec<String>,
    pub count: Vec<String>,
    pub unitmask: Vec<String>,
    pub tid: Vec<String>,
    pub tgid: Vec<String>,
    pub cpu: Vec<String>,
    pub session: Vec<String>,
    pub image: Vec<String>,
    pub image_exclude: Vec<String>,
}

fn push_values(list: &mut Vec<String>, values: &str) {
    for value in values.split(',').filter(|v| !v.is_empty()) {
        list.push(value.to_string());
    }
}

impl ProfileSpec {
    /// Parse positional specification arguments. A bare token with no
    /// `key:` prefix is an image.
    pub fn parse(args: &[String]) -> Result<ProfileSpec, PpError> {
        let mut spec = ProfileSpec::default();
        for arg in args {
            let (key, values) = match arg.split_once(':') {
                // A plain path (or an absolute path with a drive-less
                // colon never occurs here) selects by image.
                None => ("image", arg.as_str()),
                Some((key, values)) => (key, values),
            };
            match key {
                "event" => push_values(&mut spec.event, values),
                "count" => push_values(&mut spec.count, values),
                "unitmask" => push_values(&mut spec.unitmask, values),
                "tid" => push_values(&mut spec.tid, values),
                "tgid" => push_values(&mut spec.tgid, values),
                "cpu" => push_values(&mut spec.cpu, values),
                "session" => push_values(&mut spec.session, values),
                "image" => push_values(&mut spec.image, values),
                "image-exclude" => push_values(&mut spec.image_exclude, values),
                other => {
                    return Err(PpError::BadSpec(format!("unknown specification key: {other}")))
                }
            }
        }
        Ok(spec)
    }

    fn axis_matches(accepted: &[String], value: &str) -> bool {
        accepted.is_empty() || accepted.iter().any(|a| a == value)
    }

    /// Substring-or-basename image matching, the usual way reports are
    /// narrowed to one binary.
    fn image_matches(pattern: &str, image: &str) -> bool {
        if pattern == image {
            return true;
        }
        let basename = image.rsplit('/').next().unwrap_or(image);
        basename == pattern || image.contains(pattern)
    }

    pub fn matches(&self, parsed: &ParsedFilename) -> bool {
        if !Self::axis_matches(&self.event, &parsed.event)
            || !Self::axis_matches(&self.count, &parsed.count)
            || !Self::axis_matches(&self.unitmask, &parsed.unitmask)
            || !Self::axis_matches(&self.tgid, &parsed.tgid)
            || !Self::axis_matches(&self.tid, &parsed.tid)
            || !Self::axis_matches(&self.cpu, &parsed.cpu)
        {
            return false;
        }

        let image = parsed.profile_image();
        if !self.image.is_empty() && !self.image.iter().any(|p| Self::image_matches(p, image)) {
            return false;
        }
        if self.image_exclude.iter().any(|p| Self::image_matches(p, image)) {
            return false;
        }
        true
    }
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            // Rotated sessions are separate profiles.
            if entry.file_name().to_string_lossy().starts_with("session-") {
                continue;
            }
            walk(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Collect every well-formed sample file under a samples directory.
pub fn list_sample_files(samples_dir: &Path) -> Result<Vec<String>, PpError> {
    let mut paths = Vec::new();
    walk(samples_dir, &mut paths)
        .map_err(|source| PpError::Io { path: samples_dir.to_owned(), source })?;

    let mut files = Vec::new();
    for path in paths {
        let name = path.display().to_string();
        if parse_filename(&name).is_ok() {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}

/// The candidate files matching a specification. An empty result is the
/// distinguished `EmptyProfileSet` error: reports have nothing to say.
pub fn generate_file_list(
    samples_dir: &Path,
    spec: &ProfileSpec,
) -> Result<Vec<String>, PpError> {
    let mut matched = Vec::new();
    for file in list_sample_files(samples_dir)? {
        let parsed = parse_filename(&file)?;
        if spec.matches(&parsed) {
            matched.push(file);
        }
    }
    if matched.is_empty() {
        return Err(PpError::EmptyProfileSet);
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn keys_and_bare_images_parse() {
        let spec = ProfileSpec::parse(&args(&[
            "event:CLK",
            "count:100000",
            "cpu:0,3",
            "/bin/A",
            "image-exclude:libc.so",
        ]))
        .unwrap();
        assert_eq!(spec.event, vec!["CLK"]);
        assert_eq!(spec.cpu, vec!["0", "3"]);
        assert_eq!(spec.image, vec!["/bin/A"]);
        assert_eq!(spec.image_exclude, vec!["libc.so"]);

        assert!(ProfileSpec::parse(&args(&["bogus:1"])).is_err());
    }

    #[test]
    fn matching_filters_axes_and_images() {
        let spec = ProfileSpec::parse(&args(&["event:CLK", "cpu:3", "image:A"])).unwrap();
        let hit = parse_filename("{root}/bin/A/CLK.100000.0.all.all.3").unwrap();
        let wrong_cpu = parse_filename("{root}/bin/A/CLK.100000.0.all.all.0").unwrap();
        let wrong_image = parse_filename("{root}/bin/B/CLK.100000.0.all.all.3").unwrap();
        assert!(spec.matches(&hit));
        assert!(!spec.matches(&wrong_cpu));
        assert!(!spec.matches(&wrong_image));
    }

    #[test]
    fn discovery_skips_rotated_sessions_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("{root}/bin/A");
        std::fs::create_dir_all(&current).unwrap();
        std::fs::write(current.join("CLK.100000.0.all.all.all"), b"").unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"").unwrap();
        let rotated = dir.path().join("session-1/{root}/bin/A");
        std::fs::create_dir_all(&rotated).unwrap();
        std::fs::write(rotated.join("CLK.100000.0.all.all.all"), b"").unwrap();

        let files = list_sample_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("{root}/bin/A/CLK.100000.0.all.all.all"));

        let spec = ProfileSpec::default();
        let list = generate_file_list(dir.path(), &spec).unwrap();
        assert_eq!(list.len(), 1);

        let nothing = ProfileSpec::parse(&args(&["event:NOPE"])).unwrap();
        match generate_file_list(dir.path(), &nothing) {
            Err(PpError::EmptyProfileSet) => {}
            other => panic!("{other:?}"),
        }
    }
}

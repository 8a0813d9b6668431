//! Canonical sample-file names.
//!
//! A sample file's path encodes everything needed to classify it:
//!
//! ```text
//! {root|kern}/<image>/[{dep}/{root|kern}/<dep_image>/]
//!     [{cg}/{root|kern}/<cg_image>/]
//!     <event>.<count>.<unitmask>.<tgid|all>.<tid|all>.<cpu|all>
//! ```
//!
//! `{kern}` marks a kernel or kernel-module image whose name is a single
//! path component; everything else lives under `{root}`. The `{dep}`
//! subtree is present only when the dependent (owning application) image
//! differs from the primary image.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MangleError {
    #[error("invalid sample filename: {0}")]
    InvalidFilename(String),

    #[error("bad event specification in sample filename: {0}")]
    InvalidEventSpec(String),
}

/// Everything that determines a sample file's canonical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MangleValues {
    /// Primary image the samples belong to.
    pub image_name: String,
    /// Owning application image; equal to `image_name` when samples are
    /// not separated by application.
    pub dep_name: String,
    /// Callgraph target image, for arc sample files.
    pub cg_name: Option<String>,
    pub event_name: String,
    pub count: u32,
    pub unit_mask: u32,
    /// `None` renders as the literal `all`.
    pub tgid: Option<u32>,
    pub tid: Option<u32>,
    pub cpu: Option<u32>,
    /// Selects `{kern}` for single-component image names.
    pub is_kernel: bool,
}

fn axis(value: Option<u32>) -> AxisValue {
    AxisValue(value)
}

struct AxisValue(Option<u32>);

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{v}"),
            None => f.write_str("all"),
        }
    }
}

fn push_image(out: &mut String, is_kernel: bool, name: &str) {
    if is_kernel && !name.contains('/') {
        out.push_str("{kern}/");
    } else {
        out.push_str("{root}");
        if !name.starts_with('/') {
            out.push('/');
        }
    }
    out.push_str(name);
    out.push('/');
}

impl MangleValues {
    /// Render the canonical path, relative to the session's samples
    /// directory.
    pub fn mangle(&self) -> String {
        let mut out = String::with_capacity(
            self.image_name.len() + self.dep_name.len() + self.event_name.len() + 64,
        );

        push_image(&mut out, self.is_kernel, &self.image_name);

        if self.dep_name != self.image_name {
            out.push_str("{dep}/");
            push_image(&mut out, self.is_kernel, &self.dep_name);
        }

        if let Some(cg_name) = &self.cg_name {
            out.push_str("{cg}/");
            push_image(&mut out, self.is_kernel, cg_name);
        }

        out.push_str(&format!(
            "{}.{}.{}.{}.{}.{}",
            self.event_name,
            self.count,
            self.unit_mask,
            axis(self.tgid),
            axis(self.tid),
            axis(self.cpu)
        ));
        out
    }
}

/// A sample filename split back into its constituent parts. Axis fields
/// keep their textual form; `all` stays `all`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFilename {
    pub filename: String,
    /// Everything left of the first `{root}`/`{kern}` marker.
    pub base_dir: String,
    pub image: String,
    /// Dependent image; empty when the file has no `{dep}` subtree.
    pub lib_image: String,
    /// Callgraph target image; empty for linear sample files.
    pub cg_image: String,
    pub event: String,
    pub count: String,
    pub unitmask: String,
    pub tgid: String,
    pub tid: String,
    pub cpu: String,
}

impl ParsedFilename {
    /// The image profiled samples are reported against: the dependent
    /// image when present, the primary image otherwise.
    pub fn profile_image(&self) -> &str {
        if self.lib_image.is_empty() {
            &self.image
        } else {
            &self.lib_image
        }
    }
}

fn split_event_spec(parsed: &mut ParsedFilename, event_spec: &str) -> Result<(), MangleError> {
    let parts: Vec<&str> = event_spec.split('.').collect();
    if parts.len() != 6 || parts.iter().any(|p| p.is_empty()) {
        return Err(MangleError::InvalidEventSpec(event_spec.to_string()));
    }
    parsed.event = parts[0].to_string();
    parsed.count = parts[1].to_string();
    parsed.unitmask = parts[2].to_string();
    parsed.tgid = parts[3].to_string();
    parsed.tid = parts[4].to_string();
    parsed.cpu = parts[5].to_string();
    Ok(())
}

fn is_marker(component: &str) -> bool {
    component == "{root}" || component == "{kern}"
}

/// Consume one `{root}`/`{kern}` image group from the front of `path`,
/// returning the image name with a leading `/`.
fn take_image_group<'a>(
    path: &mut &[&'a str],
    filename: &str,
) -> Result<String, MangleError> {
    let invalid = || MangleError::InvalidFilename(filename.to_string());

    let marker = *path.first().ok_or_else(invalid)?;
    if !is_marker(marker) {
        return Err(invalid());
    }
    *path = &path[1..];

    let mut image = String::new();
    while let Some(component) = path.first() {
        if *component == "{dep}" || *component == "{cg}" {
            break;
        }
        image.push('/');
        image.push_str(component);
        *path = &path[1..];
        // A kernel image name is a single path component.
        if marker == "{kern}" {
            break;
        }
    }

    if image.is_empty() {
        return Err(invalid());
    }
    if marker == "{kern}" {
        if let Some(component) = path.first() {
            if *component != "{dep}" && *component != "{cg}" {
                return Err(invalid());
            }
        }
    }
    Ok(image)
}

/// Split a sample filename. Accepts the `{dep}`-less shape produced when
/// the dependent image equals the primary image, as well as the full form.
pub fn parse_filename(filename: &str) -> Result<ParsedFilename, MangleError> {
    let invalid = || MangleError::InvalidFilename(filename.to_string());

    let (dir, event_spec) = filename.rsplit_once('/').ok_or_else(invalid)?;

    let mut parsed = ParsedFilename {
        filename: filename.to_string(),
        ..Default::default()
    };
    split_event_spec(&mut parsed, event_spec)?;

    let components: Vec<&str> = dir.split('/').filter(|c| !c.is_empty()).collect();

    // Strip everything left of the first marker; that's the session dir.
    let start = components
        .iter()
        .position(|c| is_marker(c))
        .ok_or_else(invalid)?;
    for component in &components[..start] {
        parsed.base_dir.push_str(component);
        parsed.base_dir.push('/');
    }

    let mut path: &[&str] = &components[start..];
    parsed.image = take_image_group(&mut path, filename)?;

    if path.first() == Some(&"{dep}") {
        path = &path[1..];
        parsed.lib_image = take_image_group(&mut path, filename)?;
    }

    if path.first() == Some(&"{cg}") {
        path = &path[1..];
        parsed.cg_image = take_image_group(&mut path, filename)?;
    }

    if !path.is_empty() {
        return Err(invalid());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> MangleValues {
        MangleValues {
            image_name: "/bin/A".to_string(),
            dep_name: "/bin/A".to_string(),
            cg_name: None,
            event_name: "CLK".to_string(),
            count: 100_000,
            unit_mask: 0,
            tgid: None,
            tid: None,
            cpu: None,
            is_kernel: false,
        }
    }

    #[test]
    fn plain_image_omits_dep() {
        assert_eq!(values().mangle(), "{root}/bin/A/CLK.100000.0.all.all.all");
    }

    #[test]
    fn differing_dep_gets_subtree() {
        let mut v = values();
        v.image_name = "/lib/libc.so".to_string();
        assert_eq!(
            v.mangle(),
            "{root}/lib/libc.so/{dep}/{root}/bin/A/CLK.100000.0.all.all.all"
        );
    }

    #[test]
    fn kernel_module_uses_kern_marker() {
        let mut v = values();
        v.image_name = "ext4".to_string();
        v.dep_name = "ext4".to_string();
        v.is_kernel = true;
        assert_eq!(v.mangle(), "{kern}/ext4/CLK.100000.0.all.all.all");
    }

    #[test]
    fn kernel_image_with_path_uses_root() {
        let mut v = values();
        v.image_name = "/boot/vmlinux".to_string();
        v.dep_name = "/boot/vmlinux".to_string();
        v.is_kernel = true;
        assert_eq!(v.mangle(), "{root}/boot/vmlinux/CLK.100000.0.all.all.all");
    }

    #[test]
    fn separated_axes_are_numeric() {
        let mut v = values();
        v.tgid = Some(1000);
        v.tid = Some(1001);
        v.cpu = Some(3);
        assert_eq!(v.mangle(), "{root}/bin/A/CLK.100000.0.1000.1001.3");
    }

    #[test]
    fn callgraph_tree_is_appended() {
        let mut v = values();
        v.cg_name = Some("/lib/libc.so".to_string());
        assert_eq!(
            v.mangle(),
            "{root}/bin/A/{cg}/{root}/lib/libc.so/CLK.100000.0.all.all.all"
        );
    }

    #[test]
    fn parse_round_trips_simple() {
        let v = values();
        let parsed = parse_filename(&v.mangle()).unwrap();
        assert_eq!(parsed.image, "/bin/A");
        assert_eq!(parsed.lib_image, "");
        assert_eq!(parsed.event, "CLK");
        assert_eq!(parsed.count, "100000");
        assert_eq!(parsed.unitmask, "0");
        assert_eq!(parsed.tgid, "all");
        assert_eq!(parsed.tid, "all");
        assert_eq!(parsed.cpu, "all");
    }

    #[test]
    fn parse_round_trips_dep_and_cg() {
        let mut v = values();
        v.image_name = "/lib/libc.so".to_string();
        v.cg_name = Some("/lib/ld.so".to_string());
        let parsed = parse_filename(&v.mangle()).unwrap();
        assert_eq!(parsed.image, "/lib/libc.so");
        assert_eq!(parsed.lib_image, "/bin/A");
        assert_eq!(parsed.cg_image, "/lib/ld.so");
    }

    #[test]
    fn parse_strips_session_base_dir() {
        let parsed = parse_filename(
            "/var/lib/oxprof/samples/current/{root}/bin/A/CLK.100000.0.all.all.all",
        )
        .unwrap();
        assert_eq!(parsed.base_dir, "var/lib/oxprof/samples/current/");
        assert_eq!(parsed.image, "/bin/A");
    }

    #[test]
    fn parse_accepts_redundant_dep() {
        let parsed =
            parse_filename("{root}/bin/A/{dep}/{root}/bin/A/CLK.100000.0.all.all.all").unwrap();
        assert_eq!(parsed.image, "/bin/A");
        assert_eq!(parsed.lib_image, "/bin/A");
    }

    #[test]
    fn kern_must_be_single_component() {
        assert!(parse_filename("{kern}/a/b/CLK.100000.0.all.all.all").is_err());
        let parsed = parse_filename("{kern}/ext4/CLK.100000.0.all.all.all").unwrap();
        assert_eq!(parsed.image, "/ext4");
    }

    #[test]
    fn malformed_event_specs_are_rejected() {
        assert!(parse_filename("{root}/bin/A/CLK.100000.0.all.all").is_err());
        assert!(parse_filename("{root}/bin/A/CLK..0.all.all.all").is_err());
        assert!(parse_filename("no-marker/CLK.100000.0.all.all.all").is_err());
    }
}

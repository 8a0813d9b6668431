use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The error type used across the report pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PpError {
    #[error(transparent)]
    Filename(#[from] oxprof_mangle::MangleError),

    #[error(transparent)]
    Db(#[from] oxprof_db::OdbError),

    #[error(
        "profile classes vary along both {axis} and {other_axis}; only one \
         axis may vary per report\nsuggestion: {suggestion}"
    )]
    TaxonomyConflict {
        /// First varying axis in listed order; the one to pin or merge.
        axis: &'static str,
        other_axis: &'static str,
        suggestion: &'static str,
    },

    #[error("no sample files found: profile specification matched nothing")]
    EmptyProfileSet,

    #[error("{path}: sample files were written by a different format version")]
    VersionMismatch { path: PathBuf },

    #[error("{path}: event configuration differs from previously loaded sample files")]
    HeaderMismatch { path: PathBuf },

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("{path}: cannot read image: {source}")]
    ImageUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: unrecognized binary format: {reason}")]
    ImageFormatFailure { path: PathBuf, reason: String },

    #[error("multiple images match {0}; narrow the specification")]
    ImageMultipleMatch(String),

    #[error("sample range start is above its end: bad kernel or module layout?")]
    BadSampleRange,

    #[error("invalid profile specification: {0}")]
    BadSpec(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

//! JIT dump handling: the agent-side dump writer and the dump-to-ELF
//! converter used by the report pipeline.

pub mod convert;
pub mod jitdump;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum JitConvError {
    #[error("{path}: timed out waiting for the dump-file lock")]
    DumpLockTimeout { path: PathBuf },

    #[error("{path}: malformed dump file ({reason})")]
    BadFormat { path: PathBuf, reason: &'static str },

    #[error("writing ELF failed: {0}")]
    ElfWrite(String),

    #[error("refusing to delete dump files as root")]
    RootMayNotDelete,

    #[error("{path}: not owned by the invoking user")]
    NotOwner { path: PathBuf },

    #[error("{path}: still open in the producing process")]
    StillInUse { path: PathBuf },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

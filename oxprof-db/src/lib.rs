//! The on-disk sample database ("ODB") shared by the daemon and the
//! post-processing tools.
//!
//! An ODB is a memory-mapped file holding a bucketed hash table from a
//! 64-bit key (an image offset, or a packed caller/callee pair) to a
//! 32-bit saturating count. One process may write at a time, enforced by
//! an exclusive advisory file lock; any number of readers may map the file
//! concurrently.

mod header;
mod odb;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use header::{SampleFileHeader, SeparationFlags, ODB_MAGIC, ODB_VERSION};
pub use odb::{open_count, Odb, OdbMode, OdbNode, DEFAULT_CAPACITY};

#[derive(Error, Debug)]
pub enum OdbError {
    /// `EMFILE` from the OS. Recoverable: the caller can close other
    /// databases and retry.
    #[error("out of file descriptors")]
    TooManyOpenFiles,

    #[error("{path}: sample file is locked by another writer")]
    Locked { path: PathBuf },

    #[error("{path}: unrecognized magic or format version")]
    VersionMismatch { path: PathBuf },

    #[error("{path}: corrupt sample database ({reason})")]
    Corrupt { path: PathBuf, reason: &'static str },

    #[error("sample database was opened read-only")]
    ReadOnly,

    #[error("sample database cannot grow further")]
    Full,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

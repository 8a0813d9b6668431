//! Post-processing of sample databases: arrangement into profile
//! classes, symbol attribution against binary images, callgraph
//! assembly, diffing, and gprof-compatible output.
//!
//! The pipeline is: [`spec`] selects sample files, [`arrange`] groups
//! them into classes and inverts them per image, [`profile`] loads the
//! databases, [`binary`] supplies symbols and line info, [`container`]
//! or [`callgraph`] joins the two, and [`format`], [`diff`] or [`gprof`]
//! render the result.

pub mod arrange;
pub mod binary;
pub mod callgraph;
pub mod container;
pub mod demangle;
pub mod diff;
pub mod error;
pub mod format;
pub mod gprof;
pub mod interning;
pub mod profile;
pub mod spec;

pub use error::PpError;

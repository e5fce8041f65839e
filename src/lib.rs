//! incload - incremental package-install data loader
//!
//! Streams fixed-size blocks into an IncFS-backed package image while the
//! package bytes are staged locally, piped in, or fetched on demand from a
//! remote peer over a bidirectional channel. The filesystem, the
//! host-process bridge and the ambient tracing facility are external
//! collaborators behind traits; the whole block pipeline lives here.

pub mod assembler;
pub mod cli;
pub mod incfs;
pub mod loader;
pub mod log;
pub mod logger;
pub mod protocol;
pub mod shell;
pub mod source;
pub mod trace;
pub mod wire;

pub use loader::{new_loader, IncrementalLoader};

//! Pure contract and data types for hatchery — commands, submissions,
//! pool configuration, and the error taxonomy.
//!
//! This crate is a leaf dependency with no async runtime and no I/O.
//! It exists so that code implementing the client side of a process pool
//! (commands, submissions, predicates) can do so without pulling in
//! hatchery-pool's runtime stack.

pub mod charset;
pub mod command;
pub mod config;
pub mod error;
pub mod status;
pub mod submission;

// Flat re-exports for convenience
pub use charset::*;
pub use command::*;
pub use config::*;
pub use error::*;
pub use status::*;
pub use submission::*;

//! CLI command implementations.

pub mod common;
pub mod ctf;
pub mod runs;
pub mod script;
pub mod version;

//! Small helpers shared across modules.

pub mod disk;
pub mod fs;

//! Utility functions.

pub mod layout;
pub mod size;

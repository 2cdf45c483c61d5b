//! Public API for polyalloc.
//!
//! The allocator contract, the polymorphic handle and the free functions
//! that dispatch through it, plus configuration types.

pub mod base;
pub mod config;
pub mod debug_info;
pub mod kind;
pub mod polymorphic;

//! Policies shipped with the crate.

pub mod simple;

pub use simple::SimplePolicy;

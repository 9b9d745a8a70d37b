//! # Configuration Module
//!
//! Centralizes the layout constants of the mapped-region format. Constants
//! with interdependencies are co-located and documented together so a change
//! in one is checked against the others; compile-time assertions in
//! [`constants`] enforce the critical ones.

pub mod constants;
pub use constants::*;

//! Command implementations: migrate, info, validate, repair, baseline, clean.

pub mod baseline;
pub mod clean;
pub mod info;
pub mod migrate;
pub mod repair;
pub mod validate;

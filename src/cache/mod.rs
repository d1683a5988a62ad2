//! Caches shared by every pipeline stage.

pub mod profile;

pub use profile::{ProfileCache, ProfileSource};

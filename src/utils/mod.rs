//! The `utils` module provides shared definitions used across `sharedsub`:
//! the crate-wide error taxonomy and logging initialisation.

pub mod error;
pub mod logging;

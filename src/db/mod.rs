//! Database module for Stackscope.
//!
//! Provides SQLite storage with embedded migrations.

mod models;
mod settings;
mod store;

pub use models::*;
pub use settings::*;
pub use store::*;

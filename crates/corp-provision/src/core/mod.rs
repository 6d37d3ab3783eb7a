//! Core types shared by drivers and the engine.
//!
//! - [`identifier`]: validation and quoting of SQL names
//! - [`value`]: SQL values and result rows

pub mod identifier;
pub mod value;

pub use value::{Row, SqlNullType, SqlValue};

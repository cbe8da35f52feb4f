//! Database access.

pub mod health;

//! Recap API Library Crate
//!
//! Configuration, session persistence, HTTP handlers and routing for the
//! recap web service. The binaries under `bin/` are thin wrappers around it.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;

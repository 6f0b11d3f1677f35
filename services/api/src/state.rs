//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the recap agent and
//! the read-only sources the handlers need.

use crate::config::Config;
use recap_core::{lesson::RosterSource, service::RecapAgent};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<RecapAgent>,
    pub roster: Arc<dyn RosterSource>,
    pub config: Arc<Config>,
}

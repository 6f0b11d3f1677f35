//! Classroom Recap Core
//!
//! Domain logic for a single-topic recap chat agent: a student talks to a
//! model that is scoped to the day's lesson, and every turn passes through a
//! toxicity guard on the way in and on the way out.

pub mod classifier;
pub mod guard;
pub mod lesson;
pub mod llm_client;
pub mod message;
pub mod pipeline;
pub mod prompt;
pub mod service;
pub mod session;

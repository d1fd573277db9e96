pub mod calendar_client;
pub mod cli;
pub mod commands;
pub mod config;
pub mod conflict_resolver;
pub mod error;
pub mod focus_optimizer;
pub mod meeting_scorer;
pub mod output;
pub mod pattern_learner;
pub mod reschedule;
pub mod router;
pub mod time_utils;

pub use error::{EngineError, EngineResult};

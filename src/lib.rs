//! Easy-Prompt: interviews a user about a roleplay character, scores the
//! growing profile with an evaluator model and writes the final character
//! prompt once the profile is complete.

pub mod chat;
pub mod config;
pub mod constants;
pub mod conversation;
pub mod error;
pub mod evaluation;
pub mod evaluator;
pub mod llm;
pub mod locale;
pub mod session;
pub mod state;
pub mod store;
pub mod traits;
pub mod web_server;

pub use error::{Error, Result};

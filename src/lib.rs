//! modem-relay - relays SMS events from cellular modems to notification channels
//!
//! The library tracks a hot-pluggable set of modems, keeps exactly one
//! message listener per modem and fans each qualifying SMS out to every
//! configured notification channel.

pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod formatting;
pub mod metrics;
pub mod network;
pub mod notification;
pub mod relay;
pub mod task_manager;

// Re-export core types for convenience
pub use crate::core::*;

//! Command handlers

pub mod auth;
pub mod config;
pub mod entity;
pub mod queue;
pub mod status;
pub mod sync;
pub mod watch;

//! Core provisioning logic

pub mod cancel;
pub mod client;
pub mod error;
pub mod session;
pub mod types;

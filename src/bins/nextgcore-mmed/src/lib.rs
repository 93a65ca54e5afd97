//! NextGCore MME (Mobility Management Entity)
//!
//! S1AP procedure dispatch, NAS security envelope decoding and S11 bearer
//! signaling toward the serving gateway.

pub mod app;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod gtp_path;
pub mod nas_path;
pub mod nas_security;
pub mod s11_build;
pub mod s11_handler;
pub mod s1ap_build;
pub mod s1ap_handler;
pub mod s1ap_message;
pub mod s1ap_path;
pub mod sm;

pub use app::MmeApp;
pub use config::MmeConfig;

#[cfg(test)]
mod test_support;

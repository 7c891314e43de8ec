pub mod auth;
pub mod config;
pub mod pane;
pub mod peer;
pub mod signaling;
pub mod telemetry;

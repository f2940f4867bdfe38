/// CabalWatch - finds new sites of a known operator group in the certificate
/// transparency stream.
///
/// `research` fingerprints reference sites into a `ProfileStore`; `listen`
/// locks that profile and classifies every newly certified domain against it.
pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod dns;
pub mod fingerprint;
pub mod formatting;
pub mod internal_metrics;
pub mod matching;
pub mod network;
pub mod notification;
pub mod outputs;
pub mod pipeline;
pub mod profile;
pub mod research;
pub mod task_manager;
pub mod verification;

// Re-export core types for convenience
pub use core::*;

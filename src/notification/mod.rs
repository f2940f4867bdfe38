//! Notification destinations that live outside the process.
pub mod slack;

pub use slack::SlackOutput;

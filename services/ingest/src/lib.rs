pub mod accept;
pub mod admission;
pub mod clock;
pub mod config;
pub mod negotiate;
pub mod receiver;
pub mod registry;
pub mod socket;
pub mod state;
pub mod web;
pub mod workers;

pub use state::AppState;

/// Message id stamped on every log line about a child stream, so the
/// journal can be filtered to exactly these events.
pub const MSGID_STREAM_FROM_CHILD: &str = "3a5d6c19-8d0b-4f73-9c2e-5b1f0e6a7d42";

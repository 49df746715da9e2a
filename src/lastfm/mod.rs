//! Last.fm web service source.

pub mod client;
pub mod error;
mod types;

pub use client::{LastfmClient, LastfmConfig};
pub use error::LastfmError;

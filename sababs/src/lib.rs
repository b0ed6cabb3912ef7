//! Audiobookshelf REST client.

pub mod client;
pub mod error;
pub mod models;

pub use client::AbsClient;
pub use error::{AbsError, Result};
pub use models::*;

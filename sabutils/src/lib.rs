//! Small shared helpers: UPnP time strings, allowed-network matching.

pub mod net;
pub mod time;

pub use net::NetworkMatcher;
pub use time::{format_hms, parse_hms, TimeParseError};

//! UDP endpoint identity and IP address scope classification.
//!
//! - [`Peer`] - a remote endpoint (IP + port, optionally an unresolved hostname)
//! - [`scope`] - IP address classification (loopback, private, link-local, public)

mod peer;
pub mod scope;

pub use peer::{ParsePeerError, Peer};
pub use scope::{AddressScope, classify_ip, is_real_internet_address};

//! Passive reachability classification for a UDP overlay transport.
//!
//! Decides whether our listening port is reachable from the open internet
//! ("port forwarded") or hidden behind a NAT/firewall, purely by watching the
//! timing of inbound and outbound packets per peer and per raw IP address.
//! Nothing extra is sent and no payloads are inspected.
//!
//! The key observation: a NAT binding only stays open while we keep sending.
//! If a publicly routable peer delivers a packet to us a long time after our
//! last outbound packet to it, the return path evidently survives without
//! outbound refreshes, which is what a forwarded port looks like.
//!
//! One [`AddressTracker`] per listening port. The transport layer calls
//! [`AddressTracker::sent_to`] / [`AddressTracker::received_from`] on every
//! packet; reachability-announcement logic polls
//! [`AddressTracker::port_forward_status`].

mod item;
mod status;
mod tracker;

pub use item::TrackerItem;
pub use status::PortForwardStatus;
pub use tracker::{
    AddressTracker, DEFINITELY_TUNNEL_LENGTH, HORIZON, MAX_ITEMS, MAYBE_TUNNEL_LENGTH,
};

/// Milliseconds since the unix epoch. All tracker timestamps use this scale.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

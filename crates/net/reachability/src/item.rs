//! Per-identity packet timing record.

use std::collections::VecDeque;
use std::time::Duration;

use corvid_fieldset::{FieldSet, FieldSetError};

/// Most recent events kept per direction. Eviction never loses gap evidence:
/// evicting a send advances the send floor to its timestamp, and an evicted
/// receive keeps its gap in a one-slot summary.
const MAX_EVENTS: usize = 128;

/// One inbound packet and the send/quiet gap it witnessed.
///
/// The gap is fixed at append time: events arrive in time order, so no later
/// send can precede this receive.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Receive {
    time: u64,
    gap: u64,
}

/// Packet timing record for one identity (a peer or a raw IP address).
///
/// Stores, from creation time, copies of the tracker's floor timestamps (the
/// earliest instants before which no traffic in each direction is known), then
/// appends a timestamp for every subsequent send/receive. All timestamps are
/// epoch milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerItem {
    no_receive_floor: u64,
    no_send_floor: u64,
    sent: VecDeque<u64>,
    received: VecDeque<Receive>,
    /// Longest-gap receive evicted from the log, by raw gap.
    evicted: Option<Receive>,
}

impl TrackerItem {
    pub(crate) fn new(no_receive_floor: u64, no_send_floor: u64) -> Self {
        Self {
            no_receive_floor,
            no_send_floor,
            sent: VecDeque::new(),
            received: VecDeque::new(),
            evicted: None,
        }
    }

    /// Earliest instant before which no inbound packet is known.
    pub fn no_receive_floor(&self) -> u64 {
        self.no_receive_floor
    }

    /// Earliest instant before which no outbound packet is known.
    pub fn no_send_floor(&self) -> u64 {
        self.no_send_floor
    }

    pub(crate) fn sent(&mut self, now: u64) {
        if self.sent.len() >= MAX_EVENTS {
            if let Some(evicted) = self.sent.pop_front() {
                // The evicted send is the oldest, so every receive it could
                // still serve as baseline for would get the same value from
                // the floor.
                self.no_send_floor = self.no_send_floor.max(evicted);
            }
        }
        self.sent.push_back(now);
    }

    pub(crate) fn received(&mut self, now: u64) {
        // The latest send at or before this receive, or the send floor if
        // there is none. Events are appended in time order, so the first
        // match scanning backwards is the latest.
        let baseline = self
            .sent
            .iter()
            .rev()
            .find(|&&sent| sent <= now)
            .copied()
            .unwrap_or(self.no_send_floor);
        let gap = now.saturating_sub(baseline);
        if self.received.len() >= MAX_EVENTS {
            if let Some(evicted) = self.received.pop_front() {
                self.fold_evicted(evicted);
            }
        }
        self.received.push_back(Receive { time: now, gap });
    }

    fn fold_evicted(&mut self, receive: Receive) {
        let keep = match self.evicted {
            Some(best) => (receive.gap, receive.time) > (best.gap, best.time),
            None => true,
        };
        if keep {
            self.evicted = Some(receive);
        }
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    /// Longest interval between an inbound packet and the latest prior instant
    /// at which we are known to have had no outbound traffic (the most recent
    /// send before it, or the creation-time send floor).
    ///
    /// Inbound packets older than `horizon` are ignored and intervals are
    /// clipped to `horizon`. Returns `None` if no inbound packet qualifies.
    pub fn longest_gap(&self, horizon: Duration, now: u64) -> Option<Duration> {
        let horizon = horizon.as_millis() as u64;
        let cutoff = now.saturating_sub(horizon);
        let mut longest: Option<u64> = None;
        for receive in self.received.iter().chain(self.evicted.iter()) {
            if receive.time < cutoff {
                continue;
            }
            let gap = receive.gap.min(horizon);
            longest = Some(longest.map_or(gap, |g| g.max(gap)));
        }
        longest.map(Duration::from_millis)
    }

    pub(crate) fn write_field_set(&self, fs: &mut FieldSet) {
        fs.put_u64("TimeDefinitelyNoPacketsReceived", self.no_receive_floor);
        fs.put_u64("TimeDefinitelyNoPacketsSent", self.no_send_floor);
        fs.put_subset("Sent", times_to_field_set(self.sent.iter().copied()));
        fs.put_subset(
            "Received",
            times_to_field_set(self.received.iter().map(|r| r.time)),
        );
        if let Some(evicted) = self.evicted {
            fs.put_u64("EvictedReceiveTime", evicted.time);
            fs.put_u64("EvictedReceiveGap", evicted.gap);
        }
    }

    pub(crate) fn from_field_set(fs: &FieldSet) -> Result<Self, FieldSetError> {
        let mut item = Self {
            no_receive_floor: fs.get_u64("TimeDefinitelyNoPacketsReceived")?,
            no_send_floor: fs.get_u64("TimeDefinitelyNoPacketsSent")?,
            sent: times_from_field_set(fs.subset("Sent"))?,
            received: VecDeque::new(),
            evicted: None,
        };
        // Gaps are not persisted; replaying the receive times against the
        // restored send log recomputes them.
        for time in times_from_field_set(fs.subset("Received"))? {
            item.received(time);
        }
        if let (Ok(time), Ok(gap)) = (
            fs.get_u64("EvictedReceiveTime"),
            fs.get_u64("EvictedReceiveGap"),
        ) {
            item.fold_evicted(Receive { time, gap });
        }
        Ok(item)
    }
}

fn times_to_field_set(times: impl Iterator<Item = u64>) -> FieldSet {
    let mut fs = FieldSet::new();
    for (i, t) in times.enumerate() {
        fs.put_u64(i.to_string(), t);
    }
    fs
}

fn times_from_field_set(fs: Option<&FieldSet>) -> Result<VecDeque<u64>, FieldSetError> {
    let Some(fs) = fs else {
        return Ok(VecDeque::new());
    };
    // Written as a dense 0..n index, so any hole fails the parse.
    let mut times = VecDeque::with_capacity(fs.len());
    for i in 0..fs.len().min(MAX_EVENTS) {
        times.push_back(fs.get_u64(&i.to_string())?);
    }
    Ok(times)
}

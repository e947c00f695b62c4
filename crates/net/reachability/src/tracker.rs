//! Packet traffic tracking and port-forward classification.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use corvid_fieldset::{FieldSet, FieldSetError};
use corvid_net_peer::Peer;

use crate::item::TrackerItem;
use crate::now_millis;
use crate::status::PortForwardStatus;

/// Maximum tracked identities of either kind.
pub const MAX_ITEMS: usize = 1000;

/// Time after which evidence about our reachability is no longer relevant.
pub const HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

/// If the longest gap is above this, we might be port forwarded. RFC 4787
/// requires NAT UDP timeouts of at least 2 minutes, but plenty of gear is
/// shorter.
pub const MAYBE_TUNNEL_LENGTH: Duration = Duration::from_secs(5 * 60 + 1);

/// If the longest gap is above this, we are almost certainly port forwarded.
/// Some stateful firewalls hold bindings for 30 minutes or more; this is far
/// past any of them.
pub const DEFINITELY_TUNNEL_LENGTH: Duration = Duration::from_secs((12 * 60 + 1) * 60);

const VERSION: u32 = 1;

#[derive(Debug, Error)]
enum LoadFailure {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] FieldSetError),
    #[error("unknown version {0}")]
    UnknownVersion(u32),
    #[error("boot ID mismatch: stored {stored}, last {expected}")]
    BootIdMismatch { stored: u64, expected: u64 },
    #[error("stored item count exceeds {MAX_ITEMS}")]
    TooManyItems,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Sent,
    Received,
}

/// Tracks packet traffic to/from specific peers and IP addresses, in order to
/// determine whether we are open to the internet.
///
/// One tracker per listening port. A single lock guards both identity maps and
/// the tracker scalars; hold times are sub-millisecond and no I/O ever happens
/// under it.
#[derive(Debug)]
pub struct AddressTracker {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    peers: HashMap<Peer, TrackerItem>,
    ips: HashMap<IpAddr, TrackerItem>,
    /// Earliest instant before which no inbound packet is known.
    no_receive_floor: u64,
    /// Earliest instant before which no outbound packet is known.
    no_send_floor: u64,
    /// When an external connectivity check last reported us unreachable.
    /// 0 = never.
    broken_at: u64,
    /// Deadline after which an absence of gap evidence counts against us.
    /// The first assertion wins until explicitly cleared.
    presumed_guilty_at: Option<u64>,
}

impl AddressTracker {
    /// Load the tracker persisted for `port` under `node_dir`, or start fresh.
    ///
    /// Any stale backup file is deleted first. A missing file or a boot-id
    /// mismatch (normal after an unclean shutdown, when gap evidence spanning
    /// the outage is unreliable) silently yields an empty tracker; corrupt
    /// content and unknown versions are logged and likewise discarded. This
    /// constructor never fails.
    pub fn create(last_boot_id: u64, node_dir: &Path, port: u16) -> Self {
        let data = data_path(node_dir, port);
        let _ = std::fs::remove_file(backup_path(node_dir, port));
        match Self::load(&data, last_boot_id) {
            Ok(tracker) => {
                debug!(path = %data.display(), "restored packet tracker");
                tracker
            }
            Err(failure) => {
                match &failure {
                    LoadFailure::Io(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!(path = %data.display(), "no stored packet data, starting fresh");
                    }
                    LoadFailure::BootIdMismatch { .. } => {
                        debug!(path = %data.display(), "{failure}, starting fresh");
                    }
                    _ => {
                        error!(path = %data.display(), "failed to load packet tracker: {failure}");
                    }
                }
                Self::empty()
            }
        }
    }

    fn empty() -> Self {
        Self {
            inner: Mutex::new(Inner::new(now_millis())),
        }
    }

    fn load(path: &Path, last_boot_id: u64) -> Result<Self, LoadFailure> {
        let file = File::open(path)?;
        let fields = FieldSet::parse(BufReader::new(file))?;
        let inner = Inner::from_field_set(&fields, last_boot_id, now_millis())?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Record an outbound packet to `peer`.
    pub fn sent_to(&self, peer: &Peer) {
        self.packet(peer, Direction::Sent);
    }

    /// Record an inbound packet from `peer`.
    pub fn received_from(&self, peer: &Peer) {
        self.packet(peer, Direction::Received);
    }

    fn packet(&self, peer: &Peer, direction: Direction) {
        let Some(normalized) = peer.strip_host() else {
            // The transport hands us resolved endpoints; this is an invariant
            // violation, not a user error. Drop the single event.
            error!(%peer, "peer with no resolved address in packet accounting");
            return;
        };
        let now = now_millis();
        self.inner.lock().record(normalized, direction, now);
    }

    /// Assert that no packet can have been received before `now`, e.g. because
    /// the transport socket was just (re)opened.
    pub fn start_receive(&self, now: u64) {
        self.inner.lock().no_receive_floor = now;
    }

    /// Assert that no packet can have been sent before `now`.
    pub fn start_send(&self, now: u64) {
        self.inner.lock().no_send_floor = now;
    }

    /// Snapshot of all per-peer timing records.
    pub fn peer_items(&self) -> Vec<(Peer, TrackerItem)> {
        let inner = self.inner.lock();
        inner
            .peers
            .iter()
            .map(|(peer, item)| (peer.clone(), item.clone()))
            .collect()
    }

    /// Snapshot of all per-IP timing records.
    pub fn ip_items(&self) -> Vec<(IpAddr, TrackerItem)> {
        let inner = self.inner.lock();
        inner
            .ips
            .iter()
            .map(|(ip, item)| (*ip, item.clone()))
            .collect()
    }

    /// The longest send/known-no-packets-sent → receive gap across all peers
    /// with a publicly routable address and at least one inbound packet.
    ///
    /// It is highly unlikely that we are behind a NAT or stateful firewall
    /// with a timeout shorter than the returned length. `None` means no peer
    /// qualifies.
    pub fn longest_gap(&self, horizon: Duration) -> Option<Duration> {
        let now = now_millis();
        let mut longest: Option<Duration> = None;
        for (peer, item) in self.peer_items() {
            if item.received_count() == 0 || !peer.is_real_internet_address() {
                continue;
            }
            if let Some(gap) = item.longest_gap(horizon, now) {
                longest = Some(longest.map_or(gap, |g| g.max(gap)));
            }
        }
        longest
    }

    /// Classify our reachability from the evidence within [`HORIZON`].
    pub fn port_forward_status(&self) -> PortForwardStatus {
        let gap = self.longest_gap(HORIZON);
        if let Some(gap) = gap {
            if gap > DEFINITELY_TUNNEL_LENGTH {
                return PortForwardStatus::DefinitelyPortForwarded;
            }
            if gap > MAYBE_TUNNEL_LENGTH {
                return PortForwardStatus::MaybePortForwarded;
            }
        }
        // Manual signals only count when the gap evidence is inconclusive.
        // Somebody could be feeding us bogus connectivity reports; a long
        // observed gap is harder to fake.
        let now = now_millis();
        let inner = self.inner.lock();
        if inner.is_broken(now) {
            return PortForwardStatus::DefinitelyNated;
        }
        if gap == Some(Duration::ZERO) && inner.presumed_guilty_at.is_some_and(|t| now > t) {
            return PortForwardStatus::MaybeNated;
        }
        PortForwardStatus::DontKnow
    }

    /// An external connectivity check reported that we are not reachable.
    /// Forces [`PortForwardStatus::DefinitelyNated`] for the next [`HORIZON`]
    /// unless strong gap evidence says otherwise.
    pub fn mark_broken(&self) {
        self.inner.lock().broken_at = now_millis();
    }

    /// From instant `t` on, an absence of gap evidence counts as evidence of
    /// being NATed. The first assertion wins; later calls are ignored until
    /// [`Self::presume_innocent`].
    pub fn presume_guilty_at(&self, t: u64) {
        let mut inner = self.inner.lock();
        if inner.presumed_guilty_at.is_none() {
            inner.presumed_guilty_at = Some(t);
        }
    }

    /// Clear the presumed-guilty deadline.
    pub fn presume_innocent(&self) {
        self.inner.lock().presumed_guilty_at = None;
    }

    /// Called when something changes at a higher level suggesting the status
    /// may be stale. No cached state to invalidate yet.
    pub fn rescan(&self) {}

    /// Persist the tracker for `port` under `node_dir`.
    ///
    /// Skipped entirely while marked broken; known-bad state is worthless
    /// across restarts. The primary file is only ever replaced by an atomic
    /// rename of a fully written backup, so a crash mid-write leaves the
    /// previous data intact. I/O failures are logged and abandoned.
    pub fn store(&self, boot_id: u64, node_dir: &Path, port: u16) {
        let fields = {
            let inner = self.inner.lock();
            if inner.is_broken(now_millis()) {
                return;
            }
            inner.to_field_set(boot_id)
        };
        let data = data_path(node_dir, port);
        let backup = backup_path(node_dir, port);
        if let Err(e) = write_atomic(&fields, &backup, &data) {
            warn!(path = %data.display(), "cannot store packet tracker: {e}");
        }
    }
}

impl Inner {
    fn new(now: u64) -> Self {
        Self {
            peers: HashMap::new(),
            ips: HashMap::new(),
            no_receive_floor: now,
            no_send_floor: now,
            broken_at: 0,
            presumed_guilty_at: None,
        }
    }

    fn record(&mut self, peer: Peer, direction: Direction, now: u64) {
        let Some(ip) = peer.ip() else {
            return;
        };
        if !self.peers.contains_key(&peer) && self.peers.len() >= MAX_ITEMS {
            self.clear_all(now);
        }
        let floors = (self.no_receive_floor, self.no_send_floor);
        let item = self
            .peers
            .entry(peer)
            .or_insert_with(|| TrackerItem::new(floors.0, floors.1));
        record_event(item, direction, now);

        if !self.ips.contains_key(&ip) && self.ips.len() >= MAX_ITEMS {
            self.clear_all(now);
        }
        let floors = (self.no_receive_floor, self.no_send_floor);
        let item = self
            .ips
            .entry(ip)
            .or_insert_with(|| TrackerItem::new(floors.0, floors.1));
        record_event(item, direction, now);
    }

    /// Capacity eviction: discard everything at once. Per-entry eviction would
    /// skew the gap statistics towards whatever survived it.
    fn clear_all(&mut self, now: u64) {
        self.peers.clear();
        self.ips.clear();
        self.no_receive_floor = now;
        self.no_send_floor = now;
    }

    fn is_broken(&self, now: u64) -> bool {
        self.broken_at != 0 && now.saturating_sub(self.broken_at) < HORIZON.as_millis() as u64
    }

    fn to_field_set(&self, boot_id: u64) -> FieldSet {
        let mut fields = FieldSet::new();
        fields.put_u32("Version", VERSION);
        fields.put_u64("BootID", boot_id);
        fields.put_u64("TimeDefinitelyNoPacketsReceived", self.no_receive_floor);
        fields.put_u64("TimeDefinitelyNoPacketsSent", self.no_send_floor);

        let mut list = FieldSet::new();
        for (i, (peer, item)) in self.peers.iter().enumerate() {
            let mut entry = FieldSet::new();
            entry.put_str("Address", peer.to_string());
            item.write_field_set(&mut entry);
            list.put_subset(i.to_string(), entry);
        }
        fields.put_subset("Peers", list);

        let mut list = FieldSet::new();
        for (i, (ip, item)) in self.ips.iter().enumerate() {
            let mut entry = FieldSet::new();
            entry.put_str("Address", ip.to_string());
            item.write_field_set(&mut entry);
            list.put_subset(i.to_string(), entry);
        }
        fields.put_subset("IPs", list);

        fields
    }

    fn from_field_set(
        fields: &FieldSet,
        last_boot_id: u64,
        now: u64,
    ) -> Result<Inner, LoadFailure> {
        let version = fields.get_u32("Version")?;
        if version != VERSION {
            return Err(LoadFailure::UnknownVersion(version));
        }
        let stored = fields.get_u64("BootID")?;
        if stored != last_boot_id {
            return Err(LoadFailure::BootIdMismatch {
                stored,
                expected: last_boot_id,
            });
        }

        // Whether packets arrived while we were down is unknowable, and some
        // permissive firewalls hold tunnels open on inbound traffic alone, so
        // the no-receive floor restarts at load time rather than from disk.
        let no_receive_floor = now;
        let no_send_floor = fields.get_u64("TimeDefinitelyNoPacketsSent")?;

        let mut peers = HashMap::new();
        if let Some(list) = fields.subset("Peers") {
            for name in list.direct_subset_names() {
                let Some(entry) = list.subset(name) else {
                    continue;
                };
                let address = entry.get_str("Address")?;
                let peer: Peer = address.parse().map_err(|_| FieldSetError::InvalidValue {
                    key: "Address".into(),
                    value: address.into(),
                })?;
                peers.insert(peer, TrackerItem::from_field_set(entry)?);
            }
        }

        let mut ips = HashMap::new();
        if let Some(list) = fields.subset("IPs") {
            for name in list.direct_subset_names() {
                let Some(entry) = list.subset(name) else {
                    continue;
                };
                let address = entry.get_str("Address")?;
                let ip: IpAddr = address.parse().map_err(|_| FieldSetError::InvalidValue {
                    key: "Address".into(),
                    value: address.into(),
                })?;
                ips.insert(ip, TrackerItem::from_field_set(entry)?);
            }
        }

        if peers.len() > MAX_ITEMS || ips.len() > MAX_ITEMS {
            return Err(LoadFailure::TooManyItems);
        }

        Ok(Inner {
            peers,
            ips,
            no_receive_floor,
            no_send_floor,
            broken_at: 0,
            presumed_guilty_at: None,
        })
    }
}

fn record_event(item: &mut TrackerItem, direction: Direction, now: u64) {
    match direction {
        Direction::Sent => item.sent(now),
        Direction::Received => item.received(now),
    }
}

fn data_path(node_dir: &Path, port: u16) -> PathBuf {
    node_dir.join(format!("packets-{port}.dat"))
}

fn backup_path(node_dir: &Path, port: u16) -> PathBuf {
    node_dir.join(format!("packets-{port}.bak"))
}

/// Write to the backup path, flush to disk, then rename over the primary.
fn write_atomic(fields: &FieldSet, backup: &Path, data: &Path) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(backup)?);
    fields.write_to(&mut writer)?;
    let file = writer.into_inner()?;
    file.sync_all()?;
    std::fs::rename(backup, data)?;
    Ok(())
}

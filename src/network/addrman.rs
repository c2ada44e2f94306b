//! Address book
//!
//! [`AddressBook`] is the contract between the peer manager and whatever
//! stores and ranks known peer addresses. [`AddrManager`] is the in-memory
//! implementation used by the node:
//! - Known addresses with a connection state and failure count
//! - Weighted random selection of the next address to dial
//! - Signal routes to relayed peers, learned from the channel that told us
//!   about them
//! - Temporary bans

use crate::network::channel::{ConnectionId, PeerChannel};
use crate::network::message::{
    PeerAddress, Protocol, ProtocolMask, ServiceFlags, SignalId, MAX_ADDR_PER_MESSAGE,
};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Constants
// =============================================================================

/// Failures after which an address is no longer dialed
const MAX_FAILED_ATTEMPTS: u32 = 3;

/// How long a banned address stays banned
const BAN_DURATION: Duration = Duration::from_secs(10 * 60);

/// Relayed addresses further away than this are dropped on ingest
pub const MAX_DISTANCE: u8 = 4;

// =============================================================================
// Address book contract
// =============================================================================

/// Storage and ranking of known peer addresses, consumed by the peer manager.
pub trait AddressBook: Send + Sync {
    /// An address we are neither connected nor connecting to
    fn pick_unconnected_address(&self) -> Option<PeerAddress>;
    /// Stored version of an address, with whatever metadata we have
    fn get(&self, address: &PeerAddress) -> Option<PeerAddress>;
    fn mark_connecting(&self, address: &PeerAddress);
    fn mark_connected(&self, channel: &PeerChannel, address: &PeerAddress);
    fn mark_disconnected(&self, channel: &PeerChannel, closed_by_remote: bool);
    fn mark_unreachable(&self, address: &PeerAddress);
    /// The route to `signal_id` through `channel` does not work
    fn mark_unroutable(&self, channel: &PeerChannel, signal_id: &str);
    fn is_connected(&self, address: &PeerAddress) -> bool;
    fn is_connecting(&self, address: &PeerAddress) -> bool;
    fn is_banned(&self, address: &PeerAddress) -> bool;
    fn ban(&self, address: &PeerAddress);
    /// Store addresses heard from `channel`; returns the ones that were new
    fn ingest(&self, channel: &PeerChannel, addresses: &[PeerAddress]) -> Vec<PeerAddress>;
    /// Addresses matching the protocol and service masks
    fn query(&self, protocol_mask: ProtocolMask, service_mask: ServiceFlags) -> Vec<PeerAddress>;
    /// Channel through which signals for `signal_id` should be sent
    fn lookup_by_signal_id(&self, signal_id: &str) -> Option<PeerChannel>;
}

// =============================================================================
// Address Entry
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrState {
    New,
    Connecting,
    Connected,
    Failed,
    Banned,
}

/// Address with connection bookkeeping
#[derive(Debug, Clone)]
pub struct AddrEntry {
    pub address: PeerAddress,
    pub state: AddrState,
    /// Number of connection attempts
    pub attempts: u32,
    /// Failed attempts since the last success
    pub failures: u32,
    pub last_attempt: Option<Instant>,
    pub banned_until: Option<Instant>,
    channel: Option<PeerChannel>,
}

impl AddrEntry {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            state: AddrState::New,
            attempts: 0,
            failures: 0,
            last_attempt: None,
            banned_until: None,
            channel: None,
        }
    }

    /// Too many failures to bother trying again
    pub fn is_terrible(&self) -> bool {
        self.failures >= MAX_FAILED_ATTEMPTS
    }

    /// Selection weight (higher = more likely)
    pub fn get_chance(&self) -> f64 {
        let mut chance = 1.0;

        if self.failures > 0 {
            chance *= 0.5_f64.powi(self.failures as i32);
        }

        // Prefer addresses we connected to before
        if self.attempts > self.failures {
            chance *= 2.0;
        }

        chance.max(0.001)
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.state == AddrState::Banned && self.banned_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Clone)]
struct SignalRoute {
    channel: PeerChannel,
    distance: u8,
}

#[derive(Debug, Default)]
struct Book {
    by_addr: HashMap<PeerAddress, AddrEntry>,
    by_channel: HashMap<ConnectionId, PeerAddress>,
    routes: HashMap<SignalId, Vec<SignalRoute>>,
    local: Option<PeerAddress>,
}

impl Book {
    fn is_local(&self, address: &PeerAddress) -> bool {
        self.local.as_ref() == Some(address)
    }

    fn add_route(&mut self, signal_id: &str, channel: &PeerChannel, distance: u8) {
        let routes = self.routes.entry(signal_id.to_string()).or_default();
        match routes.iter_mut().find(|r| r.channel.id() == channel.id()) {
            Some(route) => route.distance = route.distance.min(distance),
            None => routes.push(SignalRoute {
                channel: channel.clone(),
                distance,
            }),
        }
        routes.sort_by_key(|r| r.distance);
    }

    fn has_route(&self, signal_id: &str) -> bool {
        self.routes
            .get(signal_id)
            .is_some_and(|routes| routes.iter().any(|r| !r.channel.is_closed()))
    }
}

// =============================================================================
// Address Manager
// =============================================================================

/// In-memory address book
#[derive(Debug, Default)]
pub struct AddrManager {
    book: Mutex<Book>,
}

impl AddrManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an address book that never hands out our own address
    pub fn with_local(local: PeerAddress) -> Self {
        let mgr = Self::new();
        mgr.book.lock().local = Some(local);
        mgr
    }

    /// Add an address manually (seeds, CLI). Returns false if already known.
    pub fn add(&self, address: PeerAddress) -> bool {
        let mut book = self.book.lock();
        if book.is_local(&address) || book.by_addr.contains_key(&address) {
            return false;
        }
        book.by_addr.insert(address.clone(), AddrEntry::new(address));
        true
    }

    /// Get number of addresses
    pub fn size(&self) -> usize {
        self.book.lock().by_addr.len()
    }

    pub fn connected_count(&self) -> usize {
        self.book.lock().by_channel.len()
    }

    pub fn state_of(&self, address: &PeerAddress) -> Option<AddrState> {
        self.book.lock().by_addr.get(address).map(|e| e.state)
    }
}

impl AddressBook for AddrManager {
    fn pick_unconnected_address(&self) -> Option<PeerAddress> {
        let book = self.book.lock();
        let now = Instant::now();

        let eligible: Vec<&AddrEntry> = book
            .by_addr
            .values()
            .filter(|e| matches!(e.state, AddrState::New | AddrState::Failed))
            .filter(|e| !e.is_terrible() && !e.is_banned(now) && !book.is_local(&e.address))
            .filter(|e| match e.address.protocol() {
                Protocol::Direct => true,
                Protocol::Relayed => e.address.signal_id().is_some_and(|id| book.has_route(id)),
                Protocol::Unreachable => false,
            })
            .collect();

        if eligible.is_empty() {
            return None;
        }

        // Weighted random selection based on chance
        let mut rng = rand::thread_rng();
        let total_weight: f64 = eligible.iter().map(|e| e.get_chance()).sum();
        let mut target = rng.gen::<f64>() * total_weight;

        for entry in &eligible {
            target -= entry.get_chance();
            if target <= 0.0 {
                return Some(entry.address.clone());
            }
        }

        // Fallback to first
        eligible.first().map(|e| e.address.clone())
    }

    fn get(&self, address: &PeerAddress) -> Option<PeerAddress> {
        self.book.lock().by_addr.get(address).map(|e| e.address.clone())
    }

    fn mark_connecting(&self, address: &PeerAddress) {
        let mut book = self.book.lock();
        let entry = book
            .by_addr
            .entry(address.clone())
            .or_insert_with(|| AddrEntry::new(address.clone()));
        entry.state = AddrState::Connecting;
        entry.attempts += 1;
        entry.last_attempt = Some(Instant::now());
    }

    fn mark_connected(&self, channel: &PeerChannel, address: &PeerAddress) {
        let mut book = self.book.lock();
        let entry = book
            .by_addr
            .entry(address.clone())
            .or_insert_with(|| AddrEntry::new(address.clone()));
        entry.state = AddrState::Connected;
        entry.failures = 0;
        entry.channel = Some(channel.clone());
        entry.address.timestamp = address.timestamp.max(entry.address.timestamp);
        if address.net_address.is_some() {
            entry.address.net_address = address.net_address.clone();
        }
        book.by_channel.insert(channel.id(), address.clone());
    }

    fn mark_disconnected(&self, channel: &PeerChannel, closed_by_remote: bool) {
        let mut book = self.book.lock();
        if let Some(address) = book.by_channel.remove(&channel.id()) {
            if let Some(entry) = book.by_addr.get_mut(&address) {
                if entry.state == AddrState::Connected {
                    entry.state = AddrState::New;
                }
                entry.channel = None;
            }
            log::debug!(
                "Address {} disconnected (by {})",
                address,
                if closed_by_remote { "remote" } else { "us" }
            );
        }

        // Routes through a dead channel are useless
        for routes in book.routes.values_mut() {
            routes.retain(|r| r.channel.id() != channel.id());
        }
        book.routes.retain(|_, routes| !routes.is_empty());
    }

    fn mark_unreachable(&self, address: &PeerAddress) {
        let mut book = self.book.lock();
        if let Some(entry) = book.by_addr.get_mut(address) {
            if entry.state == AddrState::Banned {
                return;
            }
            entry.state = AddrState::Failed;
            entry.failures += 1;
            entry.channel = None;
        }
    }

    fn mark_unroutable(&self, channel: &PeerChannel, signal_id: &str) {
        let mut book = self.book.lock();
        if let Some(routes) = book.routes.get_mut(signal_id) {
            routes.retain(|r| r.channel.id() != channel.id());
            if routes.is_empty() {
                book.routes.remove(signal_id);
            }
            log::debug!("Route to {} via {} is unroutable", signal_id, channel);
        }
    }

    fn is_connected(&self, address: &PeerAddress) -> bool {
        self.book
            .lock()
            .by_addr
            .get(address)
            .is_some_and(|e| e.state == AddrState::Connected)
    }

    fn is_connecting(&self, address: &PeerAddress) -> bool {
        self.book
            .lock()
            .by_addr
            .get(address)
            .is_some_and(|e| e.state == AddrState::Connecting)
    }

    fn is_banned(&self, address: &PeerAddress) -> bool {
        self.book
            .lock()
            .by_addr
            .get(address)
            .is_some_and(|e| e.is_banned(Instant::now()))
    }

    fn ban(&self, address: &PeerAddress) {
        let mut book = self.book.lock();
        let entry = book
            .by_addr
            .entry(address.clone())
            .or_insert_with(|| AddrEntry::new(address.clone()));
        entry.state = AddrState::Banned;
        entry.banned_until = Some(Instant::now() + BAN_DURATION);
        log::info!("Banned address {}", address);
    }

    fn ingest(&self, channel: &PeerChannel, addresses: &[PeerAddress]) -> Vec<PeerAddress> {
        let mut guard = self.book.lock();
        let book = &mut *guard;
        let mut added = Vec::new();

        for address in addresses.iter().take(MAX_ADDR_PER_MESSAGE) {
            if book.is_local(address) {
                continue;
            }

            let mut address = address.clone();
            if let Some(signal_id) = address.signal_id().map(str::to_string) {
                // One more hop now that it came through this channel
                address.distance = address.distance.saturating_add(1);
                if address.distance > MAX_DISTANCE {
                    continue;
                }
                book.add_route(&signal_id, channel, address.distance);
            }

            match book.by_addr.get_mut(&address) {
                Some(entry) => {
                    if address.timestamp > entry.address.timestamp {
                        entry.address.timestamp = address.timestamp;
                    }
                    if entry.address.net_address.is_none() {
                        entry.address.net_address = address.net_address.clone();
                    }
                    if address.distance < entry.address.distance {
                        entry.address.distance = address.distance;
                    }
                }
                None => {
                    book.by_addr
                        .insert(address.clone(), AddrEntry::new(address.clone()));
                    added.push(address);
                }
            }
        }

        added
    }

    fn query(&self, protocol_mask: ProtocolMask, service_mask: ServiceFlags) -> Vec<PeerAddress> {
        let book = self.book.lock();
        let now = Instant::now();

        let mut addrs: Vec<PeerAddress> = book
            .by_addr
            .values()
            .filter(|e| !e.is_terrible() && !e.is_banned(now))
            .filter(|e| protocol_mask.contains(e.address.protocol().mask()))
            .filter(|e| e.address.services.intersects(service_mask))
            .map(|e| e.address.clone())
            .collect();

        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(MAX_ADDR_PER_MESSAGE);
        addrs
    }

    fn lookup_by_signal_id(&self, signal_id: &str) -> Option<PeerChannel> {
        let book = self.book.lock();

        // A connected relayed peer is its own best route
        let key = PeerAddress::relayed(signal_id, ServiceFlags::empty(), 0);
        if let Some(channel) = book
            .by_addr
            .get(&key)
            .filter(|e| e.state == AddrState::Connected)
            .and_then(|e| e.channel.as_ref())
            .filter(|c| !c.is_closed())
        {
            return Some(channel.clone());
        }

        book.routes
            .get(signal_id)?
            .iter()
            .find(|r| !r.channel.is_closed())
            .map(|r| r.channel.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::{Connection, Direction};

    fn channel() -> PeerChannel {
        let (conn, _end) = Connection::new(Direction::Inbound, Protocol::Direct, None, None);
        conn.channel
    }

    fn direct(host: &str) -> PeerAddress {
        PeerAddress::direct(host, 8443, ServiceFlags::FULL)
    }

    #[test]
    fn test_add_address() {
        let mgr = AddrManager::new();

        assert!(mgr.add(direct("8.8.8.8")));
        // Adding same address again should return false
        assert!(!mgr.add(direct("8.8.8.8")));

        assert_eq!(mgr.size(), 1);
        assert_eq!(mgr.state_of(&direct("8.8.8.8")), Some(AddrState::New));
    }

    #[test]
    fn test_local_address_ignored() {
        let local = direct("1.1.1.1");
        let mgr = AddrManager::with_local(local.clone());
        assert!(!mgr.add(local.clone()));
        assert!(mgr.ingest(&channel(), &[local]).is_empty());
        assert_eq!(mgr.size(), 0);
    }

    #[test]
    fn test_pick_skips_connected_and_connecting() {
        let mgr = AddrManager::new();
        let a = direct("1.1.1.1");
        let b = direct("8.8.8.8");
        mgr.add(a.clone());
        mgr.add(b.clone());

        mgr.mark_connecting(&a);
        assert!(mgr.is_connecting(&a));
        assert_eq!(mgr.pick_unconnected_address(), Some(b.clone()));

        let ch = channel();
        mgr.mark_connected(&ch, &b);
        assert!(mgr.is_connected(&b));
        assert_eq!(mgr.pick_unconnected_address(), None);

        mgr.mark_disconnected(&ch, true);
        assert!(!mgr.is_connected(&b));
        assert_eq!(mgr.pick_unconnected_address(), Some(b));
    }

    #[test]
    fn test_unreachable_addresses_are_dropped_after_failures() {
        let mgr = AddrManager::new();
        let a = direct("1.1.1.1");
        mgr.add(a.clone());

        for _ in 0..MAX_FAILED_ATTEMPTS {
            assert_eq!(mgr.pick_unconnected_address(), Some(a.clone()));
            mgr.mark_connecting(&a);
            mgr.mark_unreachable(&a);
        }
        assert_eq!(mgr.state_of(&a), Some(AddrState::Failed));
        assert_eq!(mgr.pick_unconnected_address(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_expires() {
        let mgr = AddrManager::new();
        let a = direct("1.1.1.1");
        mgr.ban(&a);
        assert!(mgr.is_banned(&a));
        assert_eq!(mgr.pick_unconnected_address(), None);

        tokio::time::advance(BAN_DURATION + Duration::from_secs(1)).await;
        assert!(!mgr.is_banned(&a));
    }

    #[test]
    fn test_ingest_returns_new_addresses() {
        let mgr = AddrManager::new();
        let ch = channel();
        mgr.add(direct("1.1.1.1"));

        let added = mgr.ingest(&ch, &[direct("1.1.1.1"), direct("2.2.2.2")]);
        assert_eq!(added, vec![direct("2.2.2.2")]);
        assert_eq!(mgr.size(), 2);
    }

    #[test]
    fn test_signal_routes() {
        let mgr = AddrManager::new();
        let near = channel();
        let far = channel();

        let relayed = PeerAddress::relayed("cafe", ServiceFlags::NANO, 0);
        mgr.ingest(&far, &[PeerAddress::relayed("cafe", ServiceFlags::NANO, 2)]);
        mgr.ingest(&near, &[relayed.clone()]);
        assert_eq!(mgr.get(&relayed).unwrap().distance, 1);

        assert_eq!(mgr.lookup_by_signal_id("cafe").unwrap().id(), near.id());

        mgr.mark_unroutable(&near, "cafe");
        assert_eq!(mgr.lookup_by_signal_id("cafe").unwrap().id(), far.id());

        mgr.mark_disconnected(&far, false);
        assert!(mgr.lookup_by_signal_id("cafe").is_none());
    }

    #[test]
    fn test_relayed_distance_limit() {
        let mgr = AddrManager::new();
        let ch = channel();
        let too_far = PeerAddress::relayed("beef", ServiceFlags::NANO, MAX_DISTANCE);
        assert!(mgr.ingest(&ch, &[too_far]).is_empty());
        assert!(mgr.lookup_by_signal_id("beef").is_none());
    }

    #[test]
    fn test_connected_relayed_peer_routes_to_itself() {
        let mgr = AddrManager::new();
        let ch = channel();
        let relayed = PeerAddress::relayed("abba", ServiceFlags::NANO, 0);
        mgr.mark_connected(&ch, &relayed);
        assert_eq!(mgr.lookup_by_signal_id("abba").unwrap().id(), ch.id());
    }

    #[test]
    fn test_query_filters_by_mask() {
        let mgr = AddrManager::new();
        let ch = channel();
        mgr.add(direct("1.1.1.1"));
        mgr.add(PeerAddress::direct("2.2.2.2", 8443, ServiceFlags::NANO));
        mgr.ingest(&ch, &[PeerAddress::relayed("cafe", ServiceFlags::FULL, 0)]);

        assert_eq!(mgr.query(ProtocolMask::all(), ServiceFlags::all()).len(), 3);
        assert_eq!(mgr.query(ProtocolMask::DIRECT, ServiceFlags::all()).len(), 2);
        assert_eq!(mgr.query(ProtocolMask::all(), ServiceFlags::FULL).len(), 2);
        assert_eq!(mgr.query(ProtocolMask::RELAYED, ServiceFlags::NANO).len(), 0);
    }
}

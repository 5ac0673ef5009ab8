//! Domain → IP cache fed by observed DNS responses.
//!
//! The tracker answers the reverse question ("which names resolve to this address?") for the
//! domain matchers. Entries expire lazily: readers skip stale records and the periodic cleanup
//! task (or capacity pressure) removes them.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use ipnet::IpNet;
use tokio::time::Instant;

/// Upper bound on tracked domains.
pub const MAX_DNS_RECORDS: usize = 10_000;

/// Records never live shorter than this, whatever TTL the resolver handed out.
pub const MIN_TTL: Duration = Duration::from_secs(60);

/// Resolves to the gateway address.
pub const HOST_INTERNAL_DOMAIN: &str = "host.lima.internal";

/// Resolves to the whole guest subnet. Never stored as a record.
pub const SUBNET_INTERNAL_DOMAIN: &str = "subnet.lima.internal";

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("invalid subnet {subnet:?}: {source}")]
    InvalidSubnet {
        subnet: String,
        #[source]
        source: ipnet::AddrParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub domain: String,
    pub ips: Vec<IpAddr>,
    /// `None` for pre-seeded records, which never expire.
    pub expire_at: Option<Instant>,
}

impl DnsRecord {
    pub fn is_pre_seeded(&self) -> bool {
        self.expire_at.is_none()
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expire_at, Some(at) if now > at)
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    records: HashMap<String, DnsRecord>,
    subnet: Option<IpNet>,
}

#[derive(Debug)]
pub struct Tracker {
    state: RwLock<TrackerState>,
    capacity: usize,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self::with_capacity(MAX_DNS_RECORDS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the guest subnet and pins the gateway name.
    ///
    /// The internal resolver answers `*.lima.internal` itself, so these names never show up in
    /// snooped traffic and have to be known up front.
    pub fn seed_internal_domains(&self, subnet: &str, gateway_ip: &str) -> Result<(), SeedError> {
        if subnet.is_empty() {
            return Ok(());
        }
        let net: IpNet = subnet.parse().map_err(|source| SeedError::InvalidSubnet {
            subnet: subnet.to_owned(),
            source,
        })?;

        let mut state = self.write();
        state.subnet = Some(net.trunc());
        if let Ok(gateway) = gateway_ip.parse::<IpAddr>() {
            state.records.insert(
                HOST_INTERNAL_DOMAIN.to_owned(),
                DnsRecord {
                    domain: HOST_INTERNAL_DOMAIN.to_owned(),
                    ips: vec![gateway],
                    expire_at: None,
                },
            );
        }
        Ok(())
    }

    pub fn is_pre_seeded(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        let state = self.read();
        if domain == SUBNET_INTERNAL_DOMAIN {
            return state.subnet.is_some();
        }
        state
            .records
            .get(&domain)
            .is_some_and(DnsRecord::is_pre_seeded)
    }

    /// Inserts or replaces the record for `domain`. TTLs below [`MIN_TTL`] are raised to it.
    ///
    /// Pre-seeded names are never overwritten. When the tracker is full and only pre-seeded
    /// records are left to evict, the answer is dropped.
    pub fn add_record(&self, domain: &str, ips: Vec<IpAddr>, ttl: Duration) {
        let domain = domain.to_ascii_lowercase();
        let now = Instant::now();
        let expire_at = now + ttl.max(MIN_TTL);

        let mut state = self.write();
        match state.records.get(&domain).map(DnsRecord::is_pre_seeded) {
            Some(true) => {
                tracing::debug!("ignoring DNS answer for pre-seeded domain {domain}");
                return;
            }
            Some(false) => {}
            None if state.records.len() >= self.capacity => {
                clean_expired_locked(&mut state, now);
                if state.records.len() >= self.capacity && !remove_oldest_locked(&mut state) {
                    tracing::debug!(
                        capacity = self.capacity,
                        "dns tracker full of pre-seeded records, dropping {domain}"
                    );
                    return;
                }
            }
            None => {}
        }
        state.records.insert(
            domain.clone(),
            DnsRecord {
                domain,
                ips,
                expire_at: Some(expire_at),
            },
        );
    }

    pub fn get_ips(&self, domain: &str) -> Vec<IpAddr> {
        let domain = domain.to_ascii_lowercase();
        let state = self.read();
        if domain == SUBNET_INTERNAL_DOMAIN {
            if let Some(subnet) = state.subnet {
                return vec![subnet.network()];
            }
        }
        match state.records.get(&domain) {
            Some(record) if !record.is_expired(Instant::now()) => record.ips.clone(),
            _ => Vec::new(),
        }
    }

    /// Union of the live addresses of every domain matching `pattern`, without duplicates.
    pub fn get_ips_for_pattern(&self, pattern: &str) -> Vec<IpAddr> {
        let pattern = pattern.to_ascii_lowercase();
        let now = Instant::now();
        let state = self.read();

        let mut seen = HashSet::new();
        let mut ips = Vec::new();
        for (domain, record) in &state.records {
            if record.is_expired(now) || !matches_pattern(domain, &pattern) {
                continue;
            }
            for ip in &record.ips {
                if seen.insert(*ip) {
                    ips.push(*ip);
                }
            }
        }
        ips
    }

    /// Reverse lookup. The synthetic subnet name comes first when `ip` lies inside the subnet.
    pub fn get_domains_for_ip(&self, ip: IpAddr) -> Vec<String> {
        let ip = ip.to_canonical();
        let now = Instant::now();
        let state = self.read();

        let mut domains = Vec::new();
        if state.subnet.is_some_and(|subnet| subnet.contains(&ip)) {
            domains.push(SUBNET_INTERNAL_DOMAIN.to_owned());
        }

        let mut learned: Vec<String> = state
            .records
            .values()
            .filter(|record| !record.is_expired(now))
            .filter(|record| record.ips.iter().any(|addr| addr.to_canonical() == ip))
            .map(|record| record.domain.clone())
            .collect();
        learned.sort_unstable();
        domains.extend(learned);
        domains
    }

    pub fn clean_expired(&self) {
        let mut state = self.write();
        clean_expired_locked(&mut state, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn clean_expired_locked(state: &mut TrackerState, now: Instant) {
    state.records.retain(|_, record| !record.is_expired(now));
}

/// Evicts the expiring record closest to expiry. Returns false when only pre-seeded records remain.
fn remove_oldest_locked(state: &mut TrackerState) -> bool {
    let oldest = state
        .records
        .iter()
        .filter_map(|(domain, record)| record.expire_at.map(|at| (at, domain)))
        .min_by_key(|(at, _)| *at)
        .map(|(_, domain)| domain.clone());
    match oldest {
        Some(domain) => state.records.remove(&domain).is_some(),
        None => false,
    }
}

/// Wildcard domain match.
///
/// * `example.com` matches only `example.com`
/// * `*.example.com` matches `api.example.com` but not `example.com`
/// * `*` matches everything
pub fn matches_pattern(domain: &str, pattern: &str) -> bool {
    if domain == pattern || pattern == "*" {
        return true;
    }
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    domain
        .strip_suffix(suffix)
        .is_some_and(|rest| rest.ends_with('.'))
}

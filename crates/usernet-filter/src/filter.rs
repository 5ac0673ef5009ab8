//! Installs the egress filter onto a running virtual network.

use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::FilterConfig;
use crate::forwarder::{FilterContext, FilteredTcpForwarder, FilteredUdpForwarder};
use crate::metrics::FilterMetrics;
use crate::policy::Policy;
use crate::stack::{IpFamily, NatError, NetworkConfig, VirtualNetwork};
use crate::table::{build_filter_table, BuildError};
use crate::tracker::{SeedError, Tracker};

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("install must run inside a tokio runtime")]
    NoRuntime,
    #[error("invalid NAT configuration")]
    Nat(#[source] NatError),
    #[error("failed to seed Lima internal domains")]
    Seed(#[source] SeedError),
    #[error("failed to build {} filter table", family_name(.family))]
    Build {
        family: IpFamily,
        #[source]
        source: BuildError,
    },
}

fn family_name(family: &IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "IPv4",
        IpFamily::V6 => "IPv6",
    }
}

/// Periodically purges expired tracker records until shut down or dropped.
pub struct CleanupHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CleanupHandle {
    fn spawn(runtime: &Handle, tracker: Arc<Tracker>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let before = tracker.len();
                        tracker.clean_expired();
                        tracing::trace!(removed = before.saturating_sub(tracker.len()), "dns tracker cleanup");
                    }
                }
            }
        });
        Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A virtual network with the egress filter in place. Derefs to the wrapped network.
pub struct FilteredNetwork<V> {
    inner: V,
    tracker: Arc<Tracker>,
    policy: Arc<Policy>,
    metrics: FilterMetrics,
    cleanup: CleanupHandle,
}

impl<V> FilteredNetwork<V> {
    pub fn inner(&self) -> &V {
        &self.inner
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn metrics(&self) -> &FilterMetrics {
        &self.metrics
    }

    /// Stops the cleanup task and hands back the wrapped network. The tables and forwarders stay
    /// installed on its stack.
    pub async fn shutdown(self) -> V {
        let Self { inner, cleanup, .. } = self;
        cleanup.shutdown().await;
        inner
    }
}

impl<V> Deref for FilteredNetwork<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner
    }
}

/// Replaces the network's filter tables and TCP/UDP forwarders with policy-enforcing ones.
///
/// Must be called from within a tokio runtime; the forwarders and the cleanup task run on it.
pub fn install<V: VirtualNetwork>(
    network: V,
    config: &NetworkConfig,
    policy: Policy,
    options: &FilterConfig,
) -> Result<FilteredNetwork<V>, InstallError> {
    let runtime = Handle::try_current().map_err(|_| InstallError::NoRuntime)?;
    let nat = config.nat_table().map_err(InstallError::Nat)?;

    let tracker = Arc::new(Tracker::with_capacity(options.max_dns_records));
    tracker
        .seed_internal_domains(&config.subnet, &config.gateway_ip)
        .map_err(InstallError::Seed)?;

    let metrics = FilterMetrics::new();
    let mut tables = Vec::with_capacity(2);
    for family in [IpFamily::V4, IpFamily::V6] {
        let table = build_filter_table(
            &policy,
            &tracker,
            &metrics,
            &config.subnet,
            &config.gateway_ip,
            family,
        )
        .map_err(|source| InstallError::Build { family, source })?;
        tables.push((family, table));
    }

    let stack = network.stack();
    for (family, table) in tables {
        stack.replace_filter_table(family, table);
    }

    let policy = Arc::new(policy);
    let context = Arc::new(FilterContext::new(
        policy.clone(),
        tracker.clone(),
        &config.subnet,
        &config.gateway_ip,
    ));
    let nat = Arc::new(Mutex::new(nat));
    stack.set_tcp_forwarder(Arc::new(
        FilteredTcpForwarder::new(context.clone(), nat.clone(), metrics.clone(), runtime.clone())
            .with_dial_timeout(options.dial_timeout)
            .with_metadata_access(config.ec2_metadata_access),
    ));
    stack.set_udp_forwarder(Arc::new(
        FilteredUdpForwarder::new(context, nat, metrics.clone(), runtime.clone())
            .with_idle_timeout(options.udp_idle_timeout),
    ));

    let cleanup = CleanupHandle::spawn(&runtime, tracker.clone(), options.cleanup_interval);
    tracing::info!(
        rules = policy.rules.len(),
        subnet = %config.subnet,
        gateway = %config.gateway_ip,
        "egress filter installed"
    );

    Ok(FilteredNetwork {
        inner: network,
        tracker,
        policy,
        metrics,
        cleanup,
    })
}

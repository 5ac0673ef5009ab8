//! TCP and UDP forwarders that apply the policy before dialing out.
//!
//! The stack hands every new guest flow to these handlers together with the destination the guest
//! asked for. Policy is evaluated against that pre-NAT address; the configured NAT map is applied
//! only to the address actually dialed.

use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::Poll;
use std::time::Duration;

use tokio::io::ReadBuf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;

use crate::matchers::is_loopback_or_link_local;
use crate::metrics::FilterMetrics;
use crate::policy::{Policy, PolicyRule, Protocol};
use crate::stack::{
    network_gateway, EndpointError, GuestDatagram, TcpForwarderHandler, TcpForwarderRequest,
    UdpForwarderHandler, UdpForwarderRequest,
};
use crate::tracker::{matches_pattern, Tracker};

const DNS_PORT: u16 = 53;
const MAX_DATAGRAM: usize = 65_535;

/// Destination address substitutions shared by both forwarders.
pub type NatTable = Arc<Mutex<HashMap<IpAddr, IpAddr>>>;

/// Runs `fut` to completion, or until `limit` passes. `None` means it timed out.
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn translate(nat: &NatTable, ip: IpAddr) -> IpAddr {
    let ip = ip.to_canonical();
    let nat = nat.lock().unwrap_or_else(PoisonError::into_inner);
    nat.get(&ip).copied().unwrap_or(ip)
}

/// Everything the connection-level policy check needs.
pub struct FilterContext {
    gateway_one: Option<Ipv4Addr>,
    internal_gateway: Option<Ipv4Addr>,
    policy: Arc<Policy>,
    tracker: Arc<Tracker>,
}

impl FilterContext {
    pub fn new(
        policy: Arc<Policy>,
        tracker: Arc<Tracker>,
        local_subnet: &str,
        gateway_ip: &str,
    ) -> Self {
        let internal_gateway = match gateway_ip.parse::<IpAddr>() {
            Ok(ip) => match ip.to_canonical() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            },
            Err(_) => None,
        };
        Self {
            gateway_one: network_gateway(local_subnet),
            internal_gateway,
            policy,
            tracker,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn is_destination_allowed(&self, ip: IpAddr, port: u16, protocol: Protocol) -> bool {
        if let IpAddr::V4(v4) = ip.to_canonical() {
            if self.gateway_one == Some(v4) && matches!(protocol, Protocol::Tcp | Protocol::Udp) {
                return true;
            }
            if self.internal_gateway == Some(v4) && protocol == Protocol::Udp && port == DNS_PORT {
                return true;
            }
        }

        if is_loopback_or_link_local(ip) {
            return true;
        }

        self.policy
            .rules
            .iter()
            .find(|rule| rule_matches(rule, ip, port, protocol, &self.tracker))
            .is_some_and(PolicyRule::is_allow)
    }
}

/// Whether `rule` applies to a connection. Protocol and port lists restrict; IP and domain lists
/// are alternatives.
pub fn rule_matches(
    rule: &PolicyRule,
    ip: IpAddr,
    port: u16,
    protocol: Protocol,
    tracker: &Tracker,
) -> bool {
    let egress = match &rule.egress {
        Some(egress) if !rule.matches_all() => egress,
        _ => return true,
    };

    if !egress.protocols.is_empty() && !egress.protocols.contains(&protocol) {
        return false;
    }
    if !egress.ports.is_empty() && !egress.ports.iter().any(|range| range.contains(port)) {
        return false;
    }

    let canonical = ip.to_canonical();
    if egress
        .ips
        .iter()
        .any(|net| net.contains(&ip) || net.contains(&canonical))
    {
        return true;
    }
    if !egress.domains.is_empty() {
        let domains = tracker.get_domains_for_ip(ip);
        if domains.iter().any(|domain| {
            egress
                .domains
                .iter()
                .any(|pattern| matches_pattern(domain, pattern))
        }) {
            return true;
        }
    }

    egress.ips.is_empty() && egress.domains.is_empty()
}

/// 169.254.0.0/16, which includes the cloud metadata service.
fn is_ipv4_link_local(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(_) => false,
    }
}

fn log_endpoint_error(err: &EndpointError, metrics: &FilterMetrics) {
    metrics.endpoint_failed();
    match err {
        EndpointError::ConnectionRefused => tracing::debug!("create endpoint: {err}"),
        EndpointError::Io(_) => tracing::error!("create endpoint: {err}"),
    }
}

pub struct FilteredTcpForwarder {
    context: Arc<FilterContext>,
    nat: NatTable,
    metrics: FilterMetrics,
    runtime: Handle,
    dial_timeout: Option<Duration>,
    metadata_access: bool,
}

impl FilteredTcpForwarder {
    pub fn new(
        context: Arc<FilterContext>,
        nat: NatTable,
        metrics: FilterMetrics,
        runtime: Handle,
    ) -> Self {
        Self {
            context,
            nat,
            metrics,
            runtime,
            dial_timeout: None,
            metadata_access: false,
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Option<Duration>) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Allow connections into 169.254.0.0/16.
    pub fn with_metadata_access(mut self, allowed: bool) -> Self {
        self.metadata_access = allowed;
        self
    }
}

impl TcpForwarderHandler for FilteredTcpForwarder {
    fn handle(&self, request: Box<dyn TcpForwarderRequest>) {
        let dst = request.id().dst;

        if !self.metadata_access && is_ipv4_link_local(dst.ip()) {
            self.metrics.tcp_denied();
            request.reject();
            return;
        }

        if !self
            .context
            .is_destination_allowed(dst.ip(), dst.port(), Protocol::Tcp)
        {
            tracing::info!(
                "Blocked TCP connection to {}:{} (policy violation)",
                dst.ip(),
                dst.port()
            );
            self.metrics.tcp_denied();
            request.reject();
            return;
        }
        self.metrics.tcp_allowed();

        let target = SocketAddr::new(translate(&self.nat, dst.ip()), dst.port());
        let metrics = self.metrics.clone();
        let dial_timeout = self.dial_timeout;
        self.runtime.spawn(async move {
            let mut outbound = match within(dial_timeout, TcpStream::connect(target)).await {
                Some(Ok(stream)) => stream,
                Some(Err(err)) => {
                    tracing::trace!("dial {target}: {err}");
                    metrics.tcp_dial_failed();
                    request.reject();
                    return;
                }
                None => {
                    tracing::trace!("dial {target}: timed out");
                    metrics.tcp_dial_failed();
                    request.reject();
                    return;
                }
            };

            let mut guest = match request.create_endpoint() {
                Ok(guest) => guest,
                Err(err) => {
                    log_endpoint_error(&err, &metrics);
                    return;
                }
            };

            metrics.tcp_conn_opened();
            if let Err(err) = tokio::io::copy_bidirectional(&mut guest, &mut outbound).await {
                tracing::debug!("tcp relay to {target} ended: {err}");
            }
            metrics.tcp_conn_closed();
        });
    }
}

pub struct FilteredUdpForwarder {
    context: Arc<FilterContext>,
    nat: NatTable,
    metrics: FilterMetrics,
    runtime: Handle,
    idle_timeout: Option<Duration>,
}

impl FilteredUdpForwarder {
    pub fn new(
        context: Arc<FilterContext>,
        nat: NatTable,
        metrics: FilterMetrics,
        runtime: Handle,
    ) -> Self {
        Self {
            context,
            nat,
            metrics,
            runtime,
            idle_timeout: None,
        }
    }

    /// Close a flow after this long without traffic in either direction.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

impl UdpForwarderHandler for FilteredUdpForwarder {
    fn handle(&self, request: Box<dyn UdpForwarderRequest>) {
        let dst = request.id().dst;

        // The stack's own resolver answers DNS.
        if dst.port() == DNS_PORT {
            return;
        }
        let canonical = dst.ip().to_canonical();
        if is_ipv4_link_local(canonical) || canonical == IpAddr::V4(Ipv4Addr::BROADCAST) {
            return;
        }

        if !self
            .context
            .is_destination_allowed(dst.ip(), dst.port(), Protocol::Udp)
        {
            tracing::info!(
                "Blocked UDP connection to {}:{} (policy violation)",
                dst.ip(),
                dst.port()
            );
            self.metrics.udp_denied();
            return;
        }
        self.metrics.udp_allowed();

        let target = SocketAddr::new(translate(&self.nat, dst.ip()), dst.port());
        let guest = match request.create_endpoint() {
            Ok(guest) => guest,
            Err(err) => {
                log_endpoint_error(&err, &self.metrics);
                return;
            }
        };

        let metrics = self.metrics.clone();
        let idle_timeout = self.idle_timeout;
        self.runtime.spawn(async move {
            metrics.udp_flow_opened();
            if let Err(err) = relay_udp(guest, target, idle_timeout).await {
                tracing::debug!("udp relay to {target} ended: {err}");
            }
            metrics.udp_flow_closed();
        });
    }
}

enum Datagram {
    FromGuest(io::Result<usize>),
    FromRemote(io::Result<usize>),
}

async fn relay_udp(
    mut guest: Box<dyn GuestDatagram>,
    target: SocketAddr,
    idle_timeout: Option<Duration>,
) -> io::Result<()> {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let outbound = UdpSocket::bind(bind).await?;
    outbound.connect(target).await?;

    let mut from_guest = vec![0u8; MAX_DATAGRAM];
    let mut from_remote = vec![0u8; MAX_DATAGRAM];
    loop {
        let next = within(idle_timeout, async {
            tokio::select! {
                res = poll_fn(|cx| {
                    let mut buf = ReadBuf::new(&mut from_guest);
                    match guest.poll_recv(cx, &mut buf) {
                        Poll::Ready(Ok(())) => Poll::Ready(Ok(buf.filled().len())),
                        Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                        Poll::Pending => Poll::Pending,
                    }
                }) => Datagram::FromGuest(res),
                res = outbound.recv(&mut from_remote) => Datagram::FromRemote(res),
            }
        })
        .await;

        match next {
            None => {
                tracing::trace!("udp flow to {target} idle, closing");
                return Ok(());
            }
            Some(Datagram::FromGuest(res)) => {
                let len = res?;
                outbound.send(&from_guest[..len]).await?;
            }
            Some(Datagram::FromRemote(res)) => {
                let len = res?;
                let datagram = &from_remote[..len];
                poll_fn(|cx| guest.poll_send(cx, datagram)).await?;
            }
        }
    }
}

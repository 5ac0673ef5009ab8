#![forbid(unsafe_code)]

//! Egress policy enforcement for a user-mode VM network.
//!
//! The filter decorates a [`VirtualNetwork`]: it installs per-family rule tables on the packet
//! stack, snoops DNS answers to learn which addresses belong to which domains, and takes over
//! TCP/UDP forwarding so every outbound connection is checked against the [`Policy`].

pub mod config;
pub mod filter;
pub mod forwarder;
pub mod matchers;
pub mod metrics;
pub mod policy;
pub mod snooper;
pub mod stack;
pub mod table;
pub mod tracker;

pub use config::{ConfigError, FilterConfig};
pub use filter::{install, CleanupHandle, FilteredNetwork, InstallError};
pub use forwarder::{FilterContext, FilteredTcpForwarder, FilteredUdpForwarder, NatTable};
pub use metrics::{FilterMetrics, MetricsSnapshot};
pub use policy::{
    load_policy, parse_policy, save_policy_json, Action, Policy, PolicyError, PolicyFormat,
    PolicyMatch, PolicyRule, PortRange, Protocol,
};
pub use snooper::{parse_dns_response, SnoopedResponse};
pub use stack::{
    Hook, IpFamily, NetStack, NetworkConfig, PacketBuffer, TransportEndpointId, VirtualNetwork,
};
pub use table::{build_filter_table, BuildError, Table, Verdict};
pub use tracker::{matches_pattern, SeedError, Tracker};

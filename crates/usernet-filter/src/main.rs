#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use usernet_filter::{
    build_filter_table, load_policy, parse_dns_response, save_policy_json, FilterConfig,
    FilterContext, FilterMetrics, Hook, IpFamily, NetworkConfig, PacketBuffer, Protocol, Tracker,
};
use usernet_packet::{Ipv4PacketBuilder, Ipv6PacketBuilder, TcpSegmentBuilder, UdpPacketBuilder};

#[derive(Parser, Debug)]
#[command(
    name = "usernet-filter",
    about = "Inspect and exercise egress policies for the user-mode VM network."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct NetworkArgs {
    /// Network config file (YAML or JSON) with subnet, gateway_ip, nat and ec2_metadata_access
    #[arg(long, value_name = "PATH", conflicts_with_all = ["subnet", "gateway"])]
    network: Option<PathBuf>,

    /// Guest subnet in CIDR notation
    #[arg(long, default_value = "192.168.127.0/24")]
    subnet: String,

    /// Internal gateway address serving DNS
    #[arg(long, default_value = "192.168.127.2")]
    gateway: String,
}

impl NetworkArgs {
    fn load(&self) -> anyhow::Result<NetworkConfig> {
        match &self.network {
            Some(path) => load_network_config(path),
            None => Ok(NetworkConfig {
                subnet: self.subnet.clone(),
                gateway_ip: self.gateway.clone(),
                ..NetworkConfig::default()
            }),
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FamilyArg {
    V4,
    V6,
    Both,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ProtocolArg {
    Tcp,
    Udp,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a policy file
    Validate {
        policy: PathBuf,

        /// Write the normalized policy as JSON to this path
        #[arg(long, value_name = "PATH")]
        write_json: Option<PathBuf>,
    },
    /// Print the filter tables a policy compiles to
    Tables {
        #[arg(long, value_name = "PATH")]
        policy: PathBuf,

        #[command(flatten)]
        network: NetworkArgs,

        #[arg(long, value_enum, default_value_t = FamilyArg::Both)]
        family: FamilyArg,
    },
    /// Decide whether a connection would be forwarded
    Check {
        #[arg(long, value_name = "PATH")]
        policy: PathBuf,

        #[command(flatten)]
        network: NetworkArgs,

        #[arg(long)]
        dest: IpAddr,

        #[arg(long)]
        port: u16,

        #[arg(long, value_enum, default_value_t = ProtocolArg::Tcp)]
        protocol: ProtocolArg,

        /// Pretend DNS resolved DOMAIN to IP (repeatable)
        #[arg(long = "record", value_name = "DOMAIN=IP")]
        records: Vec<String>,

        /// Print the filter counters after the check
        #[arg(long)]
        metrics: bool,
    },
    /// Show what would be learned from a hex-encoded DNS response
    Snoop { hex: String },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.command {
        Command::Validate { policy, write_json } => validate(&policy, write_json.as_deref()),
        Command::Tables {
            policy,
            network,
            family,
        } => tables(&policy, &network.load()?, family),
        Command::Check {
            policy,
            network,
            dest,
            port,
            protocol,
            records,
            metrics,
        } => check(
            &policy,
            &network.load()?,
            dest,
            port,
            protocol,
            &records,
            metrics,
        ),
        Command::Snoop { hex } => snoop(&hex),
    }
}

fn validate(path: &Path, write_json: Option<&Path>) -> anyhow::Result<()> {
    let policy =
        load_policy(path).with_context(|| format!("load policy {}", path.display()))?;
    println!(
        "policy {} OK: version {}, {} rule(s)",
        path.display(),
        policy.version,
        policy.rules.len()
    );
    for rule in &policy.rules {
        println!(
            "  {:>6}  {:<5}  {}",
            rule.priority,
            rule.action.as_str(),
            rule.name
        );
    }
    if let Some(out) = write_json {
        save_policy_json(&policy, out).with_context(|| format!("write {}", out.display()))?;
        println!("wrote {}", out.display());
    }
    Ok(())
}

fn seeded_tracker(network: &NetworkConfig) -> anyhow::Result<Arc<Tracker>> {
    let options = FilterConfig::from_env()?;
    let tracker = Arc::new(Tracker::with_capacity(options.max_dns_records));
    tracker
        .seed_internal_domains(&network.subnet, &network.gateway_ip)
        .context("failed to seed Lima internal domains")?;
    Ok(tracker)
}

fn tables(path: &Path, network: &NetworkConfig, family: FamilyArg) -> anyhow::Result<()> {
    let policy =
        load_policy(path).with_context(|| format!("load policy {}", path.display()))?;
    let tracker = seeded_tracker(network)?;
    let metrics = FilterMetrics::new();

    let families: &[IpFamily] = match family {
        FamilyArg::V4 => &[IpFamily::V4],
        FamilyArg::V6 => &[IpFamily::V6],
        FamilyArg::Both => &[IpFamily::V4, IpFamily::V6],
    };
    for family in families {
        let table = build_filter_table(
            &policy,
            &tracker,
            &metrics,
            &network.subnet,
            &network.gateway_ip,
            *family,
        )
        .with_context(|| format!("failed to build {} filter table", family.as_str()))?;
        print!("{table}");
    }
    Ok(())
}

fn check(
    path: &Path,
    network: &NetworkConfig,
    dest: IpAddr,
    port: u16,
    protocol: ProtocolArg,
    records: &[String],
    show_metrics: bool,
) -> anyhow::Result<()> {
    let policy =
        load_policy(path).with_context(|| format!("load policy {}", path.display()))?;
    let tracker = seeded_tracker(network)?;
    for record in records {
        let (domain, ip) = parse_record(record)?;
        tracker.add_record(domain, vec![ip], Duration::from_secs(300));
    }

    let protocol = match protocol {
        ProtocolArg::Tcp => Protocol::Tcp,
        ProtocolArg::Udp => Protocol::Udp,
    };
    let metrics = FilterMetrics::new();
    let family = IpFamily::of(dest);
    let table = build_filter_table(
        &policy,
        &tracker,
        &metrics,
        &network.subnet,
        &network.gateway_ip,
        family,
    )
    .with_context(|| format!("failed to build {} filter table", family.as_str()))?;
    let packet = probe_packet(dest, port, protocol)?;
    let verdict = table.evaluate(Hook::Output, &PacketBuffer::parse(&packet)?);

    let context = FilterContext::new(
        Arc::new(policy),
        tracker.clone(),
        &network.subnet,
        &network.gateway_ip,
    );
    let allowed = context.is_destination_allowed(dest, port, protocol);
    let domains = tracker.get_domains_for_ip(dest);
    println!(
        "{} {protocol} {dest}:{port}{}",
        if allowed { "allow" } else { "deny" },
        if domains.is_empty() {
            String::new()
        } else {
            format!(" ({})", domains.join(", "))
        }
    );
    println!("table verdict: {verdict}");
    if show_metrics {
        print!("{}", metrics.render_prometheus());
    }
    Ok(())
}

/// A guest packet opening a flow to `dest:port`, as the output chain would see it.
fn probe_packet(dest: IpAddr, port: u16, protocol: Protocol) -> anyhow::Result<Vec<u8>> {
    let src = match dest {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let (next_header, transport) = match protocol {
        Protocol::Udp => (
            usernet_packet::IPPROTO_UDP,
            UdpPacketBuilder {
                src_port: 40000,
                dst_port: port,
                payload: &[],
            }
            .build_vec(src, dest)?,
        ),
        _ => (
            usernet_packet::IPPROTO_TCP,
            TcpSegmentBuilder::syn(40000, port, 0).build_vec(src, dest)?,
        ),
    };
    let packet = match (src, dest) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => Ipv4PacketBuilder {
            src,
            dst,
            protocol: next_header,
            ttl: 64,
            identification: 0,
            payload: &transport,
        }
        .build_vec()?,
        (IpAddr::V6(src), IpAddr::V6(dst)) => Ipv6PacketBuilder {
            src,
            dst,
            next_header,
            hop_limit: 64,
            payload: &transport,
        }
        .build_vec()?,
        _ => bail!("source and destination families differ"),
    };
    Ok(packet)
}

fn parse_record(record: &str) -> anyhow::Result<(&str, IpAddr)> {
    let (domain, ip) = record
        .split_once('=')
        .ok_or_else(|| anyhow!("record {record:?} must look like DOMAIN=IP"))?;
    let ip = ip
        .trim()
        .parse()
        .with_context(|| format!("record {record:?}: invalid IP"))?;
    Ok((domain.trim(), ip))
}

fn snoop(hex_payload: &str) -> anyhow::Result<()> {
    let cleaned: String = hex_payload.split_whitespace().collect();
    let data = hex::decode(&cleaned).context("decode hex payload")?;
    let Some(response) = parse_dns_response(&data) else {
        bail!("not a DNS response with answers");
    };
    println!("domain: {}", response.domain);
    println!("ttl: {}s", response.ttl);
    for ip in &response.ips {
        println!("ip: {ip}");
    }
    if response.ips.is_empty() {
        println!("no A/AAAA answers; nothing would be tracked");
    }
    Ok(())
}

fn load_network_config(path: &Path) -> anyhow::Result<NetworkConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read network config {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let config = if is_json {
        serde_json::from_str(&raw)
            .with_context(|| format!("parse network config {}", path.display()))?
    } else {
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parse network config {}", path.display()))?
    };
    Ok(config)
}

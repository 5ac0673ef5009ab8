//! Per-family rule tables and their construction from a policy.
//!
//! A table has three chains. `input` and `forward` accept everything; only egress is filtered.
//! The `output` chain is laid out as:
//!
//! 1. DNS snooper (never matches, feeds the tracker)
//! 2. broadcast DHCP accept (IPv4 only)
//! 3. TCP and UDP to the subnet's `.1` accept (IPv4 only)
//! 4. UDP/53 to the internal gateway accept (gateway family only)
//! 5. expanded policy rules in priority order
//! 6. drop of public addresses never seen in DNS
//! 7. underflow: drop
//!
//! Chains are first-match-wins.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnet::IpNet;

use crate::matchers::{
    DnsResolvedOnlyMatcher, DomainMatcher, IpMatcher, Matcher, PortMatcher, ProtocolMatcher,
};
use crate::metrics::FilterMetrics;
use crate::policy::{Policy, PolicyRule, PortRange, Protocol};
use crate::snooper::DnsSnooper;
use crate::stack::{network_gateway, Hook, IpFamily, PacketBuffer};
use crate::tracker::Tracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Drop => "drop",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Matchers are ANDed; a rule without matchers matches every packet.
pub struct Rule {
    pub matchers: Vec<Box<dyn Matcher>>,
    pub target: Verdict,
}

impl Rule {
    pub fn unconditional(target: Verdict) -> Self {
        Self {
            matchers: Vec::new(),
            target,
        }
    }

    pub fn new(matchers: Vec<Box<dyn Matcher>>, target: Verdict) -> Self {
        Self { matchers, target }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.matchers.is_empty() {
            f.write_str("all")?;
        }
        for (idx, matcher) in self.matchers.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{matcher}")?;
        }
        write!(f, " -> {}", self.target)
    }
}

pub struct Chain {
    pub rules: Vec<Rule>,
    /// Verdict when no rule matches.
    pub underflow: Verdict,
}

impl Chain {
    pub fn accept_all() -> Self {
        Self {
            rules: vec![Rule::unconditional(Verdict::Accept)],
            underflow: Verdict::Accept,
        }
    }

    pub fn evaluate(&self, hook: Hook, packet: &PacketBuffer<'_>) -> Verdict {
        'rules: for rule in &self.rules {
            for matcher in &rule.matchers {
                let result = matcher.matches(hook, packet);
                if result.hard_drop {
                    return Verdict::Drop;
                }
                if !result.matched {
                    continue 'rules;
                }
            }
            return rule.target;
        }
        self.underflow
    }
}

pub struct Table {
    pub family: IpFamily,
    pub input: Chain,
    pub forward: Chain,
    pub output: Chain,
}

impl Table {
    /// `None` for hooks this table leaves unset.
    pub fn chain(&self, hook: Hook) -> Option<&Chain> {
        match hook {
            Hook::Input => Some(&self.input),
            Hook::Forward => Some(&self.forward),
            Hook::Output => Some(&self.output),
            Hook::Prerouting | Hook::Postrouting => None,
        }
    }

    pub fn evaluate(&self, hook: Hook, packet: &PacketBuffer<'_>) -> Verdict {
        match self.chain(hook) {
            Some(chain) => chain.evaluate(hook, packet),
            None => Verdict::Accept,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "table {}", self.family.as_str())?;
        for (name, chain) in [
            ("input", &self.input),
            ("forward", &self.forward),
            ("output", &self.output),
        ] {
            writeln!(f, "chain {name} (underflow {})", chain.underflow)?;
            for (idx, rule) in chain.rules.iter().enumerate() {
                writeln!(f, "  {idx:>3}: {rule}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error(
        "rule '{rule}': domain '{domain}' cannot be used in deny rule - only pre-seeded domains work (currently: host.lima.internal, subnet.lima.internal)"
    )]
    DenyDomainNotPreSeeded { rule: String, domain: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to build rule '{rule}'")]
    Rule {
        rule: String,
        #[source]
        source: RuleError,
    },
}

/// Inputs shared by every table built for one network.
pub struct TableBuilder<'a> {
    pub tracker: &'a Arc<Tracker>,
    pub metrics: &'a FilterMetrics,
    /// Guest subnet in CIDR notation. Unparsable or empty skips the `.1` rules.
    pub local_subnet: &'a str,
    /// Internal gateway address. Unparsable or empty skips the DNS rule.
    pub gateway_ip: &'a str,
}

impl TableBuilder<'_> {
    pub fn build(&self, policy: &Policy, family: IpFamily) -> Result<Table, BuildError> {
        let mut output = Vec::new();

        output.push(Rule::new(
            vec![Box::new(DnsSnooper {
                tracker: self.tracker.clone(),
                metrics: self.metrics.clone(),
            })],
            Verdict::Drop,
        ));

        if family == IpFamily::V4 {
            output.push(Rule::new(
                vec![
                    Box::new(ProtocolMatcher {
                        protocol: usernet_packet::IPPROTO_UDP,
                    }),
                    Box::new(PortMatcher { start: 67, end: 68 }),
                    Box::new(IpMatcher {
                        networks: vec![host_net(IpAddr::V4(Ipv4Addr::BROADCAST))],
                    }),
                ],
                Verdict::Accept,
            ));

            if let Some(gateway_one) = network_gateway(self.local_subnet) {
                let net = host_net(IpAddr::V4(gateway_one));
                for protocol in [usernet_packet::IPPROTO_TCP, usernet_packet::IPPROTO_UDP] {
                    output.push(Rule::new(
                        vec![
                            Box::new(ProtocolMatcher { protocol }),
                            Box::new(IpMatcher {
                                networks: vec![net],
                            }),
                        ],
                        Verdict::Accept,
                    ));
                }
            }
        }

        if let Ok(gateway) = self.gateway_ip.parse::<IpAddr>() {
            if IpFamily::of(gateway) == family {
                output.push(Rule::new(
                    vec![
                        Box::new(ProtocolMatcher {
                            protocol: usernet_packet::IPPROTO_UDP,
                        }),
                        Box::new(PortMatcher { start: 53, end: 53 }),
                        Box::new(IpMatcher {
                            networks: vec![host_net(gateway)],
                        }),
                    ],
                    Verdict::Accept,
                ));
            }
        }

        for rule in &policy.rules {
            let expanded = self
                .expand_rule(rule, family)
                .map_err(|source| BuildError::Rule {
                    rule: rule.name.clone(),
                    source,
                })?;
            output.extend(expanded);
        }

        output.push(Rule::new(
            vec![Box::new(DnsResolvedOnlyMatcher {
                tracker: self.tracker.clone(),
                metrics: self.metrics.clone(),
            })],
            Verdict::Drop,
        ));

        Ok(Table {
            family,
            input: Chain::accept_all(),
            forward: Chain::accept_all(),
            output: Chain {
                rules: output,
                underflow: Verdict::Drop,
            },
        })
    }

    /// One policy rule becomes one rule per protocol and port combination, each doubled into an
    /// IP variant and a domain variant when both lists are present.
    fn expand_rule(&self, rule: &PolicyRule, family: IpFamily) -> Result<Vec<Rule>, RuleError> {
        let target = if rule.is_allow() {
            Verdict::Accept
        } else {
            Verdict::Drop
        };
        let egress = match &rule.egress {
            Some(egress) if !rule.matches_all() => egress,
            _ => return Ok(vec![Rule::unconditional(target)]),
        };

        if rule.is_deny() {
            if let Some(domain) = egress
                .domains
                .iter()
                .find(|domain| !self.tracker.is_pre_seeded(domain))
            {
                return Err(RuleError::DenyDomainNotPreSeeded {
                    rule: rule.name.clone(),
                    domain: domain.clone(),
                });
            }
        }

        let protocols: Vec<Option<u8>> = if egress.protocols.is_empty() {
            vec![None]
        } else {
            egress
                .protocols
                .iter()
                .map(|p| Some(protocol_number(*p, family)))
                .collect()
        };
        let ports: Vec<Option<PortRange>> = if egress.ports.is_empty() {
            vec![None]
        } else {
            egress.ports.iter().copied().map(Some).collect()
        };

        let mut rules = Vec::new();
        for protocol in &protocols {
            for port in &ports {
                let base = || {
                    let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
                    if let Some(protocol) = *protocol {
                        matchers.push(Box::new(ProtocolMatcher { protocol }));
                    }
                    if let Some(port) = *port {
                        matchers.push(Box::new(PortMatcher {
                            start: port.start,
                            end: port.end,
                        }));
                    }
                    matchers
                };

                let mut emitted = false;
                if !egress.ips.is_empty() {
                    let mut matchers: Vec<Box<dyn Matcher>> = vec![Box::new(IpMatcher {
                        networks: egress.ips.clone(),
                    })];
                    matchers.extend(base());
                    rules.push(Rule::new(matchers, target));
                    emitted = true;
                }
                if !egress.domains.is_empty() {
                    let mut matchers: Vec<Box<dyn Matcher>> = vec![Box::new(DomainMatcher {
                        tracker: self.tracker.clone(),
                        patterns: egress.domains.clone(),
                    })];
                    matchers.extend(base());
                    rules.push(Rule::new(matchers, target));
                    emitted = true;
                }
                if !emitted {
                    rules.push(Rule::new(base(), target));
                }
            }
        }
        Ok(rules)
    }
}

/// Builds the table for `family`. See the module docs for the chain layout.
pub fn build_filter_table(
    policy: &Policy,
    tracker: &Arc<Tracker>,
    metrics: &FilterMetrics,
    local_subnet: &str,
    gateway_ip: &str,
    family: IpFamily,
) -> Result<Table, BuildError> {
    TableBuilder {
        tracker,
        metrics,
        local_subnet,
        gateway_ip,
    }
    .build(policy, family)
}

pub(crate) fn protocol_number(protocol: Protocol, family: IpFamily) -> u8 {
    match (protocol, family) {
        (Protocol::Tcp, _) => usernet_packet::IPPROTO_TCP,
        (Protocol::Udp, _) => usernet_packet::IPPROTO_UDP,
        (Protocol::Icmp, IpFamily::V4) => usernet_packet::IPPROTO_ICMP,
        (Protocol::Icmp, IpFamily::V6) => usernet_packet::IPPROTO_ICMPV6,
    }
}

fn host_net(ip: IpAddr) -> IpNet {
    IpNet::from(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchers::MatchResult;
    use crate::policy::{parse_policy, PolicyFormat};
    use std::error::Error as _;
    use std::time::Duration;
    use usernet_packet::{Ipv4PacketBuilder, Ipv6PacketBuilder, TcpSegmentBuilder, UdpPacketBuilder};

    const SUBNET: &str = "192.168.127.0/24";
    const GATEWAY: &str = "192.168.127.2";

    fn policy(yaml: &str) -> Policy {
        parse_policy(yaml, PolicyFormat::Yaml).unwrap()
    }

    fn seeded_tracker() -> Arc<Tracker> {
        let tracker = Arc::new(Tracker::new());
        tracker.seed_internal_domains(SUBNET, GATEWAY).unwrap();
        tracker
    }

    fn build(policy: &Policy, tracker: &Arc<Tracker>, family: IpFamily) -> Result<Table, BuildError> {
        build_filter_table(policy, tracker, &FilterMetrics::new(), SUBNET, GATEWAY, family)
    }

    fn v4(protocol: u8, dst: Ipv4Addr, dport: u16) -> Vec<u8> {
        let src = Ipv4Addr::new(192, 168, 127, 3);
        let payload = if protocol == usernet_packet::IPPROTO_TCP {
            TcpSegmentBuilder::syn(40000, dport, 1)
                .build_vec(src.into(), dst.into())
                .unwrap()
        } else if protocol == usernet_packet::IPPROTO_UDP {
            UdpPacketBuilder {
                src_port: 40000,
                dst_port: dport,
                payload: b"q",
            }
            .build_vec(src.into(), dst.into())
            .unwrap()
        } else {
            vec![8, 0, 0, 0, 0, 0, 0, 0]
        };
        Ipv4PacketBuilder {
            src,
            dst,
            protocol,
            ttl: 64,
            identification: 1,
            payload: &payload,
        }
        .build_vec()
        .unwrap()
    }

    fn verdict(table: &Table, raw: &[u8]) -> Verdict {
        table.evaluate(Hook::Output, &PacketBuffer::parse(raw).unwrap())
    }

    const ALLOW_HTTPS_IP: &str = r#"
version: "1.0"
rules:
  - name: https
    action: allow
    priority: 10
    egress:
      protocols: [tcp]
      ips: [1.1.1.1]
      ports: ["443"]
"#;

    #[test]
    fn ipv4_output_chain_layout() {
        let tracker = seeded_tracker();
        let table = build(&policy(ALLOW_HTTPS_IP), &tracker, IpFamily::V4).unwrap();

        let names: Vec<Vec<&str>> = table
            .output
            .rules
            .iter()
            .map(|r| r.matchers.iter().map(|m| m.name()).collect())
            .collect();
        assert_eq!(
            names,
            vec![
                vec!["dnsSnooper"],
                vec!["protocolMatcher", "portMatcher", "ipMatcher"],
                vec!["protocolMatcher", "ipMatcher"],
                vec!["protocolMatcher", "ipMatcher"],
                vec!["protocolMatcher", "portMatcher", "ipMatcher"],
                vec!["ipMatcher", "protocolMatcher", "portMatcher"],
                vec!["dnsResolvedOnly"],
            ]
        );
        assert_eq!(table.output.underflow, Verdict::Drop);
        assert_eq!(table.input.underflow, Verdict::Accept);
        assert_eq!(table.forward.rules.len(), 1);
    }

    #[test]
    fn ipv6_table_skips_ipv4_builtins() {
        let tracker = seeded_tracker();
        let table = build(&policy(ALLOW_HTTPS_IP), &tracker, IpFamily::V6).unwrap();
        assert_eq!(table.output.rules.len(), 3);
        assert_eq!(table.output.rules[0].matchers[0].name(), "dnsSnooper");
        assert_eq!(table.output.rules[2].matchers[0].name(), "dnsResolvedOnly");

        let with_v6_gateway =
            build_filter_table(&policy(ALLOW_HTTPS_IP), &tracker, &FilterMetrics::new(), SUBNET, "fd00::2", IpFamily::V6)
                .unwrap();
        assert_eq!(with_v6_gateway.output.rules.len(), 4);
        assert_eq!(
            with_v6_gateway.output.rules[1].to_string(),
            "proto udp dport 53 dst fd00::2/128 -> accept"
        );
    }

    #[test]
    fn expansion_is_protocols_by_ports_by_destination_kind() {
        let tracker = seeded_tracker();
        let p = policy(
            r#"
version: "1.0"
rules:
  - name: web
    action: allow
    priority: 1
    egress:
      protocols: [tcp, udp]
      ports: ["80", "443"]
      ips: [10.0.0.0/8]
      domains: ["*.example.com"]
"#,
        );
        let table = build(&p, &tracker, IpFamily::V4).unwrap();
        // 5 leading built-ins, 2 x 2 x 2 expanded, 1 trailing.
        assert_eq!(table.output.rules.len(), 5 + 8 + 1);
        let rendered: Vec<String> = table.output.rules[5..13]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(rendered[0], "dst 10.0.0.0/8 proto tcp dport 80 -> accept");
        assert_eq!(rendered[1], "domain *.example.com proto tcp dport 80 -> accept");
        assert_eq!(rendered[7], "domain *.example.com proto udp dport 443 -> accept");
    }

    #[test]
    fn empty_match_is_one_unconditional_rule() {
        let tracker = seeded_tracker();
        let p = policy(
            r#"
version: "1.0"
rules:
  - name: everything
    action: allow
    priority: 1
"#,
        );
        let table = build(&p, &tracker, IpFamily::V6).unwrap();
        assert_eq!(table.output.rules.len(), 3);
        assert_eq!(table.output.rules[1].to_string(), "all -> accept");
    }

    #[test]
    fn icmp_protocol_depends_on_family() {
        let tracker = seeded_tracker();
        let p = policy(
            r#"
version: "1.0"
rules:
  - name: ping
    action: allow
    priority: 1
    egress:
      protocols: [icmp]
"#,
        );
        let v4_table = build(&p, &tracker, IpFamily::V4).unwrap();
        assert_eq!(v4_table.output.rules[5].to_string(), "proto icmp -> accept");
        let v6_table = build(&p, &tracker, IpFamily::V6).unwrap();
        assert_eq!(v6_table.output.rules[1].to_string(), "proto icmpv6 -> accept");

        let ping = v4(usernet_packet::IPPROTO_ICMP, Ipv4Addr::new(8, 8, 8, 8), 0);
        assert_eq!(verdict(&v4_table, &ping), Verdict::Accept);
    }

    #[test]
    fn deny_domains_must_be_pre_seeded() {
        let tracker = seeded_tracker();
        let evil = policy(
            r#"
version: "1.0"
rules:
  - name: block-evil
    action: deny
    priority: 1
    egress:
      domains: [evil.com]
"#,
        );
        let err = build(&evil, &tracker, IpFamily::V4).err().unwrap();
        assert_eq!(err.to_string(), "failed to build rule 'block-evil'");
        assert_eq!(
            err.source().unwrap().to_string(),
            "rule 'block-evil': domain 'evil.com' cannot be used in deny rule - only pre-seeded domains work (currently: host.lima.internal, subnet.lima.internal)"
        );

        for domain in ["host.lima.internal", "subnet.lima.internal"] {
            let p = policy(&format!(
                "version: \"1.0\"\nrules:\n  - name: block-host\n    action: deny\n    priority: 1\n    egress:\n      domains: [{domain}]\n"
            ));
            assert!(build(&p, &tracker, IpFamily::V4).is_ok(), "{domain}");
        }

        // Allow rules may name any domain.
        let allow = policy(
            r#"
version: "1.0"
rules:
  - name: allow-evil
    action: allow
    priority: 1
    egress:
      domains: [evil.com]
"#,
        );
        assert!(build(&allow, &tracker, IpFamily::V4).is_ok());
    }

    #[test]
    fn builtins_and_default_deny() {
        let tracker = seeded_tracker();
        let table = build(&policy(ALLOW_HTTPS_IP), &tracker, IpFamily::V4).unwrap();
        let tcp = usernet_packet::IPPROTO_TCP;
        let udp = usernet_packet::IPPROTO_UDP;

        assert_eq!(verdict(&table, &v4(udp, Ipv4Addr::BROADCAST, 67)), Verdict::Accept);
        assert_eq!(verdict(&table, &v4(tcp, Ipv4Addr::new(192, 168, 127, 1), 22)), Verdict::Accept);
        assert_eq!(verdict(&table, &v4(udp, Ipv4Addr::new(192, 168, 127, 1), 123)), Verdict::Accept);
        assert_eq!(verdict(&table, &v4(udp, Ipv4Addr::new(192, 168, 127, 2), 53)), Verdict::Accept);
        assert_eq!(verdict(&table, &v4(tcp, Ipv4Addr::new(192, 168, 127, 2), 80)), Verdict::Drop);

        assert_eq!(verdict(&table, &v4(tcp, Ipv4Addr::new(1, 1, 1, 1), 443)), Verdict::Accept);
        assert_eq!(verdict(&table, &v4(tcp, Ipv4Addr::new(1, 1, 1, 1), 80)), Verdict::Drop);
        assert_eq!(verdict(&table, &v4(udp, Ipv4Addr::new(1, 1, 1, 1), 443)), Verdict::Drop);
    }

    #[test]
    fn domain_rule_allows_only_resolved_addresses() {
        let tracker = seeded_tracker();
        let p = policy(
            r#"
version: "1.0"
rules:
  - name: example
    action: allow
    priority: 1
    egress:
      domains: ["*.example.com"]
"#,
        );
        let table = build(&p, &tracker, IpFamily::V4).unwrap();
        let resolved = Ipv4Addr::new(93, 184, 216, 34);
        tracker.add_record("api.example.com", vec![resolved.into()], Duration::from_secs(300));

        let tcp = usernet_packet::IPPROTO_TCP;
        assert_eq!(verdict(&table, &v4(tcp, resolved, 443)), Verdict::Accept);
        assert_eq!(verdict(&table, &v4(tcp, Ipv4Addr::new(93, 184, 216, 35), 443)), Verdict::Drop);
    }

    #[test]
    fn malformed_headers_hard_drop_on_output_only() {
        let tracker = seeded_tracker();
        let table = build(&policy(ALLOW_HTTPS_IP), &tracker, IpFamily::V4).unwrap();
        let short = PacketBuffer {
            family: IpFamily::V4,
            network_header: &[0x45, 0, 0],
            transport_header: &[],
            payload: &[],
        };
        assert_eq!(
            ProtocolMatcher { protocol: 17 }.matches(Hook::Output, &short),
            MatchResult::HARD_DROP
        );
        assert_eq!(table.evaluate(Hook::Output, &short), Verdict::Drop);
        assert_eq!(table.evaluate(Hook::Input, &short), Verdict::Accept);
        assert_eq!(table.evaluate(Hook::Prerouting, &short), Verdict::Accept);
    }

    #[test]
    fn ipv6_evaluation() {
        let tracker = seeded_tracker();
        let p = policy(
            r#"
version: "1.0"
rules:
  - name: v6
    action: allow
    priority: 1
    egress:
      ips: ["2001:db8::/32"]
"#,
        );
        let table = build(&p, &tracker, IpFamily::V6).unwrap();
        let src: std::net::Ipv6Addr = "fd00::3".parse().unwrap();
        let packet = |dst: std::net::Ipv6Addr| {
            let seg = TcpSegmentBuilder::syn(40000, 443, 1)
                .build_vec(src.into(), dst.into())
                .unwrap();
            Ipv6PacketBuilder {
                src,
                dst,
                next_header: usernet_packet::IPPROTO_TCP,
                hop_limit: 64,
                payload: &seg,
            }
            .build_vec()
            .unwrap()
        };
        assert_eq!(verdict(&table, &packet("2001:db8::1".parse().unwrap())), Verdict::Accept);
        assert_eq!(verdict(&table, &packet("2606:4700::1".parse().unwrap())), Verdict::Drop);
    }

    #[test]
    fn display_dumps_every_chain() {
        let tracker = seeded_tracker();
        let table = build(&policy(ALLOW_HTTPS_IP), &tracker, IpFamily::V4).unwrap();
        let dump = table.to_string();
        assert!(dump.starts_with("table ipv4\nchain input (underflow accept)\n    0: all -> accept\n"));
        assert!(dump.contains("chain output (underflow drop)\n    0: dns-snoop -> drop\n"));
        assert!(dump.contains("    2: proto tcp dst 192.168.127.1/32 -> accept\n"));
        assert!(dump.contains("    6: dns-resolved-only -> drop\n"));
    }
}

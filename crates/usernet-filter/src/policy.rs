//! Egress policy model, loader and validation.
//!
//! Policy files are parsed into loosely typed documents first so that validation can report
//! errors with rule names (a strict serde enum would fail before the rule name is known), then
//! converted into the typed [`Policy`].

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

pub const SUPPORTED_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortRangeError {
    #[error("invalid port range format")]
    Format,
    #[error("invalid start port: {0}")]
    InvalidStart(std::num::ParseIntError),
    #[error("invalid end port: {0}")]
    InvalidEnd(std::num::ParseIntError),
    #[error("invalid port: {0}")]
    InvalidPort(std::num::ParseIntError),
    #[error("start port {0} out of range (1-65535)")]
    StartOutOfRange(i64),
    #[error("end port {0} out of range (1-65535)")]
    EndOutOfRange(i64),
    #[error("port {0} out of range (1-65535)")]
    OutOfRange(i64),
    #[error("start port {start} greater than end port {end}")]
    Inverted { start: i64, end: i64 },
}

/// Inclusive destination port range. A single port has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

fn port_in_range(port: i64) -> Option<u16> {
    (1..=65535).contains(&port).then_some(port as u16)
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.contains('-') {
            let port: i64 = s.parse().map_err(PortRangeError::InvalidPort)?;
            let port = port_in_range(port).ok_or(PortRangeError::OutOfRange(port))?;
            return Ok(Self::single(port));
        }

        let mut parts = s.split('-');
        let (Some(start), Some(end), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(PortRangeError::Format);
        };
        let start: i64 = start.parse().map_err(PortRangeError::InvalidStart)?;
        let end: i64 = end.parse().map_err(PortRangeError::InvalidEnd)?;
        let start_port = port_in_range(start).ok_or(PortRangeError::StartOutOfRange(start))?;
        let end_port = port_in_range(end).ok_or(PortRangeError::EndOutOfRange(end))?;
        if start_port > end_port {
            return Err(PortRangeError::Inverted { start, end });
        }
        Ok(Self {
            start: start_port,
            end: end_port,
        })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Parses an address literal or CIDR. Bare addresses become host networks (/32 or /128).
pub fn parse_ip_or_cidr(s: &str) -> Option<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }
    s.parse::<IpAddr>().ok().map(IpNet::from)
}

fn format_ip_net(net: &IpNet) -> String {
    if net.prefix_len() == net.max_prefix_len() {
        net.addr().to_string()
    } else {
        net.to_string()
    }
}

/// What traffic a rule applies to. Every list empty means "all traffic".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyMatch {
    pub protocols: Vec<Protocol>,
    /// Lower-cased patterns: `example.com`, `*.example.com` or `*`.
    pub domains: Vec<String>,
    pub ips: Vec<IpNet>,
    pub ports: Vec<PortRange>,
}

impl PolicyMatch {
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
            && self.domains.is_empty()
            && self.ips.is_empty()
            && self.ports.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub name: String,
    pub action: Action,
    /// Lower values are evaluated first.
    pub priority: i64,
    pub egress: Option<PolicyMatch>,
}

impl PolicyRule {
    pub fn is_allow(&self) -> bool {
        self.action == Action::Allow
    }

    pub fn is_deny(&self) -> bool {
        self.action == Action::Deny
    }

    pub fn matches_all(&self) -> bool {
        self.egress.as_ref().map_or(true, PolicyMatch::is_empty)
    }
}

/// A validated policy with rules sorted by ascending priority (ties keep file order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub version: String,
    pub rules: Vec<PolicyRule>,
}

// On-disk representation.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub rules: Vec<RuleDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<MatchDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchDocument {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("version field is required")]
    MissingVersion,
    #[error("unsupported policy version: {0} (only '1.0' is supported)")]
    UnsupportedVersion(String),
    #[error("at least one rule is required")]
    NoRules,
    #[error("rule at index {0}: name is required")]
    MissingName(usize),
    #[error("duplicate rule name: {0}")]
    DuplicateName(String),
    #[error("rule '{rule}': action must be 'allow' or 'deny', got '{action}'")]
    InvalidAction { rule: String, action: String },
    #[error("rule '{rule}': invalid protocol '{protocol}' (must be tcp, udp, or icmp)")]
    InvalidProtocol { rule: String, protocol: String },
    #[error("rule '{rule}': invalid port specification '{spec}': {reason}")]
    InvalidPort {
        rule: String,
        spec: String,
        reason: PortRangeError,
    },
    #[error("rule '{rule}': invalid IP or CIDR '{value}': not a valid IP address or CIDR notation")]
    InvalidIp { rule: String, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy file: {0}")]
    Read(std::io::Error),
    #[error("failed to parse policy JSON: {0}")]
    Json(serde_json::Error),
    #[error("failed to parse policy YAML: {0}")]
    Yaml(serde_yaml::Error),
    #[error("failed to parse policy as YAML: {yaml}, or JSON: {json}")]
    Unrecognized {
        yaml: serde_yaml::Error,
        json: serde_json::Error,
    },
    #[error("invalid policy: {0}")]
    Invalid(ValidationError),
    #[error("failed to marshal policy to JSON: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write policy file: {0}")]
    Write(std::io::Error),
}

impl From<ValidationError> for PolicyError {
    fn from(err: ValidationError) -> Self {
        Self::Invalid(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFormat {
    Json,
    Yaml,
    /// YAML first, then JSON.
    Auto,
}

impl PolicyFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => Self::Json,
            Some("yaml" | "yml") => Self::Yaml,
            _ => Self::Auto,
        }
    }
}

/// Reads, validates and priority-sorts a policy file.
pub fn load_policy(path: impl AsRef<Path>) -> Result<Policy, PolicyError> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(PolicyError::Read)?;
    parse_policy(&data, PolicyFormat::from_path(path))
}

pub fn parse_policy(data: &str, format: PolicyFormat) -> Result<Policy, PolicyError> {
    let doc: PolicyDocument = match format {
        PolicyFormat::Json => serde_json::from_str(data).map_err(PolicyError::Json)?,
        PolicyFormat::Yaml => serde_yaml::from_str(data).map_err(PolicyError::Yaml)?,
        PolicyFormat::Auto => match serde_yaml::from_str(data) {
            Ok(doc) => doc,
            Err(yaml) => serde_json::from_str(data)
                .map_err(|json| PolicyError::Unrecognized { yaml, json })?,
        },
    };
    Ok(Policy::from_document(doc)?)
}

/// Writes `policy` as indented JSON.
pub fn save_policy_json(policy: &Policy, path: impl AsRef<Path>) -> Result<(), PolicyError> {
    let data =
        serde_json::to_string_pretty(&policy.to_document()).map_err(PolicyError::Serialize)?;
    std::fs::write(path, data).map_err(PolicyError::Write)
}

impl Policy {
    pub fn from_document(doc: PolicyDocument) -> Result<Self, ValidationError> {
        if doc.version.is_empty() {
            return Err(ValidationError::MissingVersion);
        }
        if doc.version != SUPPORTED_VERSION {
            return Err(ValidationError::UnsupportedVersion(doc.version));
        }
        if doc.rules.is_empty() {
            return Err(ValidationError::NoRules);
        }

        let mut names = HashSet::new();
        let mut rules = Vec::with_capacity(doc.rules.len());
        for (idx, rule) in doc.rules.into_iter().enumerate() {
            if rule.name.is_empty() {
                return Err(ValidationError::MissingName(idx));
            }
            if !names.insert(rule.name.clone()) {
                return Err(ValidationError::DuplicateName(rule.name));
            }
            rules.push(validate_rule(rule)?);
        }

        rules.sort_by_key(|rule| rule.priority);
        Ok(Self {
            version: doc.version,
            rules,
        })
    }

    pub fn to_document(&self) -> PolicyDocument {
        PolicyDocument {
            version: self.version.clone(),
            rules: self
                .rules
                .iter()
                .map(|rule| RuleDocument {
                    name: rule.name.clone(),
                    action: rule.action.to_string(),
                    priority: rule.priority,
                    egress: rule.egress.as_ref().map(|m| MatchDocument {
                        protocols: m.protocols.iter().map(ToString::to_string).collect(),
                        domains: m.domains.clone(),
                        ips: m.ips.iter().map(format_ip_net).collect(),
                        ports: m.ports.iter().map(ToString::to_string).collect(),
                    }),
                })
                .collect(),
        }
    }
}

fn validate_rule(rule: RuleDocument) -> Result<PolicyRule, ValidationError> {
    let Ok(action) = rule.action.parse::<Action>() else {
        return Err(ValidationError::InvalidAction {
            rule: rule.name,
            action: rule.action,
        });
    };

    let egress = match rule.egress {
        None => None,
        Some(m) => Some(validate_match(&rule.name, m)?),
    };

    Ok(PolicyRule {
        name: rule.name,
        action,
        priority: rule.priority,
        egress,
    })
}

fn validate_match(rule: &str, m: MatchDocument) -> Result<PolicyMatch, ValidationError> {
    let protocols = m
        .protocols
        .into_iter()
        .map(|p| {
            p.parse::<Protocol>()
                .map_err(|()| ValidationError::InvalidProtocol {
                    rule: rule.to_owned(),
                    protocol: p,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ports = m
        .ports
        .into_iter()
        .map(|spec| match spec.parse::<PortRange>() {
            Ok(range) => Ok(range),
            Err(reason) => Err(ValidationError::InvalidPort {
                rule: rule.to_owned(),
                spec,
                reason,
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ips = m
        .ips
        .into_iter()
        .map(|value| {
            parse_ip_or_cidr(&value).ok_or_else(|| ValidationError::InvalidIp {
                rule: rule.to_owned(),
                value,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let domains = m
        .domains
        .into_iter()
        .map(|domain| domain.to_ascii_lowercase())
        .collect();

    Ok(PolicyMatch {
        protocols,
        domains,
        ips,
        ports,
    })
}

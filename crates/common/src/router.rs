use crate::RouterIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Directory flags attached to a relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterFlags {
    pub fast: bool,
    pub stable: bool,
    pub guard: bool,
    pub exit: bool,
    pub valid: bool,
    pub running: bool,
    pub hs_dir: bool,
    pub bad_exit: bool,
}

impl RouterFlags {
    /// Flags of an ordinary middle relay
    pub fn relay() -> Self {
        Self {
            fast: true,
            stable: true,
            valid: true,
            running: true,
            ..Self::default()
        }
    }

    pub fn with_guard(mut self) -> Self {
        self.guard = true;
        self
    }

    pub fn with_exit(mut self) -> Self {
        self.exit = true;
        self
    }

    pub fn is_usable(&self) -> bool {
        self.valid && self.running
    }

    pub fn is_guard_capable(&self) -> bool {
        self.guard && self.is_usable()
    }
}

/// Information about a relay as published by the directory.
///
/// The engine never mutates descriptors except through the directory's
/// ranking punishment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterDescriptor {
    pub identity: RouterIdentity,
    pub nickname: String,
    pub address: IpAddr,
    pub or_port: u16,
    #[serde(default)]
    pub flags: RouterFlags,
    /// Advertised bandwidth in bytes per second
    #[serde(default)]
    pub bandwidth: u64,
    /// Bandwidth-derived desirability used for weighted selection
    #[serde(default = "default_ranking")]
    pub ranking: f64,
    #[serde(default)]
    pub exit_policy: ExitPolicy,
    /// Relays this one declares as family
    #[serde(default)]
    pub family: BTreeSet<RouterIdentity>,
    #[serde(default)]
    pub country: Option<String>,
}

fn default_ranking() -> f64 {
    1.0
}

impl RouterDescriptor {
    pub fn new(identity: RouterIdentity, nickname: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            identity,
            nickname: nickname.into(),
            address: addr.ip(),
            or_port: addr.port(),
            flags: RouterFlags::relay(),
            bandwidth: 0,
            ranking: default_ranking(),
            exit_policy: ExitPolicy::reject_all(),
            family: BTreeSet::new(),
            country: None,
        }
    }

    pub fn with_flags(mut self, flags: RouterFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_exit_policy(mut self, policy: ExitPolicy) -> Self {
        self.exit_policy = policy;
        self
    }

    pub fn with_ranking(mut self, ranking: f64) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn with_family(mut self, family: impl IntoIterator<Item = RouterIdentity>) -> Self {
        self.family.extend(family);
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    /// Whether this relay will carry traffic to `target`.
    ///
    /// `address` is `None` when the destination is a hostname the exit resolves.
    pub fn allows_exit_to(&self, address: Option<IpAddr>, port: u16) -> bool {
        self.flags.exit && !self.flags.bad_exit && self.exit_policy.allows(address, port)
    }
}

impl fmt::Display for RouterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{} at {}", self.identity, self.nickname, self.socket_addr())
    }
}

/// Address pattern of an exit rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPattern {
    Any,
    Prefix { network: IpAddr, bits: u8 },
}

impl AddressPattern {
    fn matches(&self, address: IpAddr) -> bool {
        match (self, address) {
            (Self::Any, _) => true,
            (Self::Prefix { network: IpAddr::V4(net), bits }, IpAddr::V4(addr)) => {
                let mask = prefix_mask_v4(*bits);
                u32::from(*net) & mask == u32::from(addr) & mask
            }
            (Self::Prefix { network: IpAddr::V6(net), bits }, IpAddr::V6(addr)) => {
                let mask = prefix_mask_v6(*bits);
                u128::from(*net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_v4(bits: u8) -> u32 {
    if bits == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(bits.min(32)))
    }
}

fn prefix_mask_v6(bits: u8) -> u128 {
    if bits == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(bits.min(128)))
    }
}

/// One `accept`/`reject` line of an exit policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRule {
    pub accept: bool,
    pub address: AddressPattern,
    pub port_min: u16,
    pub port_max: u16,
}

impl ExitRule {
    fn matches_port(&self, port: u16) -> bool {
        (self.port_min..=self.port_max).contains(&port)
    }
}

impl FromStr for ExitRule {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let accept = match parts.next() {
            Some("accept") => true,
            Some("reject") => false,
            other => return Err(format!("bad exit rule keyword: {:?}", other)),
        };
        let target = parts.next().ok_or_else(|| format!("missing target in {:?}", line))?;
        let (addr, ports) = target
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in {:?}", line))?;

        let address = if addr == "*" {
            AddressPattern::Any
        } else {
            let (network, bits) = match addr.split_once('/') {
                Some((net, bits)) => (
                    net.trim_matches(|c| c == '[' || c == ']'),
                    Some(bits.parse::<u8>().map_err(|e| e.to_string())?),
                ),
                None => (addr.trim_matches(|c| c == '[' || c == ']'), None),
            };
            let network: IpAddr = network.parse().map_err(|e| format!("{}: {}", network, e))?;
            let bits = bits.unwrap_or(if network.is_ipv4() { 32 } else { 128 });
            AddressPattern::Prefix { network, bits }
        };

        let (port_min, port_max) = if ports == "*" {
            (1, u16::MAX)
        } else if let Some((lo, hi)) = ports.split_once('-') {
            (
                lo.parse().map_err(|_| format!("bad port {:?}", lo))?,
                hi.parse().map_err(|_| format!("bad port {:?}", hi))?,
            )
        } else {
            let port: u16 = ports.parse().map_err(|_| format!("bad port {:?}", ports))?;
            (port, port)
        };

        Ok(Self {
            accept,
            address,
            port_min,
            port_max,
        })
    }
}

impl fmt::Display for ExitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = if self.accept { "accept" } else { "reject" };
        let addr = match self.address {
            AddressPattern::Any => "*".to_string(),
            AddressPattern::Prefix { network: IpAddr::V6(net), bits } => format!("[{}]/{}", net, bits),
            AddressPattern::Prefix { network, bits } => format!("{}/{}", network, bits),
        };
        if self.port_min == 1 && self.port_max == u16::MAX {
            write!(f, "{} {}:*", keyword, addr)
        } else if self.port_min == self.port_max {
            write!(f, "{} {}:{}", keyword, addr, self.port_min)
        } else {
            write!(f, "{} {}:{}-{}", keyword, addr, self.port_min, self.port_max)
        }
    }
}

/// Ordered exit rules; the first matching rule wins and an exhausted
/// policy rejects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ExitPolicy {
    rules: Vec<ExitRule>,
}

impl ExitPolicy {
    pub fn reject_all() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn accept_all() -> Self {
        Self {
            rules: vec![ExitRule {
                accept: true,
                address: AddressPattern::Any,
                port_min: 1,
                port_max: u16::MAX,
            }],
        }
    }

    pub fn parse<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Self, String> {
        let rules = lines
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<ExitRule>, String>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[ExitRule] {
        &self.rules
    }

    /// Evaluate the policy for a destination.
    ///
    /// With an unknown address only wildcard-address rules are consulted.
    pub fn allows(&self, address: Option<IpAddr>, port: u16) -> bool {
        for rule in &self.rules {
            if !rule.matches_port(port) {
                continue;
            }
            let address_match = match (address, rule.address) {
                (_, AddressPattern::Any) => true,
                (Some(addr), pattern) => pattern.matches(addr),
                (None, AddressPattern::Prefix { .. }) => false,
            };
            if address_match {
                return rule.accept;
            }
        }
        false
    }

    /// Whether the policy accepts at least one port on some address
    pub fn accepts_anything(&self) -> bool {
        self.rules.iter().any(|rule| rule.accept)
    }
}

impl TryFrom<Vec<String>> for ExitPolicy {
    type Error = String;

    fn try_from(lines: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse(lines.iter().map(String::as_str))
    }
}

impl From<ExitPolicy> for Vec<String> {
    fn from(policy: ExitPolicy) -> Self {
        policy.rules.iter().map(ToString::to_string).collect()
    }
}

//! Membership engine tunables
//!
//! Each tunable accepts a bare integer in its own unit or a duration string
//! such as `15s` or `500ms`. Anything unparsable falls back to the default.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;

use super::Settings;

/// Which tunables `apply_settings` may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Initial build: everything, including identity and bind address
    Startup,
    /// Live patch: identity and bind address stay as they are
    Live,
}

#[derive(Debug, Clone, Copy)]
enum Unit {
    Seconds,
    Millis,
}

/// Typed tunables handed to the membership engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberlistConfig {
    pub name: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub advertise_addr: String,
    pub advertise_port: u16,
    /// How long a dead peer is still gossiped to
    pub dead_timeout: Duration,
    /// Full push/pull state sync interval
    pub push_pull_interval: Duration,
    /// How long before a dead node's name may be reclaimed
    pub reclaim_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub suspicion_mult: u32,
    pub retransmit_mult: u32,
    pub gossip_nodes: u32,
    pub gossip_interval: Duration,
    /// Dynamic weight recompute interval; zero disables it
    pub weight_interval: Duration,
    pub tcp_timeout: Duration,
    pub join_timeout: Duration,
    /// Networks peers may connect from; empty allows all
    pub cidrs_allowed: Vec<IpNet>,
    pub log_level: String,
    /// Static weight override; 0 = none
    pub weight: u32,
}

impl Default for MemberlistConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7946,
            advertise_addr: "127.0.0.1".to_string(),
            advertise_port: 7946,
            dead_timeout: Duration::from_secs(60),
            push_pull_interval: Duration::from_secs(60),
            reclaim_timeout: Duration::from_secs(3),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            suspicion_mult: 6,
            retransmit_mult: 4,
            gossip_nodes: 4,
            gossip_interval: Duration::from_millis(500),
            weight_interval: Duration::from_secs(5),
            tcp_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
            cidrs_allowed: Vec::new(),
            log_level: "info".to_string(),
            weight: 0,
        }
    }
}

fn default_node_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "node".to_string());
    format!("{host}-{}", nanoid::nanoid!(6))
}

/// Parse `key` with `FromStr`, falling back to `default`
pub(crate) fn parse_or<T>(settings: &Settings, key: &str, default: T) -> T
where
    T: FromStr,
{
    match settings.get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = raw, "Ignoring malformed setting");
            default
        }),
    }
}

fn duration_or(settings: &Settings, key: &str, unit: Unit, default: Duration) -> Duration {
    let Some(raw) = settings.get(key) else {
        return default;
    };
    if let Ok(n) = raw.parse::<u64>() {
        return match unit {
            Unit::Seconds => Duration::from_secs(n),
            Unit::Millis => Duration::from_millis(n),
        };
    }
    humantime::parse_duration(raw).unwrap_or_else(|_| {
        tracing::warn!(key, value = raw, "Ignoring malformed duration");
        default
    })
}

/// A CIDR, or a bare address as a single-host network
fn parse_net(s: &str) -> Option<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }
    let ip = s.parse::<IpAddr>().ok()?;
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(ip, prefix).ok()
}

fn cidrs_or(settings: &Settings, key: &str) -> Vec<IpNet> {
    let Some(raw) = settings.get(key) else {
        return Vec::new();
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let net = parse_net(s);
            if net.is_none() {
                tracing::warn!(key, value = s, "Ignoring malformed CIDR");
            }
            net
        })
        .collect()
}

fn log_level_or(settings: &Settings, key: &str, default: &str) -> String {
    match settings.get(key) {
        Some(level) if crate::logging::parse_log_level(level).is_ok() => level.to_lowercase(),
        Some(level) => {
            tracing::warn!(key, value = level, "Ignoring unknown log level");
            default.to_string()
        }
        None => default.to_string(),
    }
}

impl MemberlistConfig {
    /// Build from settings on top of the defaults
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let mut config = Self::default();
        config.apply_settings(settings, ApplyMode::Startup);
        config
    }

    /// Re-derive every tunable from `settings`
    ///
    /// In [`ApplyMode::Live`] the node name and the bind/advertise address and
    /// port are left untouched; changing them needs a new engine.
    pub fn apply_settings(&mut self, settings: &Settings, mode: ApplyMode) {
        let d = Self {
            name: self.name.clone(),
            ..Self::default()
        };

        if mode == ApplyMode::Startup {
            if let Some(name) = settings.get("mem_name") {
                self.name = name.to_string();
            }
            self.bind_addr = settings.get("mem_host").unwrap_or(d.bind_addr.as_str()).to_string();
            self.bind_port = parse_or(settings, "mem_port", d.bind_port);

            let fallback_addr = match self.bind_addr.parse::<IpAddr>() {
                Ok(ip) if ip.is_unspecified() => d.advertise_addr.clone(),
                _ => self.bind_addr.clone(),
            };
            self.advertise_addr = settings
                .get("mem_advertise_host")
                .map_or(fallback_addr, str::to_string);
            self.advertise_port = parse_or(settings, "mem_advertise_port", self.bind_port);
        }

        self.dead_timeout =
            duration_or(settings, "mem_dead_timeout", Unit::Seconds, d.dead_timeout);
        self.push_pull_interval =
            duration_or(settings, "mem_sync_interval", Unit::Seconds, d.push_pull_interval);
        self.reclaim_timeout =
            duration_or(settings, "mem_reclaim_timeout", Unit::Seconds, d.reclaim_timeout);
        self.probe_interval =
            duration_or(settings, "mem_probe_interval", Unit::Seconds, d.probe_interval);
        self.probe_timeout =
            duration_or(settings, "mem_probe_timeout", Unit::Seconds, d.probe_timeout);
        self.suspicion_mult = parse_or(settings, "mem_suspicion_mult", d.suspicion_mult);
        self.retransmit_mult = parse_or(settings, "mem_retransmit_mult", d.retransmit_mult);
        self.gossip_nodes = parse_or(settings, "mem_gossip_nodes", d.gossip_nodes);
        self.gossip_interval =
            duration_or(settings, "mem_gossip_interval", Unit::Millis, d.gossip_interval);
        self.weight_interval =
            duration_or(settings, "mem_weight_interval", Unit::Seconds, d.weight_interval);
        self.tcp_timeout = duration_or(settings, "mem_tcp_timeout", Unit::Seconds, d.tcp_timeout);
        self.join_timeout =
            duration_or(settings, "mem_join_timeout", Unit::Seconds, d.join_timeout);
        self.cidrs_allowed = cidrs_or(settings, "mem_cidrs_allowed");
        self.log_level = log_level_or(settings, "mem_log_level", &d.log_level);
        self.weight = parse_or(settings, "mem_weight", d.weight);

        // Dynamic weight is always discarded when an override is set
        if self.weight > 0 {
            self.weight_interval = Duration::ZERO;
        }
    }

    /// Whether a peer at `ip` may talk to this node
    #[must_use]
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.cidrs_allowed.is_empty() || self.cidrs_allowed.iter().any(|net| net.contains(&ip))
    }

    /// `advertise_addr:advertise_port`
    #[must_use]
    pub fn advertise_address(&self) -> String {
        match self.advertise_addr.parse::<IpAddr>() {
            Ok(ip) => std::net::SocketAddr::new(ip, self.advertise_port).to_string(),
            Err(_) => format!("{}:{}", self.advertise_addr, self.advertise_port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_absent() {
        let config = MemberlistConfig::from_settings(&Settings::default());
        let d = MemberlistConfig::default();
        assert_eq!(config.dead_timeout, d.dead_timeout);
        assert_eq!(config.gossip_interval, Duration::from_millis(500));
        assert_eq!(config.bind_port, 7946);
        assert_eq!(config.advertise_addr, "127.0.0.1");
        assert!(!config.name.is_empty());
    }

    #[test]
    fn test_integer_uses_tunable_unit() {
        let settings = Settings::from_pairs([
            ("mem_dead_timeout", "30"),
            ("mem_gossip_interval", "200"),
            ("mem_probe_interval", "2"),
        ]);
        let config = MemberlistConfig::from_settings(&settings);
        assert_eq!(config.dead_timeout, Duration::from_secs(30));
        assert_eq!(config.gossip_interval, Duration::from_millis(200));
        assert_eq!(config.probe_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_duration_strings() {
        let settings = Settings::from_pairs([
            ("mem_dead_timeout", "2m"),
            ("mem_gossip_interval", "1s"),
            ("mem_tcp_timeout", "750ms"),
        ]);
        let config = MemberlistConfig::from_settings(&settings);
        assert_eq!(config.dead_timeout, Duration::from_secs(120));
        assert_eq!(config.gossip_interval, Duration::from_secs(1));
        assert_eq!(config.tcp_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let settings = Settings::from_pairs([
            ("mem_dead_timeout", "soon"),
            ("mem_gossip_nodes", "-3"),
            ("mem_port", "99999"),
            ("mem_log_level", "loud"),
        ]);
        let config = MemberlistConfig::from_settings(&settings);
        let d = MemberlistConfig::default();
        assert_eq!(config.dead_timeout, d.dead_timeout);
        assert_eq!(config.gossip_nodes, d.gossip_nodes);
        assert_eq!(config.bind_port, d.bind_port);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_weight_override_disables_weight_interval() {
        let settings = Settings::from_pairs([("mem_weight", "5"), ("mem_weight_interval", "10")]);
        let config = MemberlistConfig::from_settings(&settings);
        assert_eq!(config.weight, 5);
        assert_eq!(config.weight_interval, Duration::ZERO);

        let settings = Settings::from_pairs([("mem_weight_interval", "10")]);
        let config = MemberlistConfig::from_settings(&settings);
        assert_eq!(config.weight_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_advertise_defaults() {
        let settings = Settings::from_pairs([("mem_host", "10.2.0.5"), ("mem_port", "8000")]);
        let config = MemberlistConfig::from_settings(&settings);
        assert_eq!(config.advertise_addr, "10.2.0.5");
        assert_eq!(config.advertise_port, 8000);
        assert_eq!(config.advertise_address(), "10.2.0.5:8000");
    }

    #[test]
    fn test_live_apply_keeps_bind_address() {
        let mut config = MemberlistConfig::from_settings(&Settings::from_pairs([
            ("mem_name", "node-a"),
            ("mem_port", "8000"),
        ]));
        let live = Settings::from_pairs([
            ("mem_name", "node-b"),
            ("mem_port", "9000"),
            ("mem_host", "10.9.9.9"),
            ("mem_gossip_nodes", "7"),
        ]);
        config.apply_settings(&live, ApplyMode::Live);
        assert_eq!(config.name, "node-a");
        assert_eq!(config.bind_port, 8000);
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.gossip_nodes, 7);
    }

    #[test]
    fn test_cidrs() {
        let settings =
            Settings::from_pairs([("mem_cidrs_allowed", "10.0.0.0/8, bogus, 192.168.1.7")]);
        let config = MemberlistConfig::from_settings(&settings);
        assert_eq!(config.cidrs_allowed.len(), 2);
        assert!(config.is_allowed("10.3.4.5".parse().unwrap()));
        assert!(config.is_allowed("192.168.1.7".parse().unwrap()));
        assert!(!config.is_allowed("192.168.1.8".parse().unwrap()));

        let open = MemberlistConfig::from_settings(&Settings::default());
        assert!(open.is_allowed("8.8.8.8".parse().unwrap()));
    }
}

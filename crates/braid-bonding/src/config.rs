use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

use braid_transport::codec::{FecError, FecKind, FecParams};

use crate::scheduler::qos::{
    parse_protocol, IpPrefix, MatchCriteria, PortRange, QosAction, QosRule, RuleSet,
    DEFAULT_PRIORITY,
};

pub const CONFIG_VERSION: u32 = 1;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Configuration problems. Any of these aborts startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),

    #[error("duplicate link id {0}")]
    DuplicateLinkId(usize),

    #[error("duplicate link name '{0}'")]
    DuplicateLinkName(String),

    #[error("link {link}: {reason}")]
    InvalidLink { link: String, reason: String },

    #[error("QoS rule '{rule}' references unknown link '{link}'")]
    UnknownLink { rule: String, link: String },

    #[error("QoS rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error(transparent)]
    InvalidFec(#[from] FecError),

    #[error("{field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

// ─── Input (permissive, as parsed from TOML) ─────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BondingConfigInput {
    pub version: u32,
    pub links: Vec<LinkConfigInput>,
    pub scheduler: SchedulerConfigInput,
    pub qos: QosConfigInput,
    pub fec: FecConfigInput,
    pub reorder: ReorderConfigInput,
    pub failover: FailoverConfigInput,
    pub monitor: MonitorConfigInput,
    pub pipeline: PipelineConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkConfigInput {
    pub id: Option<usize>,
    pub name: Option<String>,
    pub interface: Option<String>,
    pub peer: Option<String>,
    pub probe_target: Option<String>,
    pub weight: Option<f64>,
    pub max_bandwidth_bps: Option<u64>,
    pub failover_group: Option<String>,
    pub probes: Option<Vec<ProbeKind>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigInput {
    pub algorithm: Option<SchedulingMode>,
    pub batch_size: Option<usize>,
    pub queue_bound: Option<usize>,
    pub queue_wait_ms: Option<u64>,
    pub link_queue_depth: Option<usize>,
    pub ingress_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QosConfigInput {
    pub rules: Vec<QosRuleInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QosRuleInput {
    pub name: String,
    pub priority: Option<u8>,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub protocol: Option<String>,
    pub src_ports: Option<PortRange>,
    pub dst_ports: Option<PortRange>,
    /// Older spelling of `dst_ports`.
    pub port_range: Option<PortRange>,
    pub dscp: Option<u8>,
    pub link_preference: Vec<String>,
    pub bandwidth_ceiling_bps: Option<u64>,
    pub latency_ceiling_ms: Option<u64>,
    pub loss_ceiling: Option<f64>,
    pub fec: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FecConfigInput {
    pub kind: Option<FecKind>,
    pub data_shards: Option<usize>,
    pub parity_shards: Option<usize>,
    pub enabled: Option<bool>,
    pub assembly_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReorderConfigInput {
    pub capacity_packets: Option<usize>,
    pub capacity_bytes: Option<usize>,
    pub max_age_ms: Option<u64>,
    pub min_hold_ms: Option<u64>,
    pub jitter_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FailoverConfigInput {
    pub failure_threshold: Option<u32>,
    pub down_threshold: Option<u32>,
    pub recovery_threshold: Option<u32>,
    pub loss_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitorConfigInput {
    pub enabled: Option<bool>,
    pub interval_ms: Option<u64>,
    pub icmp_timeout_ms: Option<u64>,
    pub udp_timeout_ms: Option<u64>,
    pub loss_window: Option<usize>,
    pub ewma_alpha: Option<f64>,
    pub bandwidth_every: Option<u32>,
    pub burst_packets: Option<usize>,
    pub burst_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfigInput {
    pub shutdown_grace_ms: Option<u64>,
    pub receive_capacity: Option<usize>,
    pub egress_capacity: Option<usize>,
}

// ─── Resolved configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Icmp,
    Udp,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Icmp => "icmp",
            ProbeKind::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    #[default]
    WeightedRoundRobin,
    RoundRobin,
    LeastLoaded,
}

impl SchedulingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingMode::WeightedRoundRobin => "weighted_round_robin",
            SchedulingMode::RoundRobin => "round_robin",
            SchedulingMode::LeastLoaded => "least_loaded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub id: usize,
    pub name: String,
    pub interface: Option<String>,
    pub peer: Option<SocketAddr>,
    pub probe_target: Option<SocketAddr>,
    pub weight: f64,
    /// 0 means unknown.
    pub max_bandwidth_bps: u64,
    pub failover_group: Option<String>,
    pub probes: Vec<ProbeKind>,
}

impl LinkConfig {
    /// Minimal link for tests and programmatic setups.
    pub fn new(id: usize, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            interface: None,
            peer: None,
            probe_target: None,
            weight: 1.0,
            max_bandwidth_bps: 0,
            failover_group: None,
            probes: vec![ProbeKind::Udp],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mode: SchedulingMode,
    /// Packets drawn per scheduling pass.
    pub batch_size: usize,
    /// Pending queue bound while no link is eligible.
    pub queue_bound: usize,
    pub queue_wait: Duration,
    /// Per-link transmit channel depth.
    pub link_queue_depth: usize,
    /// Ingress ring capacity.
    pub ingress_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulingMode::WeightedRoundRobin,
            batch_size: 64,
            queue_bound: 10_000,
            queue_wait: Duration::from_millis(250),
            link_queue_depth: 1024,
            ingress_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FecConfig {
    pub params: FecParams,
    /// FEC for classes without an explicit flag.
    pub enabled: bool,
    /// How long partial blocks wait for more shards on the receive side.
    pub assembly_timeout: Duration,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            params: FecParams::default(),
            enabled: false,
            assembly_timeout: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReorderConfig {
    pub capacity_packets: usize,
    pub capacity_bytes: usize,
    pub max_age: Duration,
    pub min_hold: Duration,
    pub jitter_multiplier: f64,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            capacity_packets: 1024,
            capacity_bytes: 4 * 1024 * 1024,
            max_age: Duration::from_millis(100),
            min_hold: Duration::from_millis(10),
            jitter_multiplier: 4.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub failure_threshold: u32,
    pub down_threshold: u32,
    pub recovery_threshold: u32,
    pub loss_threshold: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            down_threshold: 6,
            recovery_threshold: 5,
            loss_threshold: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub icmp_timeout: Duration,
    pub udp_timeout: Duration,
    /// Probes kept for the loss ratio.
    pub loss_window: usize,
    pub ewma_alpha: f64,
    /// Run a bandwidth burst every this many cycles; 0 disables.
    pub bandwidth_every: u32,
    pub burst_packets: usize,
    pub burst_size: usize,
}

impl MonitorConfig {
    pub fn timeout_for(&self, kind: ProbeKind) -> Duration {
        match kind {
            ProbeKind::Icmp => self.icmp_timeout,
            ProbeKind::Udp => self.udp_timeout,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            icmp_timeout: Duration::from_secs(1),
            udp_timeout: Duration::from_secs(2),
            loss_window: 20,
            ewma_alpha: 0.125,
            bandwidth_every: 12,
            burst_packets: 16,
            burst_size: 1200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub shutdown_grace: Duration,
    pub receive_capacity: usize,
    pub egress_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_millis(500),
            receive_capacity: 4096,
            egress_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BondingConfig {
    pub version: u32,
    pub links: Vec<LinkConfig>,
    pub scheduler: SchedulerConfig,
    pub qos: RuleSet,
    pub fec: FecConfig,
    pub reorder: ReorderConfig,
    pub failover: FailoverConfig,
    pub monitor: MonitorConfig,
    pub pipeline: PipelineConfig,
}

impl Default for BondingConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            links: Vec::new(),
            scheduler: SchedulerConfig::default(),
            qos: RuleSet::empty(),
            fec: FecConfig::default(),
            reorder: ReorderConfig::default(),
            failover: FailoverConfig::default(),
            monitor: MonitorConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

// ─── Resolution ──────────────────────────────────────────────────────────────

impl BondingConfigInput {
    pub fn resolve(self) -> Result<BondingConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let links = resolve_links(self.links)?;
        let by_name: HashMap<&str, usize> =
            links.iter().map(|l| (l.name.as_str(), l.id)).collect();
        let rules = self
            .qos
            .rules
            .into_iter()
            .map(|r| r.resolve(&by_name))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BondingConfig {
            version,
            scheduler: self.scheduler.resolve()?,
            qos: RuleSet::new(rules),
            fec: self.fec.resolve()?,
            reorder: self.reorder.resolve()?,
            failover: self.failover.resolve()?,
            monitor: self.monitor.resolve()?,
            pipeline: self.pipeline.resolve()?,
            links,
        })
    }
}

fn resolve_links(input: Vec<LinkConfigInput>) -> Result<Vec<LinkConfig>, ConfigError> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    let mut out = Vec::with_capacity(input.len());

    for (idx, link) in input.into_iter().enumerate() {
        let id = link.id.unwrap_or(idx);
        if !ids.insert(id) {
            return Err(ConfigError::DuplicateLinkId(id));
        }
        let name = link
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("link{id}"));
        if !names.insert(name.clone()) {
            return Err(ConfigError::DuplicateLinkName(name));
        }

        let bad = |reason: String| ConfigError::InvalidLink {
            link: name.clone(),
            reason,
        };
        let parse_addr = |field: &str, v: Option<String>| -> Result<Option<SocketAddr>, ConfigError> {
            v.map(|s| {
                s.trim()
                    .parse::<SocketAddr>()
                    .map_err(|_| bad(format!("{field} '{s}' is not an ip:port address")))
            })
            .transpose()
        };
        let peer = parse_addr("peer", link.peer)?;
        let probe_target = parse_addr("probe_target", link.probe_target)?;

        let weight = link.weight.unwrap_or(1.0);
        if !weight.is_finite() || weight <= 0.0 {
            return Err(bad(format!("weight must be positive, got {weight}")));
        }

        let interface = link
            .interface
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty());
        let failover_group = link
            .failover_group
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty());
        let mut probes = link.probes.unwrap_or_else(|| vec![ProbeKind::Udp]);
        // First occurrence wins; probe order is kept.
        let mut seen = HashSet::new();
        probes.retain(|kind| seen.insert(*kind));

        out.push(LinkConfig {
            id,
            name,
            interface,
            peer,
            probe_target,
            weight,
            max_bandwidth_bps: link.max_bandwidth_bps.unwrap_or(0),
            failover_group,
            probes,
        });
    }
    Ok(out)
}

impl QosRuleInput {
    fn resolve(self, links: &HashMap<&str, usize>) -> Result<QosRule, ConfigError> {
        let name = self.name.trim().to_string();
        let bad = |reason: String| ConfigError::InvalidRule {
            rule: name.clone(),
            reason,
        };
        if name.is_empty() {
            return Err(ConfigError::InvalidRule {
                rule: "<unnamed>".into(),
                reason: "rules need a name".into(),
            });
        }

        let prefix = |v: Option<String>| -> Result<Option<IpPrefix>, ConfigError> {
            v.map(|s| s.parse::<IpPrefix>().map_err(&bad))
                .transpose()
        };
        let src = prefix(self.src)?;
        let dst = prefix(self.dst)?;
        let protocol = self
            .protocol
            .map(|p| parse_protocol(&p).ok_or_else(|| bad(format!("unknown protocol '{p}'"))))
            .transpose()?;

        if self.dst_ports.is_some() && self.port_range.is_some() {
            return Err(bad("set either dst_ports or port_range, not both".into()));
        }
        let dst_ports = self.dst_ports.or(self.port_range);
        for range in [self.src_ports, dst_ports].into_iter().flatten() {
            if range.start > range.end {
                return Err(bad(format!(
                    "port range {}-{} is inverted",
                    range.start, range.end
                )));
            }
        }
        if let Some(dscp) = self.dscp {
            if dscp > 63 {
                return Err(bad(format!("dscp {dscp} is out of range 0-63")));
            }
        }
        if let Some(loss) = self.loss_ceiling {
            if !(0.0..=1.0).contains(&loss) {
                return Err(bad(format!("loss_ceiling {loss} is outside 0.0-1.0")));
            }
        }
        if self.bandwidth_ceiling_bps == Some(0) {
            return Err(bad("bandwidth_ceiling_bps must be positive".into()));
        }

        let link_preference = self
            .link_preference
            .iter()
            .map(|l| {
                links
                    .get(l.trim())
                    .copied()
                    .ok_or_else(|| ConfigError::UnknownLink {
                        rule: name.clone(),
                        link: l.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(QosRule {
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            criteria: MatchCriteria {
                src,
                dst,
                protocol,
                src_ports: self.src_ports,
                dst_ports,
                dscp: self.dscp,
            },
            action: QosAction {
                link_preference,
                bandwidth_ceiling_bps: self.bandwidth_ceiling_bps,
                latency_ceiling: self.latency_ceiling_ms.map(Duration::from_millis),
                loss_ceiling: self.loss_ceiling,
                fec: self.fec,
            },
            name,
        })
    }
}

impl SchedulerConfigInput {
    fn resolve(self) -> Result<SchedulerConfig, ConfigError> {
        let d = SchedulerConfig::default();
        let cfg = SchedulerConfig {
            mode: self.algorithm.unwrap_or(d.mode),
            batch_size: self.batch_size.unwrap_or(d.batch_size),
            queue_bound: self.queue_bound.unwrap_or(d.queue_bound),
            queue_wait: self
                .queue_wait_ms
                .map(Duration::from_millis)
                .unwrap_or(d.queue_wait),
            link_queue_depth: self.link_queue_depth.unwrap_or(d.link_queue_depth),
            ingress_capacity: self.ingress_capacity.unwrap_or(d.ingress_capacity),
        };
        if cfg.batch_size == 0 {
            return Err(invalid("scheduler.batch_size", "must be at least 1"));
        }
        if cfg.link_queue_depth == 0 || cfg.ingress_capacity == 0 {
            return Err(invalid("scheduler", "queue depths must be at least 1"));
        }
        Ok(cfg)
    }
}

impl FecConfigInput {
    fn resolve(self) -> Result<FecConfig, ConfigError> {
        let d = FecConfig::default();
        let params = FecParams::new(
            self.kind.unwrap_or(d.params.kind),
            self.data_shards.unwrap_or(d.params.data_shards),
            self.parity_shards.unwrap_or(d.params.parity_shards),
        );
        params.validate()?;
        Ok(FecConfig {
            params,
            enabled: self.enabled.unwrap_or(d.enabled),
            assembly_timeout: self
                .assembly_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.assembly_timeout),
        })
    }
}

impl ReorderConfigInput {
    fn resolve(self) -> Result<ReorderConfig, ConfigError> {
        let d = ReorderConfig::default();
        let cfg = ReorderConfig {
            capacity_packets: self.capacity_packets.unwrap_or(d.capacity_packets),
            capacity_bytes: self.capacity_bytes.unwrap_or(d.capacity_bytes),
            max_age: self.max_age_ms.map(Duration::from_millis).unwrap_or(d.max_age),
            min_hold: self
                .min_hold_ms
                .map(Duration::from_millis)
                .unwrap_or(d.min_hold),
            jitter_multiplier: self.jitter_multiplier.unwrap_or(d.jitter_multiplier),
        };
        if cfg.capacity_packets == 0 || cfg.capacity_bytes == 0 {
            return Err(invalid("reorder", "capacities must be at least 1"));
        }
        if cfg.min_hold > cfg.max_age {
            return Err(invalid("reorder.min_hold_ms", "must not exceed max_age_ms"));
        }
        if !cfg.jitter_multiplier.is_finite() || cfg.jitter_multiplier < 0.0 {
            return Err(invalid("reorder.jitter_multiplier", "must be a non-negative number"));
        }
        Ok(cfg)
    }
}

impl FailoverConfigInput {
    fn resolve(self) -> Result<FailoverConfig, ConfigError> {
        let d = FailoverConfig::default();
        let cfg = FailoverConfig {
            failure_threshold: self.failure_threshold.unwrap_or(d.failure_threshold),
            down_threshold: self.down_threshold.unwrap_or(d.down_threshold),
            recovery_threshold: self.recovery_threshold.unwrap_or(d.recovery_threshold),
            loss_threshold: self.loss_threshold.unwrap_or(d.loss_threshold),
        };
        if cfg.failure_threshold == 0 || cfg.recovery_threshold == 0 {
            return Err(invalid("failover", "thresholds must be at least 1"));
        }
        if cfg.down_threshold < cfg.failure_threshold {
            return Err(invalid(
                "failover.down_threshold",
                "must be at least failure_threshold",
            ));
        }
        if !(0.0..=1.0).contains(&cfg.loss_threshold) {
            return Err(invalid("failover.loss_threshold", "must be within 0.0-1.0"));
        }
        Ok(cfg)
    }
}

impl MonitorConfigInput {
    fn resolve(self) -> Result<MonitorConfig, ConfigError> {
        let d = MonitorConfig::default();
        let ms = |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);
        let cfg = MonitorConfig {
            enabled: self.enabled.unwrap_or(d.enabled),
            interval: ms(self.interval_ms, d.interval),
            icmp_timeout: ms(self.icmp_timeout_ms, d.icmp_timeout),
            udp_timeout: ms(self.udp_timeout_ms, d.udp_timeout),
            loss_window: self.loss_window.unwrap_or(d.loss_window),
            ewma_alpha: self.ewma_alpha.unwrap_or(d.ewma_alpha),
            bandwidth_every: self.bandwidth_every.unwrap_or(d.bandwidth_every),
            burst_packets: self.burst_packets.unwrap_or(d.burst_packets),
            burst_size: self.burst_size.unwrap_or(d.burst_size),
        };
        if cfg.interval.is_zero() {
            return Err(invalid("monitor.interval_ms", "must be positive"));
        }
        if cfg.loss_window == 0 {
            return Err(invalid("monitor.loss_window", "must be at least 1"));
        }
        if !(cfg.ewma_alpha > 0.0 && cfg.ewma_alpha <= 1.0) {
            return Err(invalid("monitor.ewma_alpha", "must be within (0, 1]"));
        }
        Ok(cfg)
    }
}

impl PipelineConfigInput {
    fn resolve(self) -> Result<PipelineConfig, ConfigError> {
        let d = PipelineConfig::default();
        let cfg = PipelineConfig {
            shutdown_grace: self
                .shutdown_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(d.shutdown_grace),
            receive_capacity: self.receive_capacity.unwrap_or(d.receive_capacity),
            egress_capacity: self.egress_capacity.unwrap_or(d.egress_capacity),
        };
        if cfg.receive_capacity == 0 || cfg.egress_capacity == 0 {
            return Err(invalid("pipeline", "channel capacities must be at least 1"));
        }
        Ok(cfg)
    }
}

impl BondingConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(BondingConfig::default());
        }
        let parsed: BondingConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn link(&self, id: usize) -> Option<&LinkConfig> {
        self.links.iter().find(|l| l.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        version = 1

        [scheduler]
        algorithm = "least_loaded"
        batch_size = 32
        queue_bound = 100
        queue_wait_ms = 50

        [[links]]
        id = 0
        name = "wan0"
        interface = "eth0"
        peer = "203.0.113.10:7000"
        probe_target = "203.0.113.10:7001"
        weight = 2.0
        max_bandwidth_bps = 100000000
        failover_group = "wired"
        probes = ["icmp", "udp"]

        [[links]]
        name = "lte0"

        [[qos.rules]]
        name = "voip"
        priority = 7
        protocol = "udp"
        dst_ports = { start = 10000, end = 20000 }
        dscp = 46
        link_preference = ["wan0"]
        bandwidth_ceiling_bps = 2000000
        latency_ceiling_ms = 80
        fec = true

        [fec]
        kind = "xor"
        data_shards = 8
        parity_shards = 1

        [reorder]
        capacity_packets = 512
        max_age_ms = 150

        [failover]
        failure_threshold = 2

        [monitor]
        interval_ms = 1000
    "#;

    #[test]
    fn parse_full_config() {
        let cfg = BondingConfig::from_toml_str(FULL).unwrap();
        assert_eq!(cfg.scheduler.mode, SchedulingMode::LeastLoaded);
        assert_eq!(cfg.scheduler.batch_size, 32);
        assert_eq!(cfg.scheduler.queue_bound, 100);
        assert_eq!(cfg.scheduler.queue_wait, Duration::from_millis(50));

        assert_eq!(cfg.links.len(), 2);
        let wan0 = &cfg.links[0];
        assert_eq!(wan0.interface.as_deref(), Some("eth0"));
        assert_eq!(wan0.peer, Some("203.0.113.10:7000".parse().unwrap()));
        assert_eq!(wan0.weight, 2.0);
        assert_eq!(wan0.failover_group.as_deref(), Some("wired"));
        assert_eq!(wan0.probes, vec![ProbeKind::Icmp, ProbeKind::Udp]);
        assert_eq!(cfg.links[1].id, 1);
        assert_eq!(cfg.links[1].name, "lte0");
        assert_eq!(cfg.links[1].probes, vec![ProbeKind::Udp]);

        let voip = &cfg.qos.rules()[0];
        assert_eq!(voip.priority, 7);
        assert_eq!(voip.action.link_preference, vec![0]);
        assert_eq!(voip.action.latency_ceiling, Some(Duration::from_millis(80)));
        assert_eq!(voip.action.fec, Some(true));

        assert_eq!(cfg.fec.params.kind, FecKind::Xor);
        assert_eq!(cfg.fec.params.data_shards, 8);
        assert!(!cfg.fec.enabled);
        assert_eq!(cfg.reorder.capacity_packets, 512);
        assert_eq!(cfg.reorder.max_age, Duration::from_millis(150));
        assert_eq!(cfg.reorder.min_hold, Duration::from_millis(10));
        assert_eq!(cfg.failover.failure_threshold, 2);
        assert_eq!(cfg.failover.down_threshold, 6);
        assert_eq!(cfg.monitor.interval, Duration::from_secs(1));
        assert_eq!(cfg.monitor.udp_timeout, Duration::from_secs(2));
    }

    #[test]
    fn empty_config_is_default() {
        let cfg = BondingConfig::from_toml_str("  ").unwrap();
        assert!(cfg.links.is_empty());
        assert_eq!(cfg.scheduler.batch_size, 64);
        assert_eq!(cfg.scheduler.queue_bound, 10_000);
        assert_eq!(cfg.fec.params, FecParams::default());
        assert_eq!(cfg.failover.recovery_threshold, 5);
    }

    #[test]
    fn duplicate_link_id_is_fatal() {
        let toml = r#"
            [[links]]
            id = 1
            [[links]]
            id = 1
        "#;
        let err = BondingConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateLinkId(1)));
    }

    #[test]
    fn unknown_link_in_rule_is_fatal() {
        let toml = r#"
            [[links]]
            name = "wan0"
            [[qos.rules]]
            name = "video"
            link_preference = ["wan9"]
        "#;
        let err = BondingConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLink { ref link, .. } if link == "wan9"));
    }

    #[test]
    fn zero_data_shards_is_fatal() {
        let err = BondingConfig::from_toml_str("[fec]\ndata_shards = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFec(_)));
    }

    #[test]
    fn malformed_rule_fields_are_fatal() {
        for body in [
            "protocol = \"bogus\"",
            "src = \"10.0.0.0/40\"",
            "dst_ports = { start = 20, end = 10 }",
            "dscp = 64",
            "loss_ceiling = 1.5",
        ] {
            let toml = format!("[[qos.rules]]\nname = \"r\"\n{body}\n");
            let err = BondingConfig::from_toml_str(&toml).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidRule { .. }), "{body}: {err}");
        }
    }

    #[test]
    fn legacy_port_range_maps_to_dst_ports() {
        let toml = r#"
            [[qos.rules]]
            name = "legacy"
            port_range = { start = 5000, end = 5001 }
        "#;
        let cfg = BondingConfig::from_toml_str(toml).unwrap();
        assert_eq!(
            cfg.qos.rules()[0].criteria.dst_ports,
            Some(PortRange {
                start: 5000,
                end: 5001
            })
        );
    }

    #[test]
    fn unsupported_version_rejected() {
        let err = BondingConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(2)));
    }

    #[test]
    fn invalid_toml_rejected() {
        let err = BondingConfig::from_toml_str("links = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn repeated_probe_kinds_collapse_in_order() {
        let toml = r#"
            [[links]]
            probes = ["udp", "icmp", "udp", "icmp", "udp"]
        "#;
        let cfg = BondingConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.links[0].probes, vec![ProbeKind::Udp, ProbeKind::Icmp]);
    }

    #[test]
    fn bad_peer_address_rejected() {
        let err = BondingConfig::from_toml_str("[[links]]\npeer = \"nowhere\"").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLink { .. }));
    }

    #[test]
    fn from_file_reports_path() {
        let err = BondingConfig::from_file("/definitely/missing/braid.toml").unwrap_err();
        assert!(format!("{err:#}").contains("/definitely/missing/braid.toml"));
    }
}

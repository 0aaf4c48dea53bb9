//! # Link Health Monitor
//!
//! Probes every link once per cycle and folds the results into per-link
//! health: EWMA latency and jitter, a sliding loss window, EWMA burst
//! bandwidth and consecutive success/failure counters. Each update is
//! published to the link table as a fresh [`HealthSnapshot`], so readers
//! never wait on a probe.
//!
//! The monitor does not decide link state. It hands its samples to the
//! failover controller, which owns the state machine.

pub mod ewma;
pub mod probe;
pub mod window;

use quanta::Instant;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::{LinkConfig, MonitorConfig, ProbeKind};
use crate::net::table::{HealthSnapshot, LinkTable};
use crate::net::util::read_operstate;

pub use ewma::Ewma;
pub use probe::{HealthSample, ProbeError, ProbeOutcome, Prober};
pub use window::HealthWindow;

/// Rolling health state of one link.
#[derive(Debug, Clone)]
pub struct LinkHealth {
    latency: Ewma,
    jitter: Ewma,
    bandwidth: Ewma,
    last_rtt: Option<Duration>,
    window: HealthWindow,
    consecutive_failures: u32,
    consecutive_successes: u32,
    samples: u64,
    updated_at: Option<Instant>,
}

impl LinkHealth {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            latency: Ewma::new(config.ewma_alpha),
            jitter: Ewma::new(config.ewma_alpha),
            bandwidth: Ewma::new(config.ewma_alpha),
            last_rtt: None,
            window: HealthWindow::new(config.loss_window),
            consecutive_failures: 0,
            consecutive_successes: 0,
            samples: 0,
            updated_at: None,
        }
    }

    pub fn record(&mut self, outcome: ProbeOutcome, at: Instant) {
        self.samples += 1;
        self.updated_at = Some(at);
        match outcome.rtt() {
            Some(rtt) => {
                if let Some(prev) = self.last_rtt {
                    self.jitter.update(rtt.abs_diff(prev).as_secs_f64());
                }
                self.last_rtt = Some(rtt);
                self.latency.update(rtt.as_secs_f64());
                self.window.push(Some(rtt));
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
            }
            None => {
                self.window.push(None);
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
            }
        }
    }

    pub fn record_bandwidth(&mut self, bps: f64) {
        self.bandwidth.update(bps);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let reachable = self.window.successes() > 0;
        HealthSnapshot {
            latency: self
                .latency
                .get()
                .filter(|_| reachable)
                .map(Duration::from_secs_f64),
            jitter: Duration::from_secs_f64(self.jitter.value()),
            loss: self.window.loss_ratio(),
            bandwidth_bps: self.bandwidth.get(),
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            window_len: self.window.len(),
            window_successes: self.window.successes(),
            window_full: self.window.is_full(),
            samples: self.samples,
            updated_at: self.updated_at,
        }
    }
}

/// A probe result and its link's health right after it was recorded.
#[derive(Debug, Clone)]
pub struct RecordedSample {
    pub sample: HealthSample,
    pub health: HealthSnapshot,
}

/// What one probing cycle observed.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// In recording order; each carries the snapshot it produced, not the
    /// end-of-cycle one.
    pub samples: Vec<RecordedSample>,
    /// Links whose interface reports operationally down.
    pub interfaces_down: Vec<usize>,
}

pub struct HealthMonitor {
    config: MonitorConfig,
    table: Arc<LinkTable>,
    probers: Vec<Arc<dyn Prober>>,
    /// Parallel to the table's slots.
    health: Vec<LinkHealth>,
    cycles: u64,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig, table: Arc<LinkTable>, probers: Vec<Arc<dyn Prober>>) -> Self {
        let health = table.iter().map(|_| LinkHealth::new(&config)).collect();
        Self {
            config,
            table,
            probers,
            health,
            cycles: 0,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn prober_for(&self, kind: ProbeKind) -> Option<&dyn Prober> {
        self.probers
            .iter()
            .find(|p| p.kind() == kind)
            .map(|p| p.as_ref())
    }

    /// Fold one sample into its link's health and publish the result.
    /// Samples for unknown links are ignored.
    pub fn record(&mut self, sample: &HealthSample) -> Option<HealthSnapshot> {
        let idx = self.table.index_of(sample.link_id)?;
        let health = &mut self.health[idx];
        health.record(sample.outcome, sample.at);
        let snapshot = health.snapshot();
        self.table.slots()[idx].publish_health(snapshot.clone());
        Some(snapshot)
    }

    pub fn record_bandwidth(&mut self, link_id: usize, bps: f64) {
        let Some(idx) = self.table.index_of(link_id) else {
            return;
        };
        let health = &mut self.health[idx];
        health.record_bandwidth(bps);
        self.table.slots()[idx].publish_health(health.snapshot());
    }

    /// Probe every link once (links in parallel), record the samples and
    /// return them for the failover controller. Every `bandwidth_every`
    /// cycles a burst estimate follows the probes.
    pub fn run_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let with_burst =
            self.config.bandwidth_every > 0
                && self.cycles.is_multiple_of(u64::from(self.config.bandwidth_every));

        let table = self.table.clone();
        let links: Vec<&LinkConfig> = table.iter().map(|s| s.config()).collect();
        let this = &*self;
        let results: Vec<(Vec<HealthSample>, Option<f64>)> = thread::scope(|scope| {
            let handles: Vec<_> = links
                .iter()
                .map(|&link| scope.spawn(move || this.probe_link(link, with_burst)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_default())
                .collect()
        });

        let mut report = CycleReport::default();
        for (link, (samples, bandwidth)) in links.iter().zip(results) {
            if let Some(bps) = bandwidth {
                self.record_bandwidth(link.id, bps);
            }
            for sample in samples {
                if let Some(health) = self.record(&sample) {
                    report.samples.push(RecordedSample { sample, health });
                }
            }
            if let Some(iface) = link.interface.as_deref() {
                if read_operstate(iface) == Some(false) {
                    report.interfaces_down.push(link.id);
                }
            }
        }

        debug!(
            cycle = self.cycles,
            samples = report.samples.len(),
            lost = report
                .samples
                .iter()
                .filter(|r| !r.sample.outcome.is_success())
                .count(),
            "health cycle done"
        );
        report
    }

    fn probe_link(&self, link: &LinkConfig, with_burst: bool) -> (Vec<HealthSample>, Option<f64>) {
        let mut samples = Vec::with_capacity(link.probes.len());
        for &kind in &link.probes {
            let Some(prober) = self.prober_for(kind) else {
                continue;
            };
            let result = prober.probe(link, self.config.timeout_for(kind));
            let outcome = ProbeOutcome::from(&result);
            match &result {
                Ok(rtt) => trace!(link_id = link.id, kind = kind.as_str(), ?rtt, "probe reply"),
                Err(ProbeError::Timeout) => {
                    debug!(link_id = link.id, kind = kind.as_str(), "probe timeout")
                }
                Err(e) => debug!(link_id = link.id, kind = kind.as_str(), error = %e, "probe failed"),
            }
            samples.push(HealthSample {
                link_id: link.id,
                kind,
                outcome,
                at: Instant::now(),
            });
        }

        let bandwidth = if with_burst {
            self.prober_for(ProbeKind::Udp).and_then(|p| {
                p.burst(
                    link,
                    self.config.burst_packets,
                    self.config.burst_size,
                    self.config.udp_timeout,
                )
                .map_err(|e| debug!(link_id = link.id, error = %e, "bandwidth burst failed"))
                .ok()
                .flatten()
            })
        } else {
            None
        };
        (samples, bandwidth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted results per link id.
    struct ScriptedProber {
        kind: ProbeKind,
        script: Mutex<Vec<(usize, VecDeque<Result<Duration, ()>>)>>,
        burst_bps: Option<f64>,
    }

    impl ScriptedProber {
        fn new(kind: ProbeKind) -> Self {
            Self {
                kind,
                script: Mutex::new(Vec::new()),
                burst_bps: None,
            }
        }

        fn push(&self, link_id: usize, results: impl IntoIterator<Item = Result<Duration, ()>>) {
            self.script
                .lock()
                .unwrap()
                .push((link_id, results.into_iter().collect()));
        }
    }

    impl Prober for ScriptedProber {
        fn kind(&self) -> ProbeKind {
            self.kind
        }

        fn probe(&self, link: &LinkConfig, _timeout: Duration) -> Result<Duration, ProbeError> {
            let mut script = self.script.lock().unwrap();
            let next = script
                .iter_mut()
                .find(|(id, _)| *id == link.id)
                .and_then(|(_, q)| q.pop_front());
            match next {
                Some(Ok(rtt)) => Ok(rtt),
                _ => Err(ProbeError::Timeout),
            }
        }

        fn burst(
            &self,
            _link: &LinkConfig,
            _packets: usize,
            _size: usize,
            _timeout: Duration,
        ) -> Result<Option<f64>, ProbeError> {
            Ok(self.burst_bps)
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            loss_window: 4,
            ewma_alpha: 0.5,
            bandwidth_every: 0,
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn latency_and_jitter_follow_replies() {
        let mut h = LinkHealth::new(&config());
        let t = Instant::now();
        h.record(ProbeOutcome::Reply(ms(20)), t);
        h.record(ProbeOutcome::Reply(ms(40)), t);
        let snap = h.snapshot();
        // 20 * 0.5 + 40 * 0.5
        assert!((snap.latency.unwrap().as_secs_f64() - 0.030).abs() < 1e-6);
        // First jitter sample seeds the average: |40 - 20|
        assert!((snap.jitter.as_secs_f64() - 0.020).abs() < 1e-6);
        assert_eq!(snap.loss, 0.0);
        assert_eq!(snap.consecutive_successes, 2);
    }

    #[test]
    fn all_lost_window_has_no_latency() {
        let mut h = LinkHealth::new(&config());
        let t = Instant::now();
        h.record(ProbeOutcome::Reply(ms(20)), t);
        for _ in 0..4 {
            h.record(ProbeOutcome::Timeout, t);
        }
        let snap = h.snapshot();
        assert_eq!(snap.latency, None);
        assert_eq!(snap.loss, 1.0);
        assert!(snap.is_hard_down());
        assert_eq!(snap.consecutive_failures, 4);
        assert_eq!(snap.consecutive_successes, 0);
    }

    #[test]
    fn cycle_probes_every_link_and_publishes() {
        let table = Arc::new(LinkTable::new(vec![
            LinkConfig::new(0, "wan0"),
            LinkConfig::new(1, "wan1"),
        ]));
        let prober = Arc::new(ScriptedProber::new(ProbeKind::Udp));
        prober.push(0, [Ok(ms(15))]);
        prober.push(1, [Err(())]);
        let mut monitor = HealthMonitor::new(config(), table.clone(), vec![prober]);

        let report = monitor.run_cycle();
        assert_eq!(report.samples.len(), 2);
        let s0 = report.samples.iter().find(|r| r.sample.link_id == 0).unwrap();
        assert_eq!(s0.sample.outcome, ProbeOutcome::Reply(ms(15)));
        let s1 = report.samples.iter().find(|r| r.sample.link_id == 1).unwrap();
        assert_eq!(s1.sample.outcome, ProbeOutcome::Timeout);

        let latency = table.get(0).unwrap().health().latency.unwrap();
        assert!((latency.as_secs_f64() - 0.015).abs() < 1e-6);
        assert_eq!(table.get(1).unwrap().health().consecutive_failures, 1);
        assert_eq!(monitor.cycles(), 1);
    }

    #[test]
    fn each_sample_carries_its_own_snapshot() {
        let mut link = LinkConfig::new(0, "wan0");
        link.probes = vec![ProbeKind::Icmp, ProbeKind::Udp];
        let table = Arc::new(LinkTable::new(vec![link]));
        let icmp = Arc::new(ScriptedProber::new(ProbeKind::Icmp));
        icmp.push(0, [Ok(ms(10))]);
        let udp = Arc::new(ScriptedProber::new(ProbeKind::Udp));
        udp.push(0, [Err(())]);
        let mut monitor = HealthMonitor::new(config(), table, vec![icmp, udp]);

        let report = monitor.run_cycle();
        assert_eq!(report.samples.len(), 2);
        let first = &report.samples[0];
        assert_eq!(first.sample.kind, ProbeKind::Icmp);
        assert_eq!(first.health.window_len, 1);
        assert_eq!(first.health.consecutive_successes, 1);
        assert_eq!(first.health.loss, 0.0);
        let second = &report.samples[1];
        assert_eq!(second.health.window_len, 2);
        assert_eq!(second.health.consecutive_failures, 1);
        assert_eq!(second.health.loss, 0.5);
    }

    #[test]
    fn links_without_matching_prober_are_skipped() {
        let mut icmp_only = LinkConfig::new(0, "wan0");
        icmp_only.probes = vec![ProbeKind::Icmp];
        let table = Arc::new(LinkTable::new(vec![icmp_only]));
        let prober = Arc::new(ScriptedProber::new(ProbeKind::Udp));
        let mut monitor = HealthMonitor::new(config(), table, vec![prober]);
        assert!(monitor.run_cycle().samples.is_empty());
    }

    #[test]
    fn bandwidth_burst_runs_on_schedule() {
        let table = Arc::new(LinkTable::new(vec![LinkConfig::new(0, "wan0")]));
        let mut prober = ScriptedProber::new(ProbeKind::Udp);
        prober.burst_bps = Some(8_000_000.0);
        let cfg = MonitorConfig {
            bandwidth_every: 2,
            ..config()
        };
        let mut monitor = HealthMonitor::new(cfg, table.clone(), vec![Arc::new(prober)]);

        monitor.run_cycle();
        assert_eq!(table.get(0).unwrap().health().bandwidth_bps, None);
        monitor.run_cycle();
        assert_eq!(table.get(0).unwrap().health().bandwidth_bps, Some(8_000_000.0));
    }

    #[test]
    fn samples_for_unknown_links_are_ignored() {
        let table = Arc::new(LinkTable::new(vec![LinkConfig::new(0, "wan0")]));
        let mut monitor = HealthMonitor::new(config(), table, Vec::new());
        let sample = HealthSample::timeout(9, ProbeKind::Udp, Instant::now());
        assert!(monitor.record(&sample).is_none());
    }
}

//! # Pipeline Metrics
//!
//! Point-in-time view of every stage's counters, exported as JSON or in
//! Prometheus text exposition format.

use serde::Serialize;
use std::fmt::Write;

use braid_transport::stats::{FecDecodeStats, FecEncodeStats};

use crate::error::DropCounters;
use crate::net::table::LinkSlot;
use crate::receiver::ReorderStats;
use crate::scheduler::bonding::LinkTraffic;

/// Health, state and traffic of one link.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkSnapshot {
    pub id: usize,
    pub name: String,
    pub state: &'static str,
    pub transitions: u64,
    pub latency_ms: Option<f64>,
    pub jitter_ms: f64,
    pub loss: f64,
    pub bandwidth_bps: Option<f64>,
    /// Frames the scheduler assigned to this link.
    pub frames_scheduled: u64,
    pub bytes_scheduled: u64,
    /// Frames the transmit worker handed to the link.
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

impl LinkSnapshot {
    pub fn capture(slot: &LinkSlot, traffic: Option<&LinkTraffic>) -> Self {
        let health = slot.health();
        let status = slot.status();
        let traffic = traffic.copied().unwrap_or_default();
        Self {
            id: slot.id(),
            name: slot.config().name.clone(),
            state: status.state.as_str(),
            transitions: status.transitions,
            latency_ms: health.latency.map(|d| d.as_secs_f64() * 1000.0),
            jitter_ms: health.jitter.as_secs_f64() * 1000.0,
            loss: health.loss,
            bandwidth_bps: health.bandwidth_bps,
            frames_scheduled: traffic.frames,
            bytes_scheduled: traffic.bytes,
            frames_sent: slot.counters.frames_sent.load(std::sync::atomic::Ordering::Relaxed),
            bytes_sent: slot.counters.bytes_sent.load(std::sync::atomic::Ordering::Relaxed),
            send_errors: slot.counters.send_errors.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FecSnapshot {
    /// Parity shards over all shards sent.
    pub overhead: f64,
    /// Blocks rebuilt over blocks that needed rebuilding.
    pub recovery_rate: f64,
    pub encode: FecEncodeStats,
    pub decode: FecDecodeStats,
}

impl FecSnapshot {
    pub fn new(encode: FecEncodeStats, decode: FecDecodeStats) -> Self {
        Self {
            overhead: encode.overhead(),
            recovery_rate: decode.recovery_rate(),
            encode,
            decode,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSnapshot {
    pub uptime_ms: u64,
    /// Packets accepted into the ingress ring.
    pub packets_in: u64,
    pub packets_scheduled: u64,
    /// Packets released to the egress channel.
    pub packets_delivered: u64,
    /// Packets waiting for an eligible link.
    pub queue_depth: usize,
    pub links: Vec<LinkSnapshot>,
    pub fec: FecSnapshot,
    pub reorder: ReorderStats,
    /// Drops by reason, summed over every stage.
    pub drops: DropCounters,
    pub failover_transitions: u64,
    pub auth_failures: u64,
}

impl PipelineSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn link(&self, id: usize) -> Option<&LinkSnapshot> {
        self.links.iter().find(|l| l.id == id)
    }
}

/// Render a snapshot in Prometheus text exposition format.
pub fn render_prometheus(snapshot: &PipelineSnapshot) -> String {
    let mut out = String::with_capacity(2048);

    // ── Per-link gauges ─────────────────────────────────────────

    gauge_header(&mut out, "braid_link_rtt_ms", "Smoothed RTT in milliseconds.");
    for l in &snapshot.links {
        if let Some(rtt) = l.latency_ms {
            let _ = writeln!(out, "braid_link_rtt_ms{{link_id=\"{}\"}} {rtt:.3}", l.id);
        }
    }
    gauge_header(&mut out, "braid_link_jitter_ms", "Smoothed RTT jitter in milliseconds.");
    for l in &snapshot.links {
        let _ = writeln!(out, "braid_link_jitter_ms{{link_id=\"{}\"}} {:.3}", l.id, l.jitter_ms);
    }
    gauge_header(&mut out, "braid_link_loss_rate", "Probe loss over the window (0.0-1.0).");
    for l in &snapshot.links {
        let _ = writeln!(out, "braid_link_loss_rate{{link_id=\"{}\"}} {:.6}", l.id, l.loss);
    }
    gauge_header(&mut out, "braid_link_up", "1 when the link is eligible for traffic.");
    for l in &snapshot.links {
        let up = u8::from(l.state == "up" || l.state == "degraded");
        let _ = writeln!(
            out,
            "braid_link_up{{link_id=\"{}\",state=\"{}\"}} {up}",
            l.id, l.state
        );
    }

    // ── Per-link counters ───────────────────────────────────────

    counter_header(&mut out, "braid_link_frames_total", "Frames scheduled onto the link.");
    for l in &snapshot.links {
        let _ = writeln!(out, "braid_link_frames_total{{link_id=\"{}\"}} {}", l.id, l.frames_scheduled);
    }
    counter_header(&mut out, "braid_link_bytes_total", "Bytes scheduled onto the link.");
    for l in &snapshot.links {
        let _ = writeln!(out, "braid_link_bytes_total{{link_id=\"{}\"}} {}", l.id, l.bytes_scheduled);
    }

    // ── Pipeline ────────────────────────────────────────────────

    counter_header(&mut out, "braid_packets_in_total", "Packets accepted at ingress.");
    let _ = writeln!(out, "braid_packets_in_total {}", snapshot.packets_in);
    counter_header(&mut out, "braid_packets_delivered_total", "Packets released in order.");
    let _ = writeln!(out, "braid_packets_delivered_total {}", snapshot.packets_delivered);
    gauge_header(&mut out, "braid_fec_overhead", "Parity share of shards sent.");
    let _ = writeln!(out, "braid_fec_overhead {:.6}", snapshot.fec.overhead);
    gauge_header(&mut out, "braid_fec_recovery_rate", "Share of damaged blocks rebuilt.");
    let _ = writeln!(out, "braid_fec_recovery_rate {:.6}", snapshot.fec.recovery_rate);
    gauge_header(&mut out, "braid_reorder_occupancy", "Packets held in the reorder buffer.");
    let _ = writeln!(out, "braid_reorder_occupancy {}", snapshot.reorder.occupancy);
    counter_header(
        &mut out,
        "braid_reorder_packets_reordered_total",
        "Packets that arrived ahead of a missing predecessor.",
    );
    let _ = writeln!(
        out,
        "braid_reorder_packets_reordered_total {}",
        snapshot.reorder.packets_reordered
    );
    gauge_header(&mut out, "braid_reorder_max_distance", "Largest reorder distance seen, in packets.");
    let _ = writeln!(out, "braid_reorder_max_distance {}", snapshot.reorder.max_reorder_distance);
    gauge_header(&mut out, "braid_reorder_avg_delay_ms", "Mean hold time of reordered packets.");
    let _ = writeln!(
        out,
        "braid_reorder_avg_delay_ms {:.3}",
        snapshot.reorder.average_reorder_delay_ms
    );

    counter_header(&mut out, "braid_drops_total", "Packets dropped, by reason.");
    if let Ok(serde_json::Value::Object(drops)) = serde_json::to_value(snapshot.drops) {
        for (reason, count) in drops {
            let _ = writeln!(out, "braid_drops_total{{reason=\"{reason}\"}} {count}");
        }
    }
    counter_header(&mut out, "braid_failover_transitions_total", "Link state transitions.");
    let _ = writeln!(out, "braid_failover_transitions_total {}", snapshot.failover_transitions);

    out
}

fn gauge_header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
}

fn counter_header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
}

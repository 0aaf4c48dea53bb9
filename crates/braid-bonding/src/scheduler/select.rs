//! Candidate tiers and per-mode link selection.
//!
//! For every packet (or shard) the scheduler builds the candidate set from
//! the first non-empty tier:
//!
//! 1. preferred links that are UP, in preference order;
//! 2. UP links sharing a failover group with a preferred link;
//! 3. every other UP link;
//! 4. to 6. the same three tiers over DEGRADED links.
//!
//! The [`Selector`] then picks one candidate according to the configured
//! [`SchedulingMode`]. Ties go to the lowest measured latency, then the
//! lowest link id.

use quanta::Instant;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::SchedulingMode;
use crate::net::interface::LinkState;
use crate::net::table::{LinkSlot, LinkTable};
use crate::scheduler::qos::QosAction;

/// Weight multiplier for links over a class latency or loss ceiling.
pub const CEILING_PENALTY: f64 = 0.001;

/// Capacity assumed for least-loaded selection when a link has neither a
/// configured nor a measured bandwidth.
const FALLBACK_CAPACITY_BPS: f64 = 10_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    PreferredUp,
    GroupUp,
    OtherUp,
    PreferredDegraded,
    GroupDegraded,
    OtherDegraded,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::PreferredUp,
        Tier::GroupUp,
        Tier::OtherUp,
        Tier::PreferredDegraded,
        Tier::GroupDegraded,
        Tier::OtherDegraded,
    ];

    /// Link state every member of the tier is in.
    pub fn state(&self) -> LinkState {
        match self {
            Tier::PreferredUp | Tier::GroupUp | Tier::OtherUp => LinkState::Up,
            _ => LinkState::Degraded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::PreferredUp => "preferred_up",
            Tier::GroupUp => "group_up",
            Tier::OtherUp => "other_up",
            Tier::PreferredDegraded => "preferred_degraded",
            Tier::GroupDegraded => "group_degraded",
            Tier::OtherDegraded => "other_degraded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: usize,
    /// Effective weight: configured weight scaled by delivery ratio and
    /// ceiling penalties.
    pub weight: f64,
    pub latency: Option<Duration>,
    /// Configured max bandwidth, else the measured estimate.
    pub capacity_bps: Option<f64>,
}

impl Candidate {
    fn from_slot(slot: &LinkSlot, action: &QosAction) -> Self {
        let cfg = slot.config();
        let health = slot.health();
        let mut weight = cfg.weight * (1.0 - health.loss).clamp(0.0, 1.0);
        let over_latency = matches!(
            (action.latency_ceiling, health.latency),
            (Some(ceiling), Some(latency)) if latency > ceiling
        );
        let over_loss = action.loss_ceiling.is_some_and(|c| health.loss > c);
        if over_latency || over_loss {
            weight *= CEILING_PENALTY;
        }
        let capacity_bps = if cfg.max_bandwidth_bps > 0 {
            Some(cfg.max_bandwidth_bps as f64)
        } else {
            health.bandwidth_bps.filter(|b| *b > 0.0)
        };
        Self {
            id: cfg.id,
            weight,
            latency: health.latency,
            capacity_bps,
        }
    }

    /// Lower latency first, unknown latency last, then lower id.
    fn tie_break(&self, other: &Candidate) -> Ordering {
        let a = self.latency.unwrap_or(Duration::MAX);
        let b = other.latency.unwrap_or(Duration::MAX);
        a.cmp(&b).then(self.id.cmp(&other.id))
    }
}

/// Candidate set for one packet under `action`, or `None` when no link is
/// eligible.
pub fn candidates(table: &LinkTable, action: &QosAction) -> Option<(Tier, Vec<Candidate>)> {
    let filter = TierFilter::new(table, action);
    Tier::ALL.into_iter().find_map(|tier| {
        let members = filter.members(tier);
        (!members.is_empty()).then_some((tier, members))
    })
}

/// Extends the candidates of `tier` with the later tiers of the same link
/// state until at least `wanted` links are available (or none are left).
///
/// Used to spread the shards of one FEC block. Never crosses from UP into
/// DEGRADED links.
pub fn widen(
    table: &LinkTable,
    action: &QosAction,
    tier: Tier,
    members: &[Candidate],
    wanted: usize,
) -> Vec<Candidate> {
    let mut out = members.to_vec();
    if out.len() >= wanted {
        return out;
    }
    let filter = TierFilter::new(table, action);
    let later = Tier::ALL
        .into_iter()
        .skip_while(|t| *t != tier)
        .skip(1)
        .filter(|t| t.state() == tier.state());
    for next in later {
        out.extend(filter.members(next));
        if out.len() >= wanted {
            break;
        }
    }
    out
}

struct TierFilter<'a> {
    table: &'a LinkTable,
    action: &'a QosAction,
    groups: Vec<&'a str>,
}

impl<'a> TierFilter<'a> {
    fn new(table: &'a LinkTable, action: &'a QosAction) -> Self {
        let groups = action
            .link_preference
            .iter()
            .filter_map(|id| table.get(*id))
            .filter_map(|s| s.config().failover_group.as_deref())
            .collect();
        Self {
            table,
            action,
            groups,
        }
    }

    fn is_preferred(&self, slot: &LinkSlot) -> bool {
        self.action.link_preference.contains(&slot.id())
    }

    fn in_group(&self, slot: &LinkSlot) -> bool {
        slot.config()
            .failover_group
            .as_deref()
            .is_some_and(|g| self.groups.contains(&g))
    }

    fn members(&self, tier: Tier) -> Vec<Candidate> {
        let state = tier.state();
        let to_candidate = |s: &LinkSlot| Candidate::from_slot(s, self.action);
        match tier {
            // Preference order, not id order.
            Tier::PreferredUp | Tier::PreferredDegraded => self
                .action
                .link_preference
                .iter()
                .filter_map(|id| self.table.get(*id))
                .filter(|s| s.state() == state)
                .map(to_candidate)
                .collect(),
            Tier::GroupUp | Tier::GroupDegraded => self
                .table
                .iter()
                .filter(|s| s.state() == state && !self.is_preferred(s) && self.in_group(s))
                .map(to_candidate)
                .collect(),
            Tier::OtherUp | Tier::OtherDegraded => self
                .table
                .iter()
                .filter(|s| s.state() == state && !self.is_preferred(s) && !self.in_group(s))
                .map(to_candidate)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    bytes: f64,
    updated: Instant,
}

/// Stateful link picker. One per scheduler; state survives across batches
/// so the weighted modes converge on their long-run shares.
#[derive(Debug)]
pub struct Selector {
    mode: SchedulingMode,
    /// Smooth weighted round robin running weights.
    current: HashMap<usize, f64>,
    last_pick: Option<usize>,
    in_flight: HashMap<usize, InFlight>,
}

impl Selector {
    pub fn new(mode: SchedulingMode) -> Self {
        Self {
            mode,
            current: HashMap::new(),
            last_pick: None,
            in_flight: HashMap::new(),
        }
    }

    pub fn mode(&self) -> SchedulingMode {
        self.mode
    }

    pub fn select(&mut self, candidates: &[Candidate], now: Instant) -> Option<usize> {
        let pick = match candidates {
            [] => return None,
            [only] => {
                self.current.clear();
                only.id
            }
            _ => match self.mode {
                SchedulingMode::WeightedRoundRobin => self.smooth_weighted(candidates),
                SchedulingMode::RoundRobin => self.round_robin(candidates),
                SchedulingMode::LeastLoaded => self.least_loaded(candidates, now),
            },
        };
        self.last_pick = Some(pick);
        Some(pick)
    }

    /// Account bytes handed to a link, for least-loaded selection.
    pub fn on_sent(&mut self, link_id: usize, bytes: usize, capacity_bps: Option<f64>, now: Instant) {
        let drained = self.drained(link_id, capacity_bps, now);
        self.in_flight.insert(
            link_id,
            InFlight {
                bytes: drained + bytes as f64,
                updated: now,
            },
        );
    }

    fn drained(&self, link_id: usize, capacity_bps: Option<f64>, now: Instant) -> f64 {
        let Some(entry) = self.in_flight.get(&link_id) else {
            return 0.0;
        };
        let rate = capacity_bps.unwrap_or(FALLBACK_CAPACITY_BPS) / 8.0;
        let elapsed = now.saturating_duration_since(entry.updated).as_secs_f64();
        (entry.bytes - elapsed * rate).max(0.0)
    }

    /// nginx-style smooth weighted round robin: every candidate gains its
    /// weight, the leader is picked and pays back the total.
    fn smooth_weighted(&mut self, candidates: &[Candidate]) -> usize {
        // Credit does not survive leaving the candidate set.
        self.current.retain(|id, _| candidates.iter().any(|c| c.id == *id));
        let total: f64 = candidates.iter().map(|c| c.weight.max(0.0)).sum();
        let uniform = total <= 0.0;
        let total = if uniform { candidates.len() as f64 } else { total };

        let mut best: Option<(&Candidate, f64)> = None;
        for c in candidates {
            let w = if uniform { 1.0 } else { c.weight.max(0.0) };
            let cur = self.current.entry(c.id).or_insert(0.0);
            *cur += w;
            let cur = *cur;
            best = match best {
                Some((b, bw)) if bw > cur || (bw == cur && b.tie_break(c) != Ordering::Greater) => {
                    Some((b, bw))
                }
                _ => Some((c, cur)),
            };
        }
        let id = best.map_or(candidates[0].id, |(c, _)| c.id);
        if let Some(cur) = self.current.get_mut(&id) {
            *cur -= total;
        }
        id
    }

    /// Next id after the previous pick, wrapping to the lowest.
    fn round_robin(&self, candidates: &[Candidate]) -> usize {
        let lowest = candidates.iter().map(|c| c.id).min().unwrap_or(candidates[0].id);
        let Some(last) = self.last_pick else {
            return lowest;
        };
        candidates
            .iter()
            .map(|c| c.id)
            .filter(|id| *id > last)
            .min()
            .unwrap_or(lowest)
    }

    fn least_loaded(&self, candidates: &[Candidate], now: Instant) -> usize {
        let utilisation = |c: &Candidate| {
            let capacity = c.capacity_bps.unwrap_or(FALLBACK_CAPACITY_BPS) / 8.0;
            self.drained(c.id, c.capacity_bps, now) / capacity
        };
        candidates
            .iter()
            .min_by(|a, b| {
                utilisation(a)
                    .partial_cmp(&utilisation(b))
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.tie_break(b))
            })
            .map_or(candidates[0].id, |c| c.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::net::table::{HealthSnapshot, LinkStatus};

    fn cand(id: usize, weight: f64, latency_ms: Option<u64>) -> Candidate {
        Candidate {
            id,
            weight,
            latency: latency_ms.map(Duration::from_millis),
            capacity_bps: None,
        }
    }

    fn set_state(table: &LinkTable, id: usize, state: LinkState) {
        table.get(id).unwrap().publish_status(LinkStatus {
            state,
            ..LinkStatus::default()
        });
    }

    fn grouped_table() -> LinkTable {
        let mut a = LinkConfig::new(0, "fiber");
        a.failover_group = Some("wired".into());
        let mut b = LinkConfig::new(1, "cable");
        b.failover_group = Some("wired".into());
        let c = LinkConfig::new(2, "lte");
        LinkTable::new(vec![a, b, c])
    }

    fn prefer(ids: &[usize]) -> QosAction {
        QosAction {
            link_preference: ids.to_vec(),
            ..QosAction::default()
        }
    }

    fn ids(c: &[Candidate]) -> Vec<usize> {
        c.iter().map(|c| c.id).collect()
    }

    #[test]
    fn tiers_fall_through_in_order() {
        let t = grouped_table();
        let action = prefer(&[0]);

        let (tier, c) = candidates(&t, &action).unwrap();
        assert_eq!((tier, ids(&c)), (Tier::PreferredUp, vec![0]));

        set_state(&t, 0, LinkState::Down);
        let (tier, c) = candidates(&t, &action).unwrap();
        assert_eq!((tier, ids(&c)), (Tier::GroupUp, vec![1]));

        set_state(&t, 1, LinkState::Degraded);
        let (tier, c) = candidates(&t, &action).unwrap();
        assert_eq!((tier, ids(&c)), (Tier::OtherUp, vec![2]));

        set_state(&t, 2, LinkState::Recovering);
        let (tier, c) = candidates(&t, &action).unwrap();
        assert_eq!((tier, ids(&c)), (Tier::GroupDegraded, vec![1]));

        set_state(&t, 1, LinkState::Down);
        assert!(candidates(&t, &action).is_none());
    }

    #[test]
    fn degraded_preferred_loses_to_any_up_link() {
        let t = grouped_table();
        set_state(&t, 0, LinkState::Degraded);
        set_state(&t, 1, LinkState::Degraded);
        let (tier, c) = candidates(&t, &prefer(&[0])).unwrap();
        assert_eq!((tier, ids(&c)), (Tier::OtherUp, vec![2]));
    }

    #[test]
    fn no_preference_uses_all_up_links() {
        let t = grouped_table();
        let (tier, c) = candidates(&t, &QosAction::default()).unwrap();
        assert_eq!((tier, ids(&c)), (Tier::OtherUp, vec![0, 1, 2]));
    }

    #[test]
    fn effective_weight_reflects_loss_and_ceilings() {
        let t = grouped_table();
        t.get(0).unwrap().publish_health(HealthSnapshot {
            loss: 0.5,
            latency: Some(Duration::from_millis(150)),
            ..HealthSnapshot::default()
        });
        let (_, c) = candidates(&t, &QosAction::default()).unwrap();
        assert!((c[0].weight - 0.5).abs() < 1e-12);

        let capped = QosAction {
            latency_ceiling: Some(Duration::from_millis(100)),
            ..QosAction::default()
        };
        let (_, c) = candidates(&t, &capped).unwrap();
        assert!((c[0].weight - 0.5 * CEILING_PENALTY).abs() < 1e-12);
        assert!((c[1].weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn smooth_wrr_follows_weights() {
        let mut s = Selector::new(SchedulingMode::WeightedRoundRobin);
        let c = [cand(0, 3.0, Some(10)), cand(1, 1.0, Some(10))];
        let now = Instant::now();
        let picks: Vec<usize> = (0..8).map(|_| s.select(&c, now).unwrap()).collect();
        assert_eq!(picks.iter().filter(|&&id| id == 0).count(), 6);
        // Smooth: the light link is interleaved, never starved for 4 picks.
        assert_eq!(&picks[..4], &[0, 0, 1, 0]);
    }

    #[test]
    fn penalised_link_keeps_a_small_share() {
        let mut s = Selector::new(SchedulingMode::WeightedRoundRobin);
        let c = [cand(0, 1.0, Some(10)), cand(1, CEILING_PENALTY, Some(5))];
        let now = Instant::now();
        let picks: Vec<usize> = (0..2002).map(|_| s.select(&c, now).unwrap()).collect();
        let light = picks.iter().filter(|&&id| id == 1).count();
        assert!((1..=3).contains(&light), "light link picked {light} times");
    }

    #[test]
    fn returning_link_starts_without_old_credit() {
        let now = Instant::now();
        let all = [cand(0, 1.0, Some(10)), cand(1, 1.0, Some(10)), cand(2, 1.0, Some(10))];
        let mut s = Selector::new(SchedulingMode::WeightedRoundRobin);
        assert_eq!(s.select(&all, now), Some(0));
        assert_eq!(s.select(&all[1..], now), Some(1));
        // Link 0 is neither starved by its old debt nor bursts on return.
        let picks: Vec<usize> = (0..3).map(|_| s.select(&all, now).unwrap()).collect();
        assert_eq!(picks, vec![2, 0, 1]);

        let pair = [cand(0, 1.0, Some(10)), cand(1, 1.0, Some(10))];
        let mut s = Selector::new(SchedulingMode::WeightedRoundRobin);
        assert_eq!(s.select(&pair, now), Some(0));
        assert_eq!(s.select(&pair[1..], now), Some(1));
        assert_eq!(s.select(&pair, now), Some(0));
    }

    #[test]
    fn zero_weights_fall_back_to_uniform() {
        let mut s = Selector::new(SchedulingMode::WeightedRoundRobin);
        let c = [cand(0, 0.0, Some(10)), cand(1, 0.0, Some(20))];
        let now = Instant::now();
        let picks: Vec<usize> = (0..4).map(|_| s.select(&c, now).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn wrr_tie_breaks_on_latency_then_id() {
        let now = Instant::now();
        let mut s = Selector::new(SchedulingMode::WeightedRoundRobin);
        let c = [cand(0, 1.0, Some(30)), cand(1, 1.0, Some(10))];
        assert_eq!(s.select(&c, now), Some(1));

        let mut s = Selector::new(SchedulingMode::WeightedRoundRobin);
        let c = [cand(4, 1.0, None), cand(2, 1.0, None)];
        assert_eq!(s.select(&c, now), Some(2));
    }

    #[test]
    fn round_robin_ignores_weights() {
        let mut s = Selector::new(SchedulingMode::RoundRobin);
        let c = [cand(5, 100.0, None), cand(2, 1.0, None), cand(9, 1.0, None)];
        let now = Instant::now();
        let picks: Vec<usize> = (0..6).map(|_| s.select(&c, now).unwrap()).collect();
        assert_eq!(picks, vec![2, 5, 9, 2, 5, 9]);
    }

    #[test]
    fn least_loaded_prefers_idle_capacity() {
        let mut s = Selector::new(SchedulingMode::LeastLoaded);
        let mut fast = cand(0, 1.0, Some(20));
        fast.capacity_bps = Some(100_000_000.0);
        let mut slow = cand(1, 1.0, Some(10));
        slow.capacity_bps = Some(1_000_000.0);
        let c = [fast.clone(), slow.clone()];
        let now = Instant::now();

        // Both idle: tie broken on latency.
        assert_eq!(s.select(&c, now), Some(1));
        s.on_sent(1, 1200, slow.capacity_bps, now);
        assert_eq!(s.select(&c, now), Some(0));
        s.on_sent(0, 1200, fast.capacity_bps, now);
        // 1200 B on 100 Mbit/s is far lower utilisation than on 1 Mbit/s.
        assert_eq!(s.select(&c, now), Some(0));

        // After the slow link drains it becomes eligible again.
        let later = now + Duration::from_millis(50);
        assert_eq!(s.select(&c, later), Some(1));
    }

    #[test]
    fn empty_and_single_candidate() {
        let mut s = Selector::new(SchedulingMode::LeastLoaded);
        assert_eq!(s.select(&[], Instant::now()), None);
        assert_eq!(s.select(&[cand(7, 1.0, None)], Instant::now()), Some(7));
    }
}

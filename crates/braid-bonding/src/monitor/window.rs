use std::collections::VecDeque;
use std::time::Duration;

/// Sliding window over the last `capacity` probe outcomes. `Some(rtt)` is
/// a reply, `None` a loss.
#[derive(Debug, Clone)]
pub struct HealthWindow {
    outcomes: VecDeque<Option<Duration>>,
    capacity: usize,
    successes: usize,
}

impl HealthWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
            successes: 0,
        }
    }

    pub fn push(&mut self, outcome: Option<Duration>) {
        if self.outcomes.len() == self.capacity {
            if let Some(Some(_)) = self.outcomes.pop_front() {
                self.successes -= 1;
            }
        }
        if outcome.is_some() {
            self.successes += 1;
        }
        self.outcomes.push_back(outcome);
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.outcomes.len() == self.capacity
    }

    pub fn successes(&self) -> usize {
        self.successes
    }

    /// Fraction of lost probes. An empty window reports 0.0; a window with
    /// probes but no replies reports 1.0.
    pub fn loss_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let lost = self.outcomes.len() - self.successes;
        lost as f64 / self.outcomes.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTT: Option<Duration> = Some(Duration::from_millis(20));

    #[test]
    fn empty_window_reports_no_loss() {
        let w = HealthWindow::new(20);
        assert!(w.is_empty());
        assert_eq!(w.loss_ratio(), 0.0);
    }

    #[test]
    fn loss_ratio_over_window() {
        let mut w = HealthWindow::new(4);
        w.push(RTT);
        w.push(None);
        w.push(RTT);
        w.push(RTT);
        assert!(w.is_full());
        assert_eq!(w.loss_ratio(), 0.25);
        // Oldest reply slides out.
        w.push(None);
        assert_eq!(w.successes(), 2);
        assert_eq!(w.loss_ratio(), 0.5);
    }

    #[test]
    fn all_lost_is_full_loss() {
        let mut w = HealthWindow::new(3);
        for _ in 0..5 {
            w.push(None);
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.successes(), 0);
        assert_eq!(w.loss_ratio(), 1.0);
    }

    #[test]
    fn zero_capacity_clamps_to_one() {
        let mut w = HealthWindow::new(0);
        w.push(RTT);
        w.push(None);
        assert_eq!(w.len(), 1);
        assert_eq!(w.loss_ratio(), 1.0);
    }
}

use anyhow::Result;

/// Failover state of a link.
///
/// ```text
///        failures / loss          failures / hard-down / link-down
///   Up ───────────────▶ Degraded ─────────────────────────────▶ Down
///   ▲  ◀─────────────────  │                                      │
///   │     successes                                 first success │
///   │                                                             ▼
///   └──────────────── successes ─────────────────────────── Recovering
///                                       any failure: back to Down ┘
/// ```
///
/// Only `Up` and `Degraded` links carry traffic, and `Degraded` links only
/// when no `Up` link is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    #[default]
    Up,
    Degraded,
    Down,
    Recovering,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Degraded => "degraded",
            LinkState::Down => "down",
            LinkState::Recovering => "recovering",
        }
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self, LinkState::Up | LinkState::Degraded)
    }
}

/// A link capable of sending sealed frames.
///
/// Implemented by [`crate::net::transport::UdpLink`] and by mock links in
/// tests.
pub trait LinkSender: Send + Sync {
    /// Returns the unique identifier of this link.
    fn id(&self) -> usize;
    /// Sends one frame. Returns the number of bytes written.
    fn send(&self, frame: &[u8]) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_state_as_str_all_variants() {
        assert_eq!(LinkState::Up.as_str(), "up");
        assert_eq!(LinkState::Degraded.as_str(), "degraded");
        assert_eq!(LinkState::Down.as_str(), "down");
        assert_eq!(LinkState::Recovering.as_str(), "recovering");
    }

    #[test]
    fn only_up_and_degraded_are_eligible() {
        assert!(LinkState::Up.is_eligible());
        assert!(LinkState::Degraded.is_eligible());
        assert!(!LinkState::Down.is_eligible());
        assert!(!LinkState::Recovering.is_eligible());
    }
}

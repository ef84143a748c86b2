use parking_lot::RwLock;

use crate::config::HealthSettings;
use crate::protocol::NodeStats;

/// Per-node penalty score derived from pushed stats frames. Lower is
/// preferred. A node with no stats since (re)connect scores the baseline
/// so fresh nodes are tried first.
pub struct HealthTracker {
    settings: HealthSettings,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    score: f64,
    last_stats: Option<NodeStats>,
}

impl HealthTracker {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            settings,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Recomputes the score from a stats frame. Called once per push.
    pub fn on_stats(&self, stats: NodeStats) {
        let score = self.penalty(&stats);
        let mut inner = self.inner.write();
        inner.score = score;
        inner.last_stats = Some(stats);
    }

    /// Forgets everything; used when the control channel reconnects, since
    /// node-side counters restart and old stats no longer reflect reality.
    pub fn reset(&self) {
        *self.inner.write() = Inner::default();
    }

    pub fn score(&self) -> f64 {
        self.inner.read().score
    }

    pub fn last_stats(&self) -> Option<NodeStats> {
        self.inner.read().last_stats.clone()
    }

    /// The classic client-side penalty curve: one point per playing
    /// player, an exponential CPU term, and steep exponential terms for
    /// nulled/deficit frames. The weights are tunables; callers must only
    /// rely on relative ordering.
    fn penalty(&self, stats: &NodeStats) -> f64 {
        let player_penalty = stats.playing_players as f64;
        let cpu_penalty = 1.05f64.powf(100.0 * stats.cpu.system_load) * 10.0 - 10.0;

        let (null_penalty, deficit_penalty) = match stats.frame_stats {
            Some(frames) => {
                let nulled = frames.nulled.max(0) as f64;
                let deficit = frames.deficit.max(0) as f64;
                (
                    (1.03f64.powf(500.0 * (nulled / 3000.0)) * 600.0 - 600.0) * 2.0,
                    1.03f64.powf(500.0 * (deficit / 3000.0)) * 600.0 - 600.0,
                )
            }
            None => (0.0, 0.0),
        };

        self.settings.player_weight * player_penalty
            + self.settings.cpu_weight * cpu_penalty
            + self.settings.frame_weight * (null_penalty + deficit_penalty)
    }
}

//! Regional-to-central endpoint failover with stickiness.
//!
//! The regional relay is preferred when configured. Two consecutive
//! regional failures demote to central; after the stickiness window of
//! healthy central sends the regional endpoint is offered again. All
//! timing uses the monotonic clock.

use std::time::{Duration, Instant};

use tracing::{info, warn};

const DEMOTION_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Regional,
    Central,
}

pub struct Failover {
    has_regional: bool,
    stickiness: Duration,
    active: Target,
    regional_failures: u32,
    /// Start of the current healthy streak on central.
    central_healthy_since: Option<Instant>,
}

impl Failover {
    pub fn new(has_regional: bool, stickiness: Duration) -> Self {
        Failover {
            has_regional,
            stickiness,
            active: if has_regional { Target::Regional } else { Target::Central },
            regional_failures: 0,
            central_healthy_since: None,
        }
    }

    /// Endpoint to use for the next emission.
    pub fn target(&self) -> Target {
        self.active
    }

    pub fn record(&mut self, target: Target, success: bool) {
        self.record_at(target, success, Instant::now());
    }

    fn record_at(&mut self, target: Target, success: bool, now: Instant) {
        match (target, success) {
            (Target::Regional, true) => {
                self.regional_failures = 0;
            }
            (Target::Regional, false) => {
                self.regional_failures += 1;
                if self.regional_failures >= DEMOTION_THRESHOLD && self.active == Target::Regional {
                    warn!(
                        failures = self.regional_failures,
                        "regional endpoint unhealthy, failing over to central"
                    );
                    self.active = Target::Central;
                    self.central_healthy_since = None;
                }
            }
            (Target::Central, true) => {
                if !self.has_regional {
                    return;
                }
                let since = *self.central_healthy_since.get_or_insert(now);
                if now.duration_since(since) >= self.stickiness {
                    info!("stickiness elapsed, promoting regional endpoint again");
                    self.active = Target::Regional;
                    self.regional_failures = 0;
                    self.central_healthy_since = None;
                }
            }
            (Target::Central, false) => {
                // central trouble resets the streak; there is nowhere
                // further to fall back to, retry/buffering handles it
                self.central_healthy_since = None;
            }
        }
    }
}

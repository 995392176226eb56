//! Sliding-window rate limiting stage.
//!
//! Two families of windows: one per configured tool, plus a global bucket
//! under the `"_global"` key. Only inbound `tools/call` messages on a
//! non-halted context are counted. The per-tool check runs before the global
//! one, so a tool-scoped denial is attributed to the tool.

use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::{RateLimit, RateLimitConfig};
use crate::{Direction, Verdict};

use super::{FilterContext, FilterError, FilterStage};

/// Window key for the global bucket.
pub const GLOBAL_KEY: &str = "_global";

/// The rate limiting stage.
///
/// The window map is sharded (`DashMap`); each window's timestamp list has
/// its own lock, so two tools never contend.
pub struct RateLimitStage {
    config: RateLimitConfig,
    windows: DashMap<String, Mutex<Vec<Instant>>>,
}

impl RateLimitStage {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Prune, test, and record one request against a window at time `now`.
    ///
    /// Timestamps older than `now − window` are dropped; equal-age ones are
    /// kept, so a zero-width window still counts same-instant requests.
    fn allow_at(&self, key: &str, limit: RateLimit, now: Instant) -> bool {
        let window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Vec::new()));
        let mut timestamps = window.lock();

        let cutoff = now.checked_sub(limit.window);
        timestamps.retain(|&ts| match cutoff {
            Some(cutoff) => ts >= cutoff,
            // The window reaches past the start of time: keep everything.
            None => true,
        });

        if timestamps.len() >= limit.max {
            return false;
        }
        timestamps.push(now);
        true
    }
}

#[async_trait]
impl FilterStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn process(&self, fc: &mut FilterContext) -> Result<(), FilterError> {
        if fc.direction != Direction::Inbound || fc.halted || fc.method != "tools/call" {
            return Ok(());
        }

        let now = Instant::now();

        if !fc.tool.is_empty() {
            if let Some(&limit) = self.config.per_tool.get(&fc.tool) {
                if !self.allow_at(&fc.tool, limit, now) {
                    fc.verdict = Verdict::Deny;
                    fc.matched_rule = format!("rate_limit:{}", fc.tool);
                    fc.verdict_message = format!(
                        "rate limit exceeded for tool {:?}: max {} per {:?}",
                        fc.tool, limit.max, limit.window
                    );
                    fc.halted = true;
                    return Ok(());
                }
            }
        }

        if let Some(limit) = self.config.global {
            if !self.allow_at(GLOBAL_KEY, limit, now) {
                fc.verdict = Verdict::Deny;
                fc.matched_rule = "rate_limit:global".to_string();
                fc.verdict_message = format!(
                    "global rate limit exceeded: max {} per {:?}",
                    limit.max, limit.window
                );
                fc.halted = true;
            }
        }

        Ok(())
    }
}

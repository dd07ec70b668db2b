//! Wall-clock and CPU-time enforcement for a single execution.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;

use crate::config::{LimitKind, ResourceLimits};
use crate::engine::Enforcer;
use crate::output::OutputChannel;

/// Watches execution `generation` until it finishes or breaches a limit.
///
/// On breach the channel is told first, then the context is terminated, so
/// the breach notice is already in place when the reader sees the stream end.
pub(crate) fn spawn_watchdog(
    limits: ResourceLimits,
    enforcer: Arc<dyn Enforcer>,
    channel: Arc<OutputChannel>,
    generation: u64,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let cpu_baseline = enforcer.cpu_time();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !channel.is_current(generation) {
                return;
            }

            let cpu_used = match (cpu_baseline, enforcer.cpu_time()) {
                (Some(base), Some(now)) => Some(now.saturating_sub(base)),
                _ => None,
            };
            if let Some(kind) = exceeded(&limits, started.elapsed(), cpu_used) {
                if channel.breach(generation, kind) {
                    warn!(generation, "[MONITOR] {} limit exceeded, terminating worker", kind);
                    enforcer.terminate();
                }
                return;
            }
        }
    })
}

/// The first watchdog-enforced limit that usage has gone over
pub(crate) fn exceeded(
    limits: &ResourceLimits,
    elapsed: Duration,
    cpu_used: Option<Duration>,
) -> Option<LimitKind> {
    if let (Some(max), Some(used)) = (limits.max_cpu_time(), cpu_used) {
        if used > max {
            return Some(LimitKind::CpuTime);
        }
    }
    match limits.max_wall_time() {
        Some(max) if elapsed > max => Some(LimitKind::WallTime),
        _ => None,
    }
}

//! Core shared state
//!
//! The legacy implementation scattered its runtime state across process-wide
//! statics. Here it is one [`CoreState`] handle composed of concurrent maps,
//! created by `init()` at startup and passed into every component; tests can
//! build as many isolated instances as they like.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::cache::RealtimeCache;
use crate::model::DeviceId;
use crate::session::SessionPool;
use crate::transport::PortRegistry;

/// Identifies one writable setpoint target: device plus register address.
pub type SetpointKey = (DeviceId, u16);

/// A gradual setpoint transition in progress.
#[derive(Debug, Clone)]
pub struct SetpointTransition {
    /// Value the ramp started from
    pub start_value: f64,
    /// Value the ramp ends at
    pub target_value: f64,
    /// When the ramp started
    pub started_at: Instant,
    /// Total ramp length
    pub duration: Duration,
}

impl SetpointTransition {
    /// Linearly interpolated value at `now`, clamped to the target once
    /// the ramp has run its course.
    pub fn value_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started_at);
        if elapsed >= self.duration || self.duration.is_zero() {
            return self.target_value;
        }
        let fraction = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        self.start_value + (self.target_value - self.start_value) * fraction
    }

    /// True once the ramp has reached its target.
    pub fn is_complete(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) >= self.duration
    }
}

/// Shared runtime state for the gateway core.
#[derive(Debug)]
pub struct CoreState {
    /// Latest reading per device
    pub cache: RealtimeCache,
    /// Serial-port exclusivity registry
    pub ports: Arc<PortRegistry>,
    /// One session per device, shared by poller and setpoint manager
    pub sessions: SessionPool,
    /// Last value written per setpoint target
    pub setpoints: DashMap<SetpointKey, f64>,
    /// Ramps currently in progress
    pub transitions: DashMap<SetpointKey, SetpointTransition>,
}

impl CoreState {
    /// Create fresh state at startup.
    pub fn init() -> Arc<Self> {
        Arc::new(Self {
            cache: RealtimeCache::new(),
            ports: Arc::new(PortRegistry::new()),
            sessions: SessionPool::new(),
            setpoints: DashMap::new(),
            transitions: DashMap::new(),
        })
    }

    /// Drop all runtime state on exit: close pooled sessions (which
    /// releases their port slots) and clear every map.
    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
        self.cache.clear();
        self.setpoints.clear();
        self.transitions.clear();
    }
}

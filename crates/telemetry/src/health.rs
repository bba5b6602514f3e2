//! Broker and store health, as last observed by the worker.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ComponentState {
    /// Not checked yet
    Unknown,
    Up,
    Down(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub name: String,
    pub state: ComponentState,
    pub changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct ComponentHealth {
    name: &'static str,
    inner: RwLock<(ComponentState, Option<DateTime<Utc>>)>,
}

impl ComponentHealth {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new((ComponentState::Unknown, None)),
        }
    }

    fn transition(&self, next: ComponentState) {
        let mut inner = self.inner.write();
        if inner.0 != next {
            *inner = (next, Some(Utc::now()));
        }
    }

    pub fn set_healthy(&self) {
        self.transition(ComponentState::Up);
    }

    pub fn set_unhealthy(&self, reason: impl Into<String>) {
        self.transition(ComponentState::Down(reason.into()));
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.read().0 == ComponentState::Up
    }

    pub fn state(&self) -> ComponentState {
        self.inner.read().0.clone()
    }

    pub fn snapshot(&self) -> ComponentSnapshot {
        let (state, changed_at) = self.inner.read().clone();
        ComponentSnapshot {
            name: self.name.to_string(),
            state,
            changed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentSnapshot>,
}

/// Updated by the queue client on every connection change and by the
/// binary's start-up checks.
#[derive(Debug)]
pub struct HealthRegistry {
    pub broker: ComponentHealth,
    pub store: ComponentHealth,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self {
            broker: ComponentHealth::new("broker"),
            store: ComponentHealth::new("store"),
        }
    }
}

impl HealthRegistry {
    pub fn report(&self) -> HealthReport {
        let components = vec![self.broker.snapshot(), self.store.snapshot()];
        let up = components
            .iter()
            .filter(|c| c.state == ComponentState::Up)
            .count();

        let status = if up == components.len() {
            HealthStatus::Healthy
        } else if up == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport { status, components }
    }
}

static HEALTH: LazyLock<HealthRegistry> = LazyLock::new(HealthRegistry::default);

pub fn health() -> &'static HealthRegistry {
    &HEALTH
}

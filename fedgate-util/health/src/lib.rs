use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use fedgate_core::err::{Error, Result};
use fedgate_logging::{info, warn};
use serde::{Deserialize, Serialize};

/// Stores the health status of each subsystem
#[derive(Clone)]
pub struct Health {
    /// Mapping of the subsytem name to the healthy status
    state: Arc<RwLock<HashMap<String, HealthStatus>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    /// Is the system healthy?
    pub healthy: bool,
    /// When was it last checked?
    pub checked: DateTime<Utc>,
    /// When was it last healthy?
    pub last_healthy: Option<DateTime<Utc>>,
}

impl Health {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns a copy of the health state
    pub fn check(&self) -> Result<HashMap<String, HealthStatus>> {
        Ok(self
            .state
            .read()
            .map_err(|_| Error::msg("Failed to lock health state"))?
            .clone())
    }

    /// Updates the health status of a system
    pub fn update(&self, subsystem: &str, healthy: bool) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::msg("Failed to lock health state"))?;

        let now = Utc::now();

        match state.entry(subsystem.into()) {
            Entry::Occupied(mut s) => {
                let s = s.get_mut();

                match (s.healthy, healthy) {
                    (true, false) => warn!("Subsystem '{subsystem}' changed to unhealthy"),
                    (false, true) => info!("Subsystem '{subsystem}' changed to healthy"),
                    _ => {}
                }

                s.healthy = healthy;
                s.checked = now;
                if healthy {
                    s.last_healthy = Some(now)
                }
            }
            Entry::Vacant(s) => {
                s.insert(HealthStatus {
                    healthy,
                    checked: now,
                    last_healthy: if healthy { Some(now) } else { None },
                });
            }
        }

        Ok(())
    }

    /// Whether every tracked subsystem is currently healthy
    pub fn all_healthy(&self) -> Result<bool> {
        Ok(self.check()?.values().all(|s| s.healthy))
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_update_and_check() {
        let health = Health::new();

        health.update("Pool", true).unwrap();
        health.update("Engine", false).unwrap();

        let state = health.check().unwrap();
        assert!(state["Pool"].healthy);
        assert!(!state["Engine"].healthy);
        assert!(state["Pool"].last_healthy.is_some());
        assert!(state["Engine"].last_healthy.is_none());
        assert!(!health.all_healthy().unwrap());
    }

    #[test]
    fn test_health_transition_updates_last_healthy() {
        let health = Health::new();

        health.update("Engine", false).unwrap();
        health.update("Engine", true).unwrap();

        let state = health.check().unwrap();
        assert!(state["Engine"].healthy);
        assert!(state["Engine"].last_healthy.is_some());
    }
}

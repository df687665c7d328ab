use crate::probe::ObservedState;
use crate::sys::ProcessMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Unknown,
    Stopped,
    Running,
    Pending,
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Unknown => write!(f, "unknown"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Error => write!(f, "error"),
        }
    }
}

impl From<ObservedState> for ServiceState {
    fn from(observed: ObservedState) -> Self {
        match observed {
            ObservedState::Running => ServiceState::Running,
            ObservedState::Stopped => ServiceState::Stopped,
            ObservedState::Unknown => ServiceState::Unknown,
        }
    }
}

/// Live per-service record. Only the supervisor mutates it; everyone else
/// gets a [`ServiceSnapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub last_updated: DateTime<Utc>,
    pub process: Option<ProcessMetadata>,
}

impl ServiceStatus {
    pub fn unknown() -> Self {
        Self {
            state: ServiceState::Unknown,
            last_updated: Utc::now(),
            process: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub id: String,
    pub display_name: String,
    pub state: ServiceState,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDetail {
    pub id: String,
    pub display_name: String,
    pub service_name: String,
    pub state: ServiceState,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    pub ports: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_state_display() {
        assert_eq!(ServiceState::Unknown.to_string(), "unknown");
        assert_eq!(ServiceState::Stopped.to_string(), "stopped");
        assert_eq!(ServiceState::Running.to_string(), "running");
        assert_eq!(ServiceState::Pending.to_string(), "pending");
        assert_eq!(ServiceState::Error.to_string(), "error");
    }

    #[test]
    fn test_observed_state_maps() {
        assert_eq!(ServiceState::from(ObservedState::Running), ServiceState::Running);
        assert_eq!(ServiceState::from(ObservedState::Stopped), ServiceState::Stopped);
        assert_eq!(ServiceState::from(ObservedState::Unknown), ServiceState::Unknown);
    }

    #[test]
    fn test_snapshot_json_skips_missing_process() {
        let snapshot = ServiceSnapshot {
            id: "apache".to_string(),
            display_name: "Apache".to_string(),
            state: ServiceState::Stopped,
            last_updated: Utc::now(),
            process: None,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "stopped");
        assert!(json.get("process").is_none());
    }
}

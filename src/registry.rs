use crate::config::{ServiceConfig, StackConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Start/stop/status templates bound to one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSet {
    pub status: String,
    pub start: String,
    pub stop: String,
}

/// Immutable identity and bindings of one managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub display_name: String,
    pub service_name: String,
    pub ports: Vec<u16>,
    pub process_name: Option<String>,
    pub commands: CommandSet,
}

impl ServiceDescriptor {
    fn from_config(service: &ServiceConfig, config: &StackConfig) -> Self {
        let bindings = &config.commands;
        Self {
            id: service.id.clone(),
            display_name: service.display_name.clone(),
            service_name: service.service_name.clone(),
            ports: service.ports.clone(),
            process_name: service.process_name.clone(),
            commands: CommandSet {
                status: service.status.clone().unwrap_or_else(|| bindings.status.clone()),
                start: service.start.clone().unwrap_or_else(|| bindings.start.clone()),
                stop: service.stop.clone().unwrap_or_else(|| bindings.stop.clone()),
            },
        }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown service: {0}")]
    NotFound(String),
}

/// Fixed, ordered catalog of managed services.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<ServiceDescriptor>>,
    index: HashMap<String, usize>,
}

impl ServiceRegistry {
    /// Build from descriptors; a later duplicate id is ignored.
    pub fn new(descriptors: Vec<ServiceDescriptor>) -> Self {
        let mut services = Vec::with_capacity(descriptors.len());
        let mut index = HashMap::new();
        for descriptor in descriptors {
            if index.contains_key(&descriptor.id) {
                tracing::warn!(id = %descriptor.id, "duplicate service id ignored");
                continue;
            }
            index.insert(descriptor.id.clone(), services.len());
            services.push(Arc::new(descriptor));
        }
        Self { services, index }
    }

    pub fn from_config(config: &StackConfig) -> Self {
        Self::new(
            config
                .services
                .iter()
                .map(|s| ServiceDescriptor::from_config(s, config))
                .collect(),
        )
    }

    pub fn all(&self) -> &[Arc<ServiceDescriptor>] {
        &self.services
    }

    pub fn get(&self, id: &str) -> Result<&Arc<ServiceDescriptor>, RegistryError> {
        self.index
            .get(id)
            .map(|&i| &self.services[i])
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

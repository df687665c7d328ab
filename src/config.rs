use crate::probe;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RESTART_SETTLE_MS: u64 = 2000;
pub const DEFAULT_START_STAGGER_MS: u64 = 1000;
pub const DEFAULT_RESTART_STAGGER_MS: u64 = 2000;
pub const DEFAULT_STOP_STAGGER_MS: u64 = 0;
pub const DEFAULT_UNKNOWN_THRESHOLD: u32 = 3;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

// ---------------------------------------------------------------------------
// Supervisor settings
// ---------------------------------------------------------------------------

/// Timing knobs for the reconciliation loop and control operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSettings {
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub restart_settle_ms: u64,
    pub start_stagger_ms: u64,
    pub restart_stagger_ms: u64,
    pub stop_stagger_ms: u64,
    pub unknown_threshold: u32,
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            restart_settle_ms: DEFAULT_RESTART_SETTLE_MS,
            start_stagger_ms: DEFAULT_START_STAGGER_MS,
            restart_stagger_ms: DEFAULT_RESTART_STAGGER_MS,
            stop_stagger_ms: DEFAULT_STOP_STAGGER_MS,
            unknown_threshold: DEFAULT_UNKNOWN_THRESHOLD,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl SupervisorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Platform command bindings
// ---------------------------------------------------------------------------

/// How the OS service manager is queried and driven. `{service}` in a
/// template is replaced with the descriptor's OS service name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandBindings {
    pub status: String,
    pub start: String,
    pub stop: String,
    pub running_markers: Vec<String>,
    pub stopped_markers: Vec<String>,
    pub already_started_markers: Vec<String>,
    pub already_stopped_markers: Vec<String>,
}

impl Default for CommandBindings {
    fn default() -> Self {
        if cfg!(windows) {
            Self::windows()
        } else {
            Self::systemd()
        }
    }
}

impl CommandBindings {
    pub fn windows() -> Self {
        Self {
            status: "sc query {service}".to_string(),
            start: "net start {service}".to_string(),
            stop: "net stop {service}".to_string(),
            running_markers: vec!["RUNNING".to_string()],
            stopped_markers: vec!["STOPPED".to_string()],
            already_started_markers: vec!["already been started".to_string()],
            already_stopped_markers: vec!["is not started".to_string()],
        }
    }

    pub fn systemd() -> Self {
        Self {
            status: "systemctl is-active {service}".to_string(),
            start: "systemctl start {service}".to_string(),
            stop: "systemctl stop {service}".to_string(),
            running_markers: vec!["active".to_string()],
            stopped_markers: vec!["inactive".to_string(), "failed".to_string()],
            already_started_markers: Vec::new(),
            already_stopped_markers: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub id: String,
    pub display_name: String,
    pub service_name: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
}

impl ServiceConfig {
    fn new(id: &str, display_name: &str, service_name: &str, ports: &[u16], process: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            service_name: service_name.to_string(),
            ports: ports.to_vec(),
            process_name: Some(process.to_string()),
            status: None,
            start: None,
            stop: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub commands: CommandBindings,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::default_stack()
    }
}

impl StackConfig {
    /// The stock web stack: web server, PHP process manager, database and
    /// mail catcher, bound to the platform's native service names.
    pub fn default_stack() -> Self {
        let services = if cfg!(windows) {
            vec![
                ServiceConfig::new(
                    "apache",
                    "Apache HTTP Server",
                    "IsotoneApache",
                    &[80, 443],
                    "httpd.exe",
                ),
                ServiceConfig::new("php", "PHP FastCGI", "IsotonePHP", &[9000], "php-cgi.exe"),
                ServiceConfig::new(
                    "mariadb",
                    "MariaDB",
                    "IsotoneMariaDB",
                    &[3306],
                    "mysqld.exe",
                ),
                ServiceConfig::new(
                    "mailpit",
                    "Mailpit",
                    "IsotoneMailpit",
                    &[1025, 8025],
                    "mailpit.exe",
                ),
            ]
        } else {
            vec![
                ServiceConfig::new(
                    "apache",
                    "Apache HTTP Server",
                    "apache2",
                    &[80, 443],
                    "apache2",
                ),
                ServiceConfig::new("php", "PHP-FPM", "php-fpm", &[9000], "php-fpm"),
                ServiceConfig::new("mariadb", "MariaDB", "mariadb", &[3306], "mariadbd"),
                ServiceConfig::new("mailpit", "Mailpit", "mailpit", &[1025, 8025], "mailpit"),
            ]
        };

        Self {
            log_level: default_log_level(),
            supervisor: SupervisorSettings::default(),
            commands: CommandBindings::default(),
            services,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }

        for (field, template) in [
            ("commands.status", &self.commands.status),
            ("commands.start", &self.commands.start),
            ("commands.stop", &self.commands.stop),
        ] {
            check_template("*", field, template)?;
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.id.trim().is_empty() {
                return Err(ConfigError::EmptyId);
            }
            if !seen.insert(service.id.as_str()) {
                return Err(ConfigError::DuplicateId(service.id.clone()));
            }
            if service.ports.contains(&0) {
                return Err(ConfigError::InvalidPort(service.id.clone()));
            }
            for (field, template) in [
                ("status", &service.status),
                ("start", &service.start),
                ("stop", &service.stop),
            ] {
                if let Some(template) = template {
                    check_template(&service.id, field, template)?;
                }
            }
        }

        Ok(())
    }

    /// Distinct ports of all services, in catalog order.
    pub fn ports(&self) -> Vec<u16> {
        let mut seen = HashSet::new();
        self.services
            .iter()
            .flat_map(|s| s.ports.iter().copied())
            .filter(|p| seen.insert(*p))
            .collect()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}

fn check_template(service: &str, field: &str, template: &str) -> Result<(), ConfigError> {
    probe::parse_command(template).map_err(|e| ConfigError::InvalidTemplate {
        service: service.to_string(),
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("no services configured")]
    NoServices,
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("service id must not be empty")]
    EmptyId,
    #[error("duplicate service id `{0}`")]
    DuplicateId(String),
    #[error("service `{0}` lists port 0")]
    InvalidPort(String),
    #[error("invalid `{field}` command for `{service}`: {reason}")]
    InvalidTemplate {
        service: String,
        field: String,
        reason: String,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(String),
    #[error("config file already exists: {0}")]
    AlreadyExists(String),
    #[error("{0}")]
    IoError(String),
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_config(path: &Path) -> Result<StackConfig, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
    parse_config(&content)
}

/// Load `path`, falling back to the built-in stack when it does not exist.
pub fn load_or_default(path: &Path) -> Result<StackConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using built-in stack");
        return Ok(StackConfig::default_stack());
    }
    load_config(path)
}

pub fn parse_config(content: &str) -> Result<StackConfig, ConfigError> {
    let config: StackConfig =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Write the built-in stack to `path`. Never overwrites.
pub fn write_default(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.display().to_string()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", parent.display(), e)))?;
    }
    let content = StackConfig::default_stack().to_toml()?;
    std::fs::write(path, content)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_valid_toml_parses() {
        let input = r#"
log_level = "debug"

[supervisor]
poll_interval_ms = 1000
restart_settle_ms = 500
unknown_threshold = 5

[commands]
status = "sc query {service}"
start = "net start {service}"
stop = "net stop {service}"
running_markers = ["RUNNING"]
stopped_markers = ["STOPPED"]
already_started_markers = ["already been started"]
already_stopped_markers = ["is not started"]

[[service]]
id = "apache"
display_name = "Apache"
service_name = "IsotoneApache"
ports = [80, 443]
process_name = "httpd.exe"

[[service]]
id = "mariadb"
display_name = "MariaDB"
service_name = "IsotoneMariaDB"
ports = [3306]
start = "net start {service} /y"
"#;
        let config = parse_config(input).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.supervisor.poll_interval_ms, 1000);
        assert_eq!(config.supervisor.restart_settle_ms, 500);
        assert_eq!(config.supervisor.unknown_threshold, 5);
        assert_eq!(
            config.supervisor.probe_timeout_ms,
            DEFAULT_PROBE_TIMEOUT_MS
        );
        assert_eq!(config.commands, CommandBindings::windows());

        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].id, "apache");
        assert_eq!(config.services[0].ports, vec![80, 443]);
        assert_eq!(config.services[0].process_name.as_deref(), Some("httpd.exe"));
        assert_eq!(config.services[1].id, "mariadb");
        assert_eq!(
            config.services[1].start.as_deref(),
            Some("net start {service} /y")
        );
        assert!(config.services[1].stop.is_none());
    }

    #[test]
    fn test_service_order_preserved() {
        let input = r#"
[[service]]
id = "zeta"
display_name = "Z"
service_name = "z"

[[service]]
id = "alpha"
display_name = "A"
service_name = "a"

[[service]]
id = "mid"
display_name = "M"
service_name = "m"
"#;
        let config = parse_config(input).unwrap();
        let ids: Vec<_> = config.services.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_missing_service_name_errors() {
        let input = r#"
[[service]]
id = "apache"
display_name = "Apache"
"#;
        let result = parse_config(input);
        assert!(matches!(result.unwrap_err(), ConfigError::TomlParse(_)));
    }

    #[test]
    fn test_unknown_field_errors() {
        let input = r#"
[[service]]
id = "apache"
display_name = "Apache"
service_name = "apache2"
bogus_field = "x"
"#;
        assert!(matches!(
            parse_config(input).unwrap_err(),
            ConfigError::TomlParse(_)
        ));
    }

    #[test]
    fn test_empty_file_errors() {
        assert_eq!(parse_config("").unwrap_err(), ConfigError::NoServices);
    }

    #[test]
    fn test_duplicate_id_errors() {
        let input = r#"
[[service]]
id = "web"
display_name = "A"
service_name = "a"

[[service]]
id = "web"
display_name = "B"
service_name = "b"
"#;
        assert_eq!(
            parse_config(input).unwrap_err(),
            ConfigError::DuplicateId("web".to_string())
        );
    }

    #[test]
    fn test_blank_id_errors() {
        let input = r#"
[[service]]
id = "  "
display_name = "A"
service_name = "a"
"#;
        assert_eq!(parse_config(input).unwrap_err(), ConfigError::EmptyId);
    }

    #[test]
    fn test_zero_port_errors() {
        let input = r#"
[[service]]
id = "web"
display_name = "A"
service_name = "a"
ports = [80, 0]
"#;
        assert_eq!(
            parse_config(input).unwrap_err(),
            ConfigError::InvalidPort("web".to_string())
        );
    }

    #[test]
    fn test_empty_template_errors() {
        let input = r#"
[[service]]
id = "web"
display_name = "A"
service_name = "a"
start = "   "
"#;
        match parse_config(input).unwrap_err() {
            ConfigError::InvalidTemplate { service, field, .. } => {
                assert_eq!(service, "web");
                assert_eq!(field, "start");
            }
            other => panic!("expected InvalidTemplate, got {other:?}"),
        }
    }

    #[test]
    fn test_unbalanced_quote_in_global_template_errors() {
        let input = r#"
[commands]
stop = "systemctl stop '{service}"

[[service]]
id = "web"
display_name = "A"
service_name = "a"
"#;
        assert!(matches!(
            parse_config(input).unwrap_err(),
            ConfigError::InvalidTemplate { .. }
        ));
    }

    #[test]
    fn test_default_stack_is_valid() {
        let config = StackConfig::default_stack();
        config.validate().unwrap();
        let ids: Vec<_> = config.services.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["apache", "php", "mariadb", "mailpit"]);
        assert_eq!(config.ports(), vec![80, 443, 9000, 3306, 1025, 8025]);
    }

    #[test]
    fn test_ports_deduplicated() {
        let input = r#"
[[service]]
id = "a"
display_name = "A"
service_name = "a"
ports = [80, 443]

[[service]]
id = "b"
display_name = "B"
service_name = "b"
ports = [443, 8080]
"#;
        assert_eq!(parse_config(input).unwrap().ports(), vec![80, 443, 8080]);
    }

    #[test]
    fn test_settings_durations() {
        let settings = SupervisorSettings {
            poll_interval_ms: 250,
            restart_settle_ms: 10,
            ..SupervisorSettings::default()
        };
        assert_eq!(settings.poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.restart_settle(), Duration::from_millis(10));
        assert_eq!(settings.probe_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_default_stack_toml_roundtrips() {
        let config = StackConfig::default_stack();
        let text = config.to_toml().unwrap();
        assert_eq!(parse_config(&text).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, StackConfig::default_stack());
    }

    #[test]
    fn test_load_config_missing_file_errors() {
        let dir = tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn test_write_default_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("stackpanel.toml");
        write_default(&path).unwrap();
        assert!(path.exists());
        assert_eq!(load_config(&path).unwrap(), StackConfig::default_stack());

        assert!(matches!(
            write_default(&path).unwrap_err(),
            ConfigError::AlreadyExists(_)
        ));
    }
}

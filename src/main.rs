use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser};
use color_eyre::eyre::bail;
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use serde::Serialize;
use stackpanel::cli::{Cli, Command};
use stackpanel::config::{self, StackConfig};
use stackpanel::events::StatusChangeEvent;
use stackpanel::paths::Paths;
use stackpanel::ports::{self, PortStatus};
use stackpanel::probe::{CommandBackend, OutputRules};
use stackpanel::registry::ServiceRegistry;
use stackpanel::status::{ServiceDetail, ServiceSnapshot, ServiceState};
use stackpanel::supervisor::{BatchEntry, BatchReport, ControlAction, ControlResult, Supervisor};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "STACKPANEL_LOG";

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let config_path = match cli.config {
        Some(path) => path,
        None => Paths::new()?.config_file(),
    };

    match command {
        Command::Init => {
            config::write_default(&config_path)?;
            println!("{} {}", "wrote".green(), config_path.display());
        }
        Command::Status => {
            let stack = Stack::load(&config_path)?;
            stack.supervisor.reconcile_once().await;
            let services = stack.supervisor.list_services();
            if cli.json {
                print_json(&services)?;
            } else {
                print_services(&services);
            }
        }
        Command::Start { ids } => {
            let stack = Stack::load(&config_path)?;
            control(&stack.supervisor, ControlAction::Start, ids, cli.json).await?
        }
        Command::Stop { ids } => {
            let stack = Stack::load(&config_path)?;
            control(&stack.supervisor, ControlAction::Stop, ids, cli.json).await?
        }
        Command::Restart { ids } => {
            let stack = Stack::load(&config_path)?;
            control(&stack.supervisor, ControlAction::Restart, ids, cli.json).await?
        }
        Command::Detail { id } => {
            let stack = Stack::load(&config_path)?;
            stack.supervisor.reconcile_once().await;
            let detail = stack.supervisor.get_service_detail(&id).await?;
            if cli.json {
                print_json(&detail)?;
            } else {
                print_detail(&detail);
            }
        }
        Command::Ports => {
            let stack = Stack::load(&config_path)?;
            let statuses = ports::scan_ports(&stack.config.ports()).await;
            if cli.json {
                print_json(&statuses)?;
            } else {
                print_ports(&statuses, &stack.config);
            }
        }
        Command::Watch => {
            let stack = Stack::load(&config_path)?;
            watch(&stack.supervisor, cli.json).await?
        }
    }

    Ok(())
}

/// A loaded config and the supervisor built from it.
struct Stack {
    config: StackConfig,
    supervisor: Supervisor,
}

impl Stack {
    fn load(path: &Path) -> color_eyre::Result<Self> {
        let config = config::load_or_default(path)?;
        init_tracing(&config.log_level);
        let supervisor = build_supervisor(&config);
        Ok(Self { config, supervisor })
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_LEVEL));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_supervisor(config: &StackConfig) -> Supervisor {
    let registry = Arc::new(ServiceRegistry::from_config(config));
    let backend = CommandBackend::new(
        OutputRules::from(&config.commands),
        config.supervisor.probe_timeout(),
        config.supervisor.command_timeout(),
    );
    Supervisor::new(registry, Arc::new(backend), config.supervisor.clone())
}

async fn control(
    supervisor: &Supervisor,
    action: ControlAction,
    ids: Vec<String>,
    json: bool,
) -> color_eyre::Result<()> {
    let report = match Command::optional_ids(ids) {
        None => supervisor.control_all_and_wait(action).await,
        Some(ids) => {
            let mut entries = Vec::with_capacity(ids.len());
            for id in ids {
                let entry = match supervisor.control_and_wait(&id, action).await {
                    Ok(report) => BatchEntry::Completed(report),
                    Err(rejection) => BatchEntry::Rejected {
                        service_id: id,
                        rejection,
                    },
                };
                entries.push(entry);
            }
            BatchReport { action, entries }
        }
    };

    if json {
        print_json(&report)?;
    } else {
        print_batch(&report);
    }

    let failed = report.entries.iter().filter(|e| !entry_ok(e)).count();
    if failed > 0 {
        bail!("{action} failed for {failed} service(s)");
    }
    Ok(())
}

async fn watch(supervisor: &Supervisor, json: bool) -> color_eyre::Result<()> {
    let (_subscription, mut events) = supervisor.subscribe_channel();
    supervisor.start();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                if json {
                    print_json(&event)?;
                } else {
                    print_event(&event);
                }
            }
            _ = signal_shutdown() => {
                break;
            }
        }
    }

    if !supervisor.stop().await {
        eprintln!("{}", "timed out waiting for in-flight operations".yellow());
    }
    Ok(())
}

#[cfg(unix)]
async fn signal_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut sigterm), Ok(mut sigint)) =
        (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
    else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn signal_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn entry_ok(entry: &BatchEntry) -> bool {
    matches!(
        entry,
        BatchEntry::Completed(report) if !matches!(report.result, ControlResult::Failed(_))
    )
}

fn state_color(state: ServiceState) -> Color {
    match state {
        ServiceState::Running => Color::Green,
        ServiceState::Pending => Color::Yellow,
        ServiceState::Unknown => Color::Magenta,
        ServiceState::Stopped => Color::Reset,
        ServiceState::Error => Color::Red,
    }
}

fn colored_state(state: ServiceState) -> String {
    let s = state.to_string();
    match state {
        ServiceState::Running => s.green().to_string(),
        ServiceState::Pending => s.yellow().to_string(),
        ServiceState::Unknown => s.magenta().to_string(),
        ServiceState::Stopped => s,
        ServiceState::Error => s.red().to_string(),
    }
}

fn print_services(services: &[ServiceSnapshot]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("id").add_attribute(Attribute::Bold),
        Cell::new("name").add_attribute(Attribute::Bold),
        Cell::new("status").add_attribute(Attribute::Bold),
        Cell::new("pid").add_attribute(Attribute::Bold),
        Cell::new("cpu").add_attribute(Attribute::Bold),
        Cell::new("mem").add_attribute(Attribute::Bold),
        Cell::new("updated").add_attribute(Attribute::Bold),
    ]);
    let now = Utc::now();
    for s in services {
        let process = s.process.as_ref();
        let pid = process
            .map(|p| p.pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&s.id).fg(Color::Cyan),
            Cell::new(&s.display_name),
            Cell::new(s.state.to_string()).fg(state_color(s.state)),
            Cell::new(&pid),
            Cell::new(format_percent(process.map(|p| p.cpu_percent))),
            Cell::new(format_percent(process.map(|p| p.memory_percent))),
            Cell::new(format_age(s.last_updated, now)),
        ]);
    }
    println!("{table}");
}

fn print_detail(detail: &ServiceDetail) {
    println!(
        "{} ({}): {}",
        detail.id.cyan().bold(),
        detail.display_name,
        colored_state(detail.state)
    );
    println!("  {} {}", "service:".dimmed(), detail.service_name);
    if let Some(pid) = detail.pid {
        println!("  {} {pid}", "pid:".dimmed());
    }
    println!("  {} {}", "cpu:".dimmed(), format_percent(detail.cpu_percent));
    println!(
        "  {} {}",
        "memory:".dimmed(),
        format_percent(detail.memory_percent)
    );
    if !detail.ports.is_empty() {
        let ports: Vec<String> = detail.ports.iter().map(|p| p.to_string()).collect();
        println!("  {} {}", "ports:".dimmed(), ports.join(", "));
    }
    println!(
        "  {} {}",
        "updated:".dimmed(),
        format_age(detail.last_updated, Utc::now())
    );
}

fn print_ports(statuses: &[PortStatus], config: &StackConfig) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("port").add_attribute(Attribute::Bold),
        Cell::new("service").add_attribute(Attribute::Bold),
        Cell::new("in use").add_attribute(Attribute::Bold),
        Cell::new("owner").add_attribute(Attribute::Bold),
    ]);
    for p in statuses {
        let services: Vec<&str> = config
            .services
            .iter()
            .filter(|s| s.ports.contains(&p.port))
            .map(|s| s.id.as_str())
            .collect();
        let in_use = if p.in_use {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no")
        };
        table.add_row(vec![
            Cell::new(p.port),
            Cell::new(services.join(", ")).fg(Color::Cyan),
            in_use,
            Cell::new(p.owner.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");
}

fn print_batch(report: &BatchReport) {
    for entry in &report.entries {
        match entry {
            BatchEntry::Completed(r) => match &r.result {
                ControlResult::Succeeded => {
                    println!("{} {}", format!("{}:", report.action).green(), r.service_id);
                }
                ControlResult::AlreadyInDesiredState => {
                    println!(
                        "{} {} (already {})",
                        format!("{}:", report.action).green(),
                        r.service_id,
                        r.final_state
                    );
                }
                ControlResult::Failed(message) => {
                    eprintln!(
                        "{} {} {}: {message} (now {})",
                        "error:".red().bold(),
                        report.action,
                        r.service_id,
                        r.final_state
                    );
                }
            },
            BatchEntry::Rejected {
                service_id,
                rejection,
            } => {
                eprintln!("{} {service_id}: {rejection}", "error:".red().bold());
            }
        }
    }
}

fn print_event(event: &StatusChangeEvent) {
    println!(
        "{} {} {} -> {}",
        event.timestamp.format("%H:%M:%S").dimmed(),
        format!("[{}]", event.service_id).cyan().bold(),
        event.previous,
        colored_state(event.current)
    );
}

fn format_percent(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.1}%"),
        None => "-".to_string(),
    }
}

fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let s = (now - at).num_seconds().max(0);
    match s {
        s if s < 60 => format!("{s}s ago"),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use stackpanel::supervisor::{ControlRejection, ControlReport};

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(None), "-");
        assert_eq!(format_percent(Some(0.0)), "0.0%");
        assert_eq!(format_percent(Some(12.345)), "12.3%");
    }

    #[test]
    fn test_format_age_seconds() {
        let now = Utc::now();
        assert_eq!(format_age(now, now), "0s ago");
        assert_eq!(format_age(now - TimeDelta::seconds(59), now), "59s ago");
    }

    #[test]
    fn test_format_age_larger_units() {
        let now = Utc::now();
        assert_eq!(format_age(now - TimeDelta::seconds(90), now), "1m ago");
        assert_eq!(format_age(now - TimeDelta::seconds(7260), now), "2h ago");
        assert_eq!(format_age(now - TimeDelta::seconds(172_800), now), "2d ago");
    }

    #[test]
    fn test_format_age_future_clamps() {
        let now = Utc::now();
        assert_eq!(format_age(now + TimeDelta::seconds(5), now), "0s ago");
    }

    #[test]
    fn test_entry_ok() {
        let report = |result| {
            BatchEntry::Completed(ControlReport {
                service_id: "php".to_string(),
                action: ControlAction::Start,
                result,
                final_state: ServiceState::Running,
            })
        };
        assert!(entry_ok(&report(ControlResult::Succeeded)));
        assert!(entry_ok(&report(ControlResult::AlreadyInDesiredState)));
        assert!(!entry_ok(&report(ControlResult::Failed("x".to_string()))));
        assert!(!entry_ok(&BatchEntry::Rejected {
            service_id: "php".to_string(),
            rejection: ControlRejection::ShuttingDown,
        }));
    }

    #[test]
    fn test_state_colors() {
        assert_eq!(state_color(ServiceState::Running), Color::Green);
        assert_eq!(state_color(ServiceState::Error), Color::Red);
        assert_eq!(state_color(ServiceState::Stopped), Color::Reset);
    }
}

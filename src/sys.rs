use serde::{Deserialize, Serialize};
use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, ProcessRefreshKind, ProcessesToUpdate, System};

/// Resource usage of the process backing a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetadata {
    pub pid: u32,
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

/// One row of the process table, as far as matching is concerned.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSample<'a> {
    pub pid: u32,
    pub name: &'a str,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Usage of the lowest-pid process whose name contains `name`
/// (case-insensitive). CPU usage needs two samples, so this blocks a
/// worker thread for [`MINIMUM_CPU_UPDATE_INTERVAL`].
pub async fn process_metadata(name: &str) -> Option<ProcessMetadata> {
    let needle = name.to_lowercase();
    if needle.is_empty() {
        return None;
    }
    tokio::task::spawn_blocking(move || lookup(&needle))
        .await
        .ok()
        .flatten()
}

fn lookup(needle: &str) -> Option<ProcessMetadata> {
    let kind = ProcessRefreshKind::nothing().with_cpu().with_memory();
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, kind);
    std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, kind);

    let names: Vec<(u32, String, u64, f32)> = sys
        .processes()
        .values()
        .map(|p| {
            (
                p.pid().as_u32(),
                p.name().to_string_lossy().into_owned(),
                p.memory(),
                p.cpu_usage(),
            )
        })
        .collect();

    let samples = names.iter().map(|(pid, name, memory_bytes, cpu)| ProcessSample {
        pid: *pid,
        name,
        memory_bytes: *memory_bytes,
        cpu_percent: *cpu,
    });
    select_process(samples, needle, sys.total_memory())
}

pub fn select_process<'a>(
    samples: impl IntoIterator<Item = ProcessSample<'a>>,
    name: &str,
    total_memory: u64,
) -> Option<ProcessMetadata> {
    let needle = name.to_lowercase();
    if needle.is_empty() {
        return None;
    }

    let sample = samples
        .into_iter()
        .filter(|s| s.name.to_lowercase().contains(&needle))
        .min_by_key(|s| s.pid)?;

    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        sample.memory_bytes as f64 / total_memory as f64 * 100.0
    };
    Some(ProcessMetadata {
        pid: sample.pid,
        memory_percent,
        cpu_percent: f64::from(sample.cpu_percent),
    })
}

use netstat2::{
    AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, TcpState, iterate_sockets_info,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::net::TcpStream;

pub const PORT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Result of a port probe. Informational only: a listening port does not
/// mean the expected service owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub port: u16,
    pub in_use: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

pub async fn check_port(port: u16) -> PortStatus {
    let connect = TcpStream::connect(("127.0.0.1", port));
    let in_use = tokio::time::timeout(PORT_CONNECT_TIMEOUT, connect)
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

    let owner = if in_use {
        tokio::task::spawn_blocking(move || owner_of(port))
            .await
            .ok()
            .flatten()
    } else {
        None
    };

    PortStatus {
        port,
        in_use,
        owner,
    }
}

/// Probe every port concurrently; results keep the input order.
pub async fn scan_ports(ports: &[u16]) -> Vec<PortStatus> {
    let handles: Vec<_> = ports
        .iter()
        .map(|&port| (port, tokio::spawn(check_port(port))))
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (port, handle) in handles {
        results.push(handle.await.unwrap_or(PortStatus {
            port,
            in_use: false,
            owner: None,
        }));
    }
    results
}

// =========================================================================
// Owner resolution
// =========================================================================

/// Name of the process listening on `port`, via the OS socket table.
fn owner_of(port: u16) -> Option<String> {
    let pid = Pid::from_u32(listening_pid(port)?);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let process = sys.process(pid)?;
    Some(process.name().to_string_lossy().into_owned())
}

fn listening_pid(port: u16) -> Option<u32> {
    let af = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
    let sockets = match iterate_sockets_info(af, ProtocolFlags::TCP) {
        Ok(sockets) => sockets,
        Err(e) => {
            tracing::debug!(port, error = %e, "socket table unavailable");
            return None;
        }
    };

    sockets
        .flatten()
        .filter(|info| match &info.protocol_socket_info {
            ProtocolSocketInfo::Tcp(tcp) => {
                tcp.local_port == port && matches!(tcp.state, TcpState::Listen)
            }
            ProtocolSocketInfo::Udp(_) => false,
        })
        .find_map(|info| info.associated_pids.first().copied())
}

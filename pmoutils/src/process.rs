use std::fmt;

use netstat2::{AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, get_sockets_info};
use sysinfo::{Pid, System};

/// Processus qui occupe un port local.
#[derive(Debug, Clone)]
pub struct ProcessPortInfo {
    pub pid: u32,
    pub process_name: String,
    pub owner: String,
    pub port: u16,
}

impl fmt::Display for ProcessPortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (pid {}, user {}) on port {}",
            self.process_name, self.pid, self.owner, self.port
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

/// Cherche le processus qui écoute sur `port`.
///
/// Sert uniquement au diagnostic quand `bind` échoue avec `AddrInUse` : toute
/// erreur d'inspection (droits insuffisants, plateforme non supportée) donne `None`.
pub fn find_process_using_port(port: u16, protocol: TransportProtocol) -> Option<ProcessPortInfo> {
    let proto_flag = match protocol {
        TransportProtocol::Tcp => ProtocolFlags::TCP,
        TransportProtocol::Udp => ProtocolFlags::UDP,
    };

    let sockets = get_sockets_info(
        AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6,
        proto_flag,
    )
    .ok()?;

    let pid = sockets.into_iter().find_map(|socket| {
        let local_port = match socket.protocol_socket_info {
            ProtocolSocketInfo::Tcp(ref tcp) => tcp.local_port,
            ProtocolSocketInfo::Udp(ref udp) => udp.local_port,
        };
        if local_port == port {
            socket.associated_pids.first().copied()
        } else {
            None
        }
    })?;

    let mut system = System::new_all();
    system.refresh_all();
    describe_process(&system, port, pid)
}

fn describe_process(system: &System, port: u16, pid: u32) -> Option<ProcessPortInfo> {
    let process = system.process(Pid::from_u32(pid))?;

    let owner = process
        .user_id()
        .and_then(|uid| {
            users::get_user_by_uid(**uid).map(|user| user.name().to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "unknown".to_string());

    Some(ProcessPortInfo {
        pid,
        process_name: process.name().to_string(),
        owner,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_log_friendly() {
        let info = ProcessPortInfo {
            pid: 42,
            process_name: "pmospot".to_string(),
            owner: "music".to_string(),
            port: 60218,
        };
        assert_eq!(info.to_string(), "pmospot (pid 42, user music) on port 60218");
    }

    #[test]
    fn test_unused_port_has_no_owner() {
        // port 1 n'est normalement jamais ouvert en UDP sur une machine de test
        let found = find_process_using_port(1, TransportProtocol::Udp);
        assert!(found.is_none() || found.is_some_and(|info| info.port == 1));
    }
}

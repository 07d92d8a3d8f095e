//! IPVS distribution entries driven through the `ipvsadm` CLI.
//!
//! Virtual-service entries cannot be updated in place, so a rebuild
//! deletes every entry bound to the service address before creating
//! the declared set. Argument construction and table parsing are pure
//! so the policy is testable without the kernel module.

use std::net::Ipv4Addr;
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, info};

use routegate_config::{Protocol, ServiceConfig};

use crate::NetSetupError;

/// An IPVS virtual-service entry as reported by `ipvsadm -Ln`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VirtualEntry {
    pub(crate) protocol: Protocol,
    pub(crate) address: Ipv4Addr,
    pub(crate) port: u16,
}

/// Driver for the `ipvsadm` binary.
pub struct IpvsAdm {
    program: String,
}

impl IpvsAdm {
    pub fn new() -> Self {
        Self {
            program: "ipvsadm".to_string(),
        }
    }

    /// Delete every virtual service bound to the service address, then
    /// create one per declared port mapping with a single masqueraded
    /// backend of weight 1.
    pub async fn rebuild(
        &self,
        service: &ServiceConfig,
        backend: Ipv4Addr,
    ) -> Result<(), NetSetupError> {
        let table = self.run(&["-Ln".to_string()]).await?;
        for entry in parse_table(&table)? {
            if entry.address != service.ip {
                continue;
            }
            debug!(address = %entry.address, port = entry.port, "removing stale ipvs entry");
            self.run(&delete_args(&entry)).await?;
        }

        for ports in &service.ports {
            self.run(&create_service_args(service, ports.service_port))
                .await?;
            self.run(&add_backend_args(
                service,
                ports.service_port,
                backend,
                ports.target_port,
            ))
            .await?;
            info!(
                address = %service.ip,
                port = ports.service_port,
                backend = %backend,
                target_port = ports.target_port,
                "created ipvs entry"
            );
        }
        Ok(())
    }

    async fn run(&self, args: &[String]) -> Result<String, NetSetupError> {
        let output: Output = Command::new(&self.program).args(args).output().await?;
        if !output.status.success() {
            return Err(NetSetupError::Command {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for IpvsAdm {
    fn default() -> Self {
        Self::new()
    }
}

fn proto_flag(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "-t",
        Protocol::Udp => "-u",
        Protocol::Sctp => "--sctp-service",
    }
}

fn create_service_args(service: &ServiceConfig, port: u16) -> Vec<String> {
    vec![
        "-A".to_string(),
        proto_flag(service.protocol).to_string(),
        format!("{}:{}", service.ip, port),
        "-s".to_string(),
        "rr".to_string(),
    ]
}

fn add_backend_args(
    service: &ServiceConfig,
    port: u16,
    backend: Ipv4Addr,
    target_port: u16,
) -> Vec<String> {
    vec![
        "-a".to_string(),
        proto_flag(service.protocol).to_string(),
        format!("{}:{}", service.ip, port),
        "-r".to_string(),
        format!("{backend}:{target_port}"),
        "-m".to_string(),
        "-w".to_string(),
        "1".to_string(),
    ]
}

fn delete_args(entry: &VirtualEntry) -> Vec<String> {
    vec![
        "-D".to_string(),
        proto_flag(entry.protocol).to_string(),
        format!("{}:{}", entry.address, entry.port),
    ]
}

/// Parse the virtual-service lines out of `ipvsadm -Ln` output.
/// Backend (`->`) lines and headers are skipped.
pub(crate) fn parse_table(output: &str) -> Result<Vec<VirtualEntry>, NetSetupError> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let protocol = match fields.next() {
            Some("TCP") => Protocol::Tcp,
            Some("UDP") => Protocol::Udp,
            Some("SCTP") => Protocol::Sctp,
            _ => continue,
        };
        let endpoint = fields
            .next()
            .ok_or_else(|| NetSetupError::Parse(format!("missing endpoint in line: {line}")))?;
        let (addr, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| NetSetupError::Parse(format!("bad endpoint: {endpoint}")))?;
        let address: Ipv4Addr = addr
            .parse()
            .map_err(|_| NetSetupError::Parse(format!("bad address: {addr}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| NetSetupError::Parse(format!("bad port: {port}")))?;
        entries.push(VirtualEntry {
            protocol,
            address,
            port,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use routegate_config::PortMap;

    fn service() -> ServiceConfig {
        ServiceConfig {
            name: "rg-web".to_string(),
            ip: Ipv4Addr::new(10, 88, 2, 1),
            prefix_length: 32,
            protocol: Protocol::Tcp,
            ports: vec![PortMap {
                service_port: 443,
                target_port: 8443,
            }],
            http_health_check: None,
            ping_health_check: None,
        }
    }

    #[test]
    fn create_args_use_round_robin() {
        let args = create_service_args(&service(), 443);
        assert_eq!(args, ["-A", "-t", "10.88.2.1:443", "-s", "rr"]);
    }

    #[test]
    fn backend_args_masquerade_with_weight_one() {
        let args = add_backend_args(&service(), 443, Ipv4Addr::new(10, 88, 0, 200), 8443);
        assert_eq!(
            args,
            ["-a", "-t", "10.88.2.1:443", "-r", "10.88.0.200:8443", "-m", "-w", "1"]
        );
    }

    #[test]
    fn sctp_uses_long_flag() {
        let mut svc = service();
        svc.protocol = Protocol::Sctp;
        let args = create_service_args(&svc, 132);
        assert_eq!(args[1], "--sctp-service");
    }

    #[test]
    fn parse_table_skips_headers_and_backends() {
        let output = "\
IP Virtual Server version 1.2.1 (size=4096)
Prot LocalAddress:Port Scheduler Flags
  -> RemoteAddress:Port           Forward Weight ActiveConn InActConn
TCP  10.88.2.1:443 rr
  -> 10.88.0.200:8443             Masq    1      0          0
UDP  10.88.2.9:53 rr
  -> 10.88.0.200:5353             Masq    1      0          0
";
        let entries = parse_table(output).unwrap();
        assert_eq!(
            entries,
            [
                VirtualEntry {
                    protocol: Protocol::Tcp,
                    address: Ipv4Addr::new(10, 88, 2, 1),
                    port: 443,
                },
                VirtualEntry {
                    protocol: Protocol::Udp,
                    address: Ipv4Addr::new(10, 88, 2, 9),
                    port: 53,
                },
            ]
        );
    }

    #[test]
    fn parse_table_rejects_garbage_endpoint() {
        assert!(parse_table("TCP nonsense rr\n").is_err());
    }

    #[test]
    fn delete_args_match_entry() {
        let entry = VirtualEntry {
            protocol: Protocol::Udp,
            address: Ipv4Addr::new(10, 88, 2, 9),
            port: 53,
        };
        assert_eq!(delete_args(&entry), ["-D", "-u", "10.88.2.9:53"]);
    }
}

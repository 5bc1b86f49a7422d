/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Error;
use aya::maps::{HashMap, MapData, MapError};
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};

use backends::backends::backends_server::Backends;
use backends::backends::{Confirmation, InterfaceIndexConfirmation, PodIp, Target, Targets, Vip};

use crate::netutils::if_index_for_routing_ip;
use crate::routing::{EgressBinding, RoutingTable};
use common::{Backend, VipKey};

pub struct BackendService {
    backends_map: Arc<Mutex<HashMap<MapData, VipKey, Backend>>>,
    routing: Arc<RoutingTable>,
}

impl BackendService {
    pub fn new(
        backends_map: HashMap<MapData, VipKey, Backend>,
        routing: Arc<RoutingTable>,
    ) -> BackendService {
        BackendService {
            backends_map: Arc::new(Mutex::new(backends_map)),
            routing,
        }
    }

    async fn insert(&self, key: VipKey, backend: Backend) -> Result<(), Error> {
        let mut backends_map = self.backends_map.lock().await;
        backends_map.insert(key, backend, 0)?;
        Ok(())
    }

    async fn remove(&self, key: VipKey) -> Result<(), Error> {
        let mut backends_map = self.backends_map.lock().await;
        backends_map.remove(&key)?;
        Ok(())
    }
}

// The kernel reports a missing key as ENOENT; for delete that simply means
// there is nothing left to do.
fn is_not_found(err: &Error) -> bool {
    match err.downcast_ref::<MapError>() {
        Some(MapError::KeyNotFound) => true,
        Some(MapError::SyscallError(syscall_err)) => {
            syscall_err.io_error.raw_os_error() == Some(libc::ENOENT)
        }
        _ => false,
    }
}

// Ports ride the wire as u32; anything above a real port is a caller bug.
fn wire_port(port: u32, field: &str) -> Result<u16, Status> {
    u16::try_from(port)
        .map_err(|_| Status::invalid_argument(format!("{} {} is out of range", field, port)))
}

fn vip_key(vip: &Vip) -> Result<VipKey, Status> {
    Ok(VipKey::new(vip.ip, wire_port(vip.port, "vip port")?))
}

// The backend the packet path will install: source rewritten to the gateway
// VIP, destination to the pod endpoint, L2 and egress from the node-local
// binding. The wire can override the egress index for test rigs. Checksum
// recomputation stays enabled; the wire carries no listener protocol, and
// the UDP path still zeroes oversized datagram checksums on its own.
fn compose_backend(
    vip: &Vip,
    target: &Target,
    dport: u16,
    binding: &EgressBinding,
) -> Backend {
    Backend {
        saddr: vip.ip,
        daddr: target.daddr,
        dport,
        src_mac: binding.src_mac,
        dst_mac: binding.dst_mac,
        ifindex: target.ifindex.unwrap_or(binding.ifindex) as u16,
        nocksum: 0,
        _pad: [0; 3],
    }
}

#[tonic::async_trait]
impl Backends for BackendService {
    async fn get_interface_index(
        &self,
        request: Request<PodIp>,
    ) -> Result<Response<InterfaceIndexConfirmation>, Status> {
        let pod = request.into_inner();

        if let Some(binding) = self.routing.lookup(pod.ip).await {
            return Ok(Response::new(InterfaceIndexConfirmation {
                ifindex: binding.ifindex,
            }));
        }

        // The watcher may simply not have caught up with a young pod, so
        // fall back to asking the routing table of record.
        let ip_addr = Ipv4Addr::from(pod.ip);
        let resolved =
            tokio::task::spawn_blocking(move || if_index_for_routing_ip(ip_addr))
                .await
                .map_err(|err| Status::internal(err.to_string()))?;

        match resolved {
            Ok(ifindex) => Ok(Response::new(InterfaceIndexConfirmation { ifindex })),
            Err(err) => Err(Status::not_found(format!(
                "pod {} is not local to this node: {}",
                ip_addr, err
            ))),
        }
    }

    async fn update(&self, request: Request<Targets>) -> Result<Response<Confirmation>, Status> {
        let targets = request.into_inner();

        let vip = targets
            .vip
            .ok_or_else(|| Status::invalid_argument("missing vip ip and port"))?;
        let target = targets
            .target
            .ok_or_else(|| Status::invalid_argument("missing backend target"))?;

        let key = vip_key(&vip)?;
        let dport = wire_port(target.dport, "backend port")?;

        let binding = self
            .routing
            .lookup(target.daddr)
            .await
            .ok_or_else(|| {
                Status::failed_precondition(format!(
                    "endpoints not ready: no egress binding for pod {}",
                    Ipv4Addr::from(target.daddr)
                ))
            })?;

        let backend = compose_backend(&vip, &target, dport, &binding);
        match self.insert(key, backend).await {
            Ok(()) => Ok(Response::new(Confirmation {
                confirmation: format!(
                    "success, vip {}:{} was updated to backend {}:{}",
                    Ipv4Addr::from(vip.ip),
                    vip.port,
                    Ipv4Addr::from(target.daddr),
                    target.dport,
                ),
            })),
            Err(err) => Err(Status::internal(format!("failure: {}", err))),
        }
    }

    async fn delete(&self, request: Request<Vip>) -> Result<Response<Confirmation>, Status> {
        let vip = request.into_inner();

        let key = vip_key(&vip)?;
        let addr_ddn = Ipv4Addr::from(vip.ip);

        match self.remove(key).await {
            Ok(()) => Ok(Response::new(Confirmation {
                confirmation: format!("success, vip {}:{} was deleted", addr_ddn, vip.port),
            })),
            Err(err) if is_not_found(&err) => Ok(Response::new(Confirmation {
                confirmation: format!("success, vip {}:{} did not exist", addr_ddn, vip.port),
            })),
            Err(err) => Err(Status::internal(format!("failure: {}", err))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_ports() {
        assert!(wire_port(9875, "vip port").is_ok());
        assert!(wire_port(65535, "vip port").is_ok());
        assert!(wire_port(65536, "vip port").is_err());

        let vip = Vip {
            ip: u32::from(Ipv4Addr::new(172, 18, 0, 242)),
            port: 70_000,
        };
        assert!(vip_key(&vip).is_err());
    }

    #[test]
    fn composes_backend_from_binding() {
        let vip = Vip {
            ip: u32::from(Ipv4Addr::new(172, 18, 0, 242)),
            port: 9875,
        };
        let target = Target {
            daddr: u32::from(Ipv4Addr::new(10, 244, 0, 7)),
            dport: 9876,
            ifindex: None,
        };
        let binding = EgressBinding {
            ifindex: 12,
            src_mac: [0x02, 0, 0, 0, 0, 1],
            dst_mac: [0x02, 0, 0, 0, 0, 2],
        };

        let backend = compose_backend(&vip, &target, 9876, &binding);
        assert_eq!(backend.saddr, vip.ip);
        assert_eq!(backend.daddr, target.daddr);
        assert_eq!(backend.dport, 9876);
        assert_eq!(backend.src_mac, binding.src_mac);
        assert_eq!(backend.dst_mac, binding.dst_mac);
        assert_eq!(backend.ifindex, 12);
        assert_eq!(backend.nocksum, 0);
    }

    #[test]
    fn wire_ifindex_overrides_binding() {
        let vip = Vip { ip: 0, port: 80 };
        let target = Target {
            daddr: 0,
            dport: 8080,
            ifindex: Some(42),
        };
        let binding = EgressBinding {
            ifindex: 12,
            src_mac: [0; 6],
            dst_mac: [0; 6],
        };
        assert_eq!(compose_backend(&vip, &target, 8080, &binding).ifindex, 42);
    }
}

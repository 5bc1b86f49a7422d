/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::pin::pin;
use std::sync::Arc;

use anyhow::Error;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use tokio::sync::RwLock;
use tokio::task;
use tracing::{debug, warn};

use crate::netutils::{if_index_for_routing_ip, mac_for_interface, mac_for_neighbor};

/// The L2/egress binding needed to reach one local pod: the host-side veth
/// to redirect to, its own hardware address, and the pod-side address behind
/// it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EgressBinding {
    pub ifindex: u32,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
}

/// Pod-IPv4 to egress-binding mapping for the pods on this node.
///
/// RPC handlers read concurrently; the pod watcher is the only writer.
#[derive(Default)]
pub struct RoutingTable {
    entries: RwLock<HashMap<u32, EgressBinding>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(&self, daddr: u32) -> Option<EgressBinding> {
        self.entries.read().await.get(&daddr).copied()
    }

    pub async fn insert(&self, daddr: u32, binding: EgressBinding) {
        self.entries.write().await.insert(daddr, binding);
    }

    pub async fn remove(&self, daddr: u32) {
        self.entries.write().await.remove(&daddr);
    }

    pub async fn contains(&self, daddr: u32) -> bool {
        self.entries.read().await.contains_key(&daddr)
    }
}

/// Resolves the egress binding for a local pod address: the routing table
/// names the host-side veth, the link its hardware address, and the
/// neighbour table the pod-side address behind it.
pub fn resolve_egress_binding(ip_addr: Ipv4Addr) -> Result<EgressBinding, Error> {
    let ifindex = if_index_for_routing_ip(ip_addr)?;
    let src_mac = mac_for_interface(ifindex)?;
    let dst_mac = mac_for_neighbor(ifindex, ip_addr)?;
    Ok(EgressBinding {
        ifindex,
        src_mac,
        dst_mac,
    })
}

/// Watches the pods scheduled on this node and keeps the routing table in
/// step with their veth pairings. Runs until the watch stream fails
/// terminally.
pub async fn watch_pods(
    client: Client,
    node_name: String,
    table: Arc<RoutingTable>,
) -> Result<(), Error> {
    let pod_api: Api<Pod> = Api::all(client);
    let config =
        watcher::Config::default().fields(&format!("spec.nodeName={node_name},status.phase=Running"));

    let stream = watcher(pod_api, config).default_backoff();
    let mut stream = pin!(stream);
    while let Some(event) = stream.try_next().await? {
        match event {
            watcher::Event::Applied(pod) => upsert_pod(&table, &pod).await,
            watcher::Event::Deleted(pod) => remove_pod(&table, &pod).await,
            watcher::Event::Restarted(pods) => {
                for pod in &pods {
                    upsert_pod(&table, pod).await;
                }
            }
        }
    }

    Ok(())
}

fn pod_ipv4(pod: &Pod) -> Option<Ipv4Addr> {
    // Host-network pods have no veth pair to resolve.
    if pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or_default()
    {
        return None;
    }
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.as_ref())
        .and_then(|ip| ip.parse().ok())
}

async fn upsert_pod(table: &RoutingTable, pod: &Pod) {
    let Some(addr) = pod_ipv4(pod) else {
        return;
    };
    // A live pod keeps its address, so an existing entry is still current.
    if table.contains(u32::from(addr)).await {
        return;
    }

    match task::spawn_blocking(move || resolve_egress_binding(addr)).await {
        Ok(Ok(binding)) => {
            debug!(
                "resolved egress binding for pod {} at {}: ifindex {}",
                pod.name_any(),
                addr,
                binding.ifindex
            );
            table.insert(u32::from(addr), binding).await;
        }
        Ok(Err(err)) => {
            warn!(
                "failed to resolve egress binding for pod {} at {}: {}",
                pod.name_any(),
                addr,
                err
            );
        }
        Err(err) => {
            warn!("egress binding resolution task failed: {}", err);
        }
    }
}

async fn remove_pod(table: &RoutingTable, pod: &Pod) {
    if let Some(addr) = pod_ipv4(pod) {
        debug!("removing egress binding for pod {} at {}", pod.name_any(), addr);
        table.remove(u32::from(addr)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(ifindex: u32) -> EgressBinding {
        EgressBinding {
            ifindex,
            src_mac: [0x02, 0, 0, 0, 0, 1],
            dst_mac: [0x02, 0, 0, 0, 0, 2],
        }
    }

    #[tokio::test]
    async fn lookup_reflects_inserts_and_removes() {
        let table = RoutingTable::new();
        let addr = u32::from(Ipv4Addr::new(10, 244, 0, 7));

        assert_eq!(table.lookup(addr).await, None);
        table.insert(addr, binding(3)).await;
        assert_eq!(table.lookup(addr).await, Some(binding(3)));

        // Replacement wins.
        table.insert(addr, binding(5)).await;
        assert_eq!(table.lookup(addr).await, Some(binding(5)));

        table.remove(addr).await;
        assert_eq!(table.lookup(addr).await, None);
    }

    #[test]
    fn host_network_pods_have_no_binding() {
        let mut pod = Pod::default();
        pod.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            host_network: Some(true),
            ..Default::default()
        });
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            pod_ip: Some("10.244.0.7".to_string()),
            ..Default::default()
        });
        assert_eq!(pod_ipv4(&pod), None);

        pod.spec.as_mut().unwrap().host_network = Some(false);
        assert_eq!(pod_ipv4(&pod), Some(Ipv4Addr::new(10, 244, 0, 7)));
    }
}

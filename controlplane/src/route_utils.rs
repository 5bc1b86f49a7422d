/*
Copyright 2025 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::net::Ipv4Addr;

use crate::conditions::new_condition;
use crate::consts::{ASKA_FIELD_MANAGER, DATAPLANE_FINALIZER, GATEWAY_CLASS_CONTROLLER_NAME};
use crate::{Error, Result};
use backends::backends::{Target, Targets, Vip};

use gateway_api::apis::experimental::tcproutes::{TCPRouteParentRefs, TCPRouteRulesBackendRefs};
use gateway_api::apis::experimental::udproutes::{UDPRouteParentRefs, UDPRouteRulesBackendRefs};
use gateway_api::apis::standard::gateways::Gateway;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    Client,
};
use serde::de::DeserializeOwned;
use serde_json::json;

// TCPRoute and UDPRoute carry structurally identical references under
// distinct generated types; everything downstream works on these.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteParentRef {
    pub name: String,
    pub namespace: Option<String>,
    pub port: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteBackendRef {
    pub name: String,
    pub namespace: Option<String>,
    pub port: Option<i32>,
}

impl From<&TCPRouteParentRefs> for RouteParentRef {
    fn from(parent_ref: &TCPRouteParentRefs) -> Self {
        Self {
            name: parent_ref.name.clone(),
            namespace: parent_ref.namespace.clone(),
            port: parent_ref.port,
        }
    }
}

impl From<&UDPRouteParentRefs> for RouteParentRef {
    fn from(parent_ref: &UDPRouteParentRefs) -> Self {
        Self {
            name: parent_ref.name.clone(),
            namespace: parent_ref.namespace.clone(),
            port: parent_ref.port,
        }
    }
}

impl From<&TCPRouteRulesBackendRefs> for RouteBackendRef {
    fn from(backend_ref: &TCPRouteRulesBackendRefs) -> Self {
        Self {
            name: backend_ref.name.clone(),
            namespace: backend_ref.namespace.clone(),
            port: backend_ref.port,
        }
    }
}

impl From<&UDPRouteRulesBackendRefs> for RouteBackendRef {
    fn from(backend_ref: &UDPRouteRulesBackendRefs) -> Self {
        Self {
            name: backend_ref.name.clone(),
            namespace: backend_ref.namespace.clone(),
            port: backend_ref.port,
        }
    }
}

/// Walks the route's parent references and returns the first Gateway that
/// belongs to our GatewayClass and has a listener matching the referenced
/// port and protocol, along with the reference that matched. `None` means
/// the route is not ours to reconcile.
pub async fn find_managed_gateway(
    client: Client,
    route_namespace: &str,
    parent_refs: &[RouteParentRef],
    protocol: &str,
) -> Result<Option<(Gateway, RouteParentRef)>> {
    for parent_ref in parent_refs {
        let gateway_namespace = parent_ref.namespace.as_deref().unwrap_or(route_namespace);
        let gateway_name = parent_ref.name.as_str();

        let gateway_api: Api<Gateway> = Api::namespaced(client.clone(), gateway_namespace);

        let gateway = match gateway_api.get(gateway_name).await {
            Ok(gw) => gw,
            Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => continue,
            Err(e) => return Err(Error::KubeError(e)),
        };

        let gatewayclass_api: Api<gateway_api::apis::standard::gatewayclasses::GatewayClass> =
            Api::all(client.clone());

        let gatewayclass = match gatewayclass_api.get(&gateway.spec.gateway_class_name).await {
            Ok(gwc) => gwc,
            Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => continue,
            Err(e) => return Err(Error::KubeError(e)),
        };

        if gatewayclass.spec.controller_name != GATEWAY_CLASS_CONTROLLER_NAME {
            continue;
        }

        let Some(port) = parent_ref.port else {
            continue;
        };
        if !gateway
            .spec
            .listeners
            .iter()
            .any(|listener| listener.port == port && listener.protocol == protocol)
        {
            continue;
        }

        return Ok(Some((gateway, parent_ref.clone())));
    }

    Ok(None)
}

/// A route compiles to exactly one forwarding entry, so it must carry
/// exactly one rule with exactly one backend reference.
pub fn single_backend_ref(rules: &[Vec<RouteBackendRef>]) -> Result<RouteBackendRef> {
    if rules.len() != 1 {
        return Err(Error::InvalidConfigError(format!(
            "routes must have exactly one rule, found {}",
            rules.len()
        )));
    }
    let backend_refs = &rules[0];
    if backend_refs.len() != 1 {
        return Err(Error::InvalidConfigError(format!(
            "routes must have exactly one backendRef, found {}",
            backend_refs.len()
        )));
    }
    Ok(backend_refs[0].clone())
}

/// Resolves the Gateway's address and the referenced listener port into the
/// wire VIP. The Gateway must carry exactly one address of IP type.
pub fn gateway_vip(gateway: &Gateway, parent_ref: &RouteParentRef) -> Result<Vip> {
    let addresses = gateway
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .ok_or_else(|| Error::InvalidConfigError("Gateway has no addresses yet".to_string()))?;

    if addresses.len() != 1 {
        return Err(Error::InvalidConfigError(format!(
            "Gateway must have exactly one address, found {}",
            addresses.len()
        )));
    }
    let address = &addresses[0];
    if let Some(addr_type) = &address.r#type {
        if addr_type != "IPAddress" {
            return Err(Error::InvalidConfigError(format!(
                "found an address of type {}, only type IPAddress is supported",
                addr_type
            )));
        }
    }
    let ip: Ipv4Addr = address.value.parse().map_err(|_| {
        Error::InvalidConfigError(format!("Gateway address {} is not an IPv4 address", address.value))
    })?;

    let port = parent_ref.port.ok_or_else(|| {
        Error::InvalidConfigError("parent reference must name a listener port".to_string())
    })?;
    if !gateway
        .spec
        .listeners
        .iter()
        .any(|listener| listener.port == port)
    {
        return Err(Error::InvalidConfigError(format!(
            "Gateway has no listener for port {}",
            port
        )));
    }

    Ok(Vip {
        ip: u32::from(ip),
        port: port as u32,
    })
}

/// Picks the backend pod endpoint out of the service's Endpoints object.
/// Anything short of one ready address with a port means the endpoints are
/// not ready yet, which the reconciler retries shortly.
pub fn resolve_backend_target(
    endpoints: &Endpoints,
    backend_ref: &RouteBackendRef,
) -> Result<Target> {
    for subset in endpoints.subsets.as_deref().unwrap_or_default() {
        let Some(address) = subset.addresses.as_deref().unwrap_or_default().first() else {
            continue;
        };
        // A subset whose ports the endpoint controller has not populated is
        // not ready, even when the route names its own port.
        let Some(subset_port) = subset.ports.as_deref().unwrap_or_default().first() else {
            continue;
        };
        let Ok(ip) = address.ip.parse::<Ipv4Addr>() else {
            continue;
        };
        let port = backend_ref.port.unwrap_or(subset_port.port);
        return Ok(Target {
            daddr: u32::from(ip),
            dport: port as u32,
            ifindex: None,
        });
    }

    Err(Error::EndpointsNotReady(backend_ref.name.clone()))
}

/// Compiles one route into the wire object the agents consume: the gateway
/// VIP plus the single backend pod endpoint behind the referenced service.
pub async fn compile_route_targets(
    client: Client,
    route_namespace: &str,
    vip: Vip,
    backend_ref: &RouteBackendRef,
) -> Result<Targets> {
    let backend_namespace = backend_ref.namespace.as_deref().unwrap_or(route_namespace);

    let endpoints_api: Api<Endpoints> = Api::namespaced(client, backend_namespace);
    let endpoints = match endpoints_api.get(&backend_ref.name).await {
        Ok(endpoints) => endpoints,
        Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => {
            return Err(Error::EndpointsNotReady(backend_ref.name.clone()));
        }
        Err(e) => return Err(Error::KubeError(e)),
    };

    let target = resolve_backend_target(&endpoints, backend_ref)?;

    Ok(Targets {
        vip: Some(vip),
        target: Some(target),
    })
}

/// An "Accepted" condition for a route's parent status.
pub fn route_accepted_condition(
    generation: Option<i64>,
    status: &str,
    reason: &str,
    message: &str,
) -> metav1::Condition {
    new_condition("Accepted", status, reason, message, generation)
}

/// The `status.parents` payload for a route owned by this controller.
pub fn route_parents_status(
    parent_ref: &RouteParentRef,
    route_namespace: &str,
    conditions: &[metav1::Condition],
) -> serde_json::Value {
    json!([{
        "parentRef": {
            "group": "gateway.networking.k8s.io",
            "kind": "Gateway",
            "name": parent_ref.name,
            "namespace": parent_ref.namespace.as_deref().unwrap_or(route_namespace),
            "port": parent_ref.port,
        },
        "controllerName": GATEWAY_CLASS_CONTROLLER_NAME,
        "conditions": conditions,
    }])
}

/// Patch the provided parent statuses onto a route object.
pub async fn patch_route_status<K>(
    api: &Api<K>,
    name: &str,
    api_version: &str,
    kind: &str,
    parents: serde_json::Value,
) -> Result<()>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    let patch = Patch::Apply(json!({
        "apiVersion": api_version,
        "kind": kind,
        "status": {
            "parents": parents
        }
    }));
    let params = PatchParams::apply(ASKA_FIELD_MANAGER).force();
    api.patch_status(name, &params, &patch)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

pub fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|finalizer| finalizer == DATAPLANE_FINALIZER)
}

pub async fn ensure_finalizer<K>(api: &Api<K>, name: &str, meta: &ObjectMeta) -> Result<()>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    if has_finalizer(meta) {
        return Ok(());
    }
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    finalizers.push(DATAPLANE_FINALIZER.to_string());
    let patch = Patch::Merge(json!({"metadata": {"finalizers": finalizers}}));
    api.patch(name, &PatchParams::default(), &patch)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

pub async fn remove_finalizer<K>(api: &Api<K>, name: &str, meta: &ObjectMeta) -> Result<()>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    let finalizers: Vec<String> = meta
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|finalizer| finalizer != DATAPLANE_FINALIZER)
        .collect();
    let patch = Patch::Merge(json!({"metadata": {"finalizers": finalizers}}));
    api.patch(name, &PatchParams::default(), &patch)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent_ref(port: Option<i32>) -> RouteParentRef {
        RouteParentRef {
            name: "test-gateway".to_string(),
            namespace: None,
            port,
        }
    }

    fn backend_ref(port: Option<i32>) -> RouteBackendRef {
        RouteBackendRef {
            name: "test-service".to_string(),
            namespace: None,
            port,
        }
    }

    fn gateway(addresses: serde_json::Value) -> Gateway {
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": {"name": "test-gateway", "namespace": "default", "generation": 1},
            "spec": {
                "gatewayClassName": "aska",
                "listeners": [
                    {"name": "tcp", "port": 9875, "protocol": "TCP"},
                ],
            },
            "status": {"addresses": addresses},
        }))
        .expect("gateway fixture must deserialize")
    }

    fn endpoints(value: serde_json::Value) -> Endpoints {
        serde_json::from_value(value).expect("endpoints fixture must deserialize")
    }

    #[test]
    fn requires_exactly_one_rule_and_backend() {
        assert!(single_backend_ref(&[]).is_err());
        assert!(single_backend_ref(&[vec![]]).is_err());
        assert!(single_backend_ref(&[vec![backend_ref(None)], vec![backend_ref(None)]]).is_err());
        assert!(
            single_backend_ref(&[vec![backend_ref(None), backend_ref(None)]]).is_err()
        );

        let backend = single_backend_ref(&[vec![backend_ref(Some(9876))]]).unwrap();
        assert_eq!(backend.port, Some(9876));
    }

    #[test]
    fn resolves_the_gateway_vip() {
        let gw = gateway(json!([{"type": "IPAddress", "value": "172.18.0.242"}]));
        let vip = gateway_vip(&gw, &parent_ref(Some(9875))).unwrap();
        assert_eq!(vip.ip, u32::from(Ipv4Addr::new(172, 18, 0, 242)));
        assert_eq!(vip.port, 9875);
    }

    #[test]
    fn rejects_unsupported_gateway_addresses() {
        // No address programmed yet.
        let gw = gateway(json!([]));
        assert!(gateway_vip(&gw, &parent_ref(Some(9875))).is_err());

        // More than one address.
        let gw = gateway(json!([
            {"type": "IPAddress", "value": "172.18.0.242"},
            {"type": "IPAddress", "value": "172.18.0.243"},
        ]));
        assert!(gateway_vip(&gw, &parent_ref(Some(9875))).is_err());

        // Not an IP address.
        let gw = gateway(json!([{"type": "Hostname", "value": "lb.example.com"}]));
        assert!(gateway_vip(&gw, &parent_ref(Some(9875))).is_err());

        // Listener port mismatch.
        let gw = gateway(json!([{"type": "IPAddress", "value": "172.18.0.242"}]));
        assert!(gateway_vip(&gw, &parent_ref(Some(8080))).is_err());
        assert!(gateway_vip(&gw, &parent_ref(None)).is_err());
    }

    #[test]
    fn resolves_the_first_ready_endpoint() {
        let eps = endpoints(json!({
            "metadata": {"name": "test-service", "namespace": "default"},
            "subsets": [
                {"ports": [{"port": 9876}]},
                {"addresses": [{"ip": "10.244.0.7"}], "ports": [{"port": 9876}]},
            ],
        }));

        let target = resolve_backend_target(&eps, &backend_ref(None)).unwrap();
        assert_eq!(target.daddr, u32::from(Ipv4Addr::new(10, 244, 0, 7)));
        assert_eq!(target.dport, 9876);
        assert_eq!(target.ifindex, None);
    }

    #[test]
    fn backend_ref_port_wins_over_endpoint_port() {
        let eps = endpoints(json!({
            "metadata": {"name": "test-service", "namespace": "default"},
            "subsets": [
                {"addresses": [{"ip": "10.244.0.7"}], "ports": [{"port": 9999}]},
            ],
        }));

        let target = resolve_backend_target(&eps, &backend_ref(Some(9876))).unwrap();
        assert_eq!(target.dport, 9876);
    }

    #[test]
    fn empty_endpoints_are_not_ready() {
        let eps = endpoints(json!({
            "metadata": {"name": "test-service", "namespace": "default"},
        }));
        match resolve_backend_target(&eps, &backend_ref(Some(9876))) {
            Err(Error::EndpointsNotReady(name)) => assert_eq!(name, "test-service"),
            other => panic!("expected EndpointsNotReady, got {other:?}"),
        }

        // A subset without ports is not ready, whether or not the backend
        // ref names its own port.
        let eps = endpoints(json!({
            "metadata": {"name": "test-service", "namespace": "default"},
            "subsets": [{"addresses": [{"ip": "10.244.0.7"}]}],
        }));
        assert!(resolve_backend_target(&eps, &backend_ref(None)).is_err());
        assert!(resolve_backend_target(&eps, &backend_ref(Some(9876))).is_err());
    }

    #[test]
    fn parent_status_names_this_controller() {
        let conditions = vec![route_accepted_condition(
            Some(1),
            "True",
            "Accepted",
            "route accepted",
        )];
        let parents = route_parents_status(&parent_ref(Some(9875)), "default", &conditions);

        assert_eq!(parents[0]["controllerName"], GATEWAY_CLASS_CONTROLLER_NAME);
        assert_eq!(parents[0]["parentRef"]["name"], "test-gateway");
        assert_eq!(parents[0]["parentRef"]["namespace"], "default");
        assert_eq!(parents[0]["conditions"][0]["type"], "Accepted");
    }

    #[test]
    fn finalizer_membership_is_detected() {
        let mut meta = ObjectMeta::default();
        assert!(!has_finalizer(&meta));
        meta.finalizers = Some(vec![DATAPLANE_FINALIZER.to_string()]);
        assert!(has_finalizer(&meta));
    }
}

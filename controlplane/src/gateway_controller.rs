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

use std::{sync::Arc, time::Duration};

use crate::conditions::{condition_is_true, new_condition, set_condition};
use crate::consts::{GATEWAY_CLASS_CONTROLLER_NAME, GATEWAY_SERVICE_LABEL};
use crate::gateway_utils::{
    create_endpoint_if_not_exists, create_svc_for_gateway, get_accepted_condition,
    get_ingress_ip_len, get_service_key, patch_status, set_gateway_status_addresses,
    set_listener_status, update_service_for_gateway,
};
use crate::{Context, Error, NamespaceName, NamespacedName, Result};

use futures::StreamExt;
use gateway_api::apis::standard::constants::{GatewayConditionReason, GatewayConditionType};
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use k8s_openapi::api::core::v1::{Service, ServiceSpec, ServiceStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::{controller::Action, watcher::Config, Controller},
    ResourceExt,
};
use tracing::{debug, info, warn};

// Address drift on the LoadBalancer Service has no dedicated watch, so
// programmed Gateways resync on a timer.
const RESYNC_PERIOD: Duration = Duration::from_secs(60);

/// Drives one Gateway to programmed: validates its listeners, provisions the
/// LoadBalancer Service that gets it an external address, and copies the
/// assigned address back into the Gateway's status.
pub async fn reconcile(gateway: Arc<Gateway>, ctx: Arc<Context>) -> Result<Action> {
    let nsname = gateway.metadata.namespaced_name()?;
    let gateway_api: Api<Gateway> = Api::namespaced(ctx.client.clone(), &nsname.namespace);

    if !class_is_ours_and_accepted(&ctx, gateway.as_ref()).await? {
        return Ok(Action::await_change());
    }

    let mut gw = (*gateway).clone();
    set_listener_status(&mut gw)?;

    let accepted = get_accepted_condition(&gw);
    set_condition(&mut gw, accepted.clone());

    if accepted.status != "True" {
        // Nothing gets programmed for a Gateway we cannot accept; say so
        // and wait for the resource to change.
        let condition = programmed_condition(
            &gw,
            "False",
            GatewayConditionReason::Programmed,
            &accepted.message,
        );
        set_condition(&mut gw, condition);
        publish_status(&gateway_api, &nsname, &gw).await?;
        return Err(Error::InvalidConfigError(accepted.message));
    }

    let service = ensure_load_balancer(&ctx, &gw, &nsname).await?;

    match provisioned_parts(&service) {
        Ok((svc_spec, svc_status)) => {
            let svc_key = get_service_key(&service)?;
            create_endpoint_if_not_exists(ctx.clone(), &svc_key, svc_spec, svc_status).await?;
            set_gateway_status_addresses(&mut gw, svc_status);
            let condition = programmed_condition(
                &gw,
                "True",
                GatewayConditionReason::Programmed,
                "Dataplane configured for gateway",
            );
            set_condition(&mut gw, condition);
            publish_status(&gateway_api, &nsname, &gw).await?;

            info!("gateway {} is programmed", nsname);
            Ok(Action::requeue(RESYNC_PERIOD))
        }
        Err(err) => {
            // The allocator has not assigned an address yet; reflect that
            // and retry through the error policy.
            let condition = programmed_condition(
                &gw,
                "False",
                GatewayConditionReason::AddressNotAssigned,
                &err.to_string(),
            );
            set_condition(&mut gw, condition);
            publish_status(&gateway_api, &nsname, &gw).await?;
            Err(err)
        }
    }
}

// A Gateway is ours when its class names this controller and the class has
// already been accepted.
async fn class_is_ours_and_accepted(ctx: &Context, gateway: &Gateway) -> Result<bool> {
    let gatewayclass_api = Api::<GatewayClass>::all(ctx.client.clone());
    let gateway_class = gatewayclass_api
        .get(gateway.spec.gateway_class_name.as_str())
        .await
        .map_err(Error::KubeError)?;

    if gateway_class.spec.controller_name != GATEWAY_CLASS_CONTROLLER_NAME {
        return Ok(false);
    }
    if !condition_is_true(
        &gateway_class,
        &GatewayConditionType::Accepted.to_string(),
    ) {
        debug!(
            "gatewayclass {} not yet accepted",
            gateway_class.name_any()
        );
        return Ok(false);
    }
    Ok(true)
}

// Finds the LoadBalancer Service owned by this Gateway and corrects any
// drift, or creates it. More than one owned Service is a state we refuse to
// touch.
async fn ensure_load_balancer(
    ctx: &Arc<Context>,
    gateway: &Gateway,
    nsname: &NamespacedName,
) -> Result<Service> {
    let service_api: Api<Service> = Api::namespaced(ctx.client.clone(), &nsname.namespace);
    let owned = service_api
        .list(&ListParams::default().labels(&format!("{GATEWAY_SERVICE_LABEL}={}", nsname.name)))
        .await
        .map_err(Error::KubeError)?
        .items;

    if owned.len() > 1 {
        let names: Vec<String> = owned.iter().map(|svc| svc.name_any()).collect();
        warn!(services = ?names, "found multiple Services for gateway {}", nsname);
        return Err(Error::LoadBalancerError(
            "found more than 1 Service for this Gateway; multiple services are not supported"
                .to_string(),
        ));
    }

    let Some(existing) = owned.into_iter().next() else {
        info!("creating loadbalancer service for gateway {}", nsname);
        return create_svc_for_gateway(ctx.clone(), gateway).await;
    };

    let mut desired = existing.clone();
    if update_service_for_gateway(gateway, &mut desired)? {
        info!(
            "drift detected; updating loadbalancer service for gateway {}",
            nsname
        );
        service_api
            .patch(
                existing.name_any().as_str(),
                &PatchParams::default(),
                &Patch::Strategic(&desired),
            )
            .await
            .map_err(Error::KubeError)?;
    }
    Ok(desired)
}

// The Service parts a programmed Gateway needs: a spec with a cluster IP and
// a status carrying at least one ingress address.
fn provisioned_parts(service: &Service) -> Result<(&ServiceSpec, &ServiceStatus)> {
    let spec = service.spec.as_ref().ok_or(Error::LoadBalancerError(
        "Loadbalancer service spec not found".to_string(),
    ))?;
    let status = service.status.as_ref().ok_or(Error::LoadBalancerError(
        "Loadbalancer service status not found".to_string(),
    ))?;
    if spec.cluster_ip.is_none() || get_ingress_ip_len(status) == 0 {
        return Err(Error::LoadBalancerError(
            "LoadBalancer does not have an ingress IP address".to_string(),
        ));
    }
    Ok((spec, status))
}

fn programmed_condition(
    gateway: &Gateway,
    status: &str,
    reason: GatewayConditionReason,
    message: &str,
) -> metav1::Condition {
    new_condition(
        &GatewayConditionType::Programmed.to_string(),
        status,
        &reason.to_string(),
        message,
        gateway.metadata.generation,
    )
}

async fn publish_status(
    api: &Api<Gateway>,
    nsname: &NamespacedName,
    gateway: &Gateway,
) -> Result<()> {
    let status = gateway.status.clone().unwrap_or_default();
    patch_status(api, nsname.name.clone(), &status).await
}

pub async fn controller(ctx: Context) -> Result<()> {
    let gateway = Api::<Gateway>::all(ctx.client.clone());
    gateway
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    Controller::new(gateway, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<Gateway>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5))
}

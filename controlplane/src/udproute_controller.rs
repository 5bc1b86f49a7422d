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

use futures::StreamExt;
use std::{sync::Arc, time::Duration};

use crate::route_utils::{
    compile_route_targets, ensure_finalizer, find_managed_gateway, gateway_vip, has_finalizer,
    patch_route_status, remove_finalizer, route_accepted_condition, route_parents_status,
    single_backend_ref, RouteBackendRef, RouteParentRef,
};
use crate::{Context, Error, NamespaceName, Result};

use gateway_api::apis::experimental::udproutes::UDPRoute;
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher::Config, Controller},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

const ROUTE_API_VERSION: &str = "gateway.networking.k8s.io/v1alpha2";
const ROUTE_KIND: &str = "UDPRoute";

pub async fn reconcile(route: Arc<UDPRoute>, ctx: Arc<Context>) -> Result<Action> {
    let nsname = route.metadata.namespaced_name()?;
    let udproute_api: Api<UDPRoute> = Api::namespaced(ctx.client.clone(), &nsname.namespace);

    let parent_refs: Vec<RouteParentRef> = route
        .spec
        .parent_refs
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(Into::into)
        .collect();

    if route.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&route.metadata) {
            // The gateway may already be gone, in which case there is no
            // VIP left to clean up.
            if let Some((gateway, parent_ref)) =
                find_managed_gateway(ctx.client.clone(), &nsname.namespace, &parent_refs, "UDP")
                    .await?
            {
                if let Ok(vip) = gateway_vip(&gateway, &parent_ref) {
                    ctx.dataplane.delete_vip(&vip).await?;
                }
            }
            remove_finalizer(&udproute_api, &nsname.name, &route.metadata).await?;
            info!("cleaned up udproute {} from the dataplane", nsname);
        }
        return Ok(Action::await_change());
    }

    let Some((gateway, parent_ref)) =
        find_managed_gateway(ctx.client.clone(), &nsname.namespace, &parent_refs, "UDP").await?
    else {
        debug!("udproute {} has no parent managed by this controller", nsname);
        return Ok(Action::await_change());
    };

    ensure_finalizer(&udproute_api, &nsname.name, &route.metadata).await?;

    let rules: Vec<Vec<RouteBackendRef>> = route
        .spec
        .rules
        .iter()
        .map(|rule| {
            rule.backend_refs
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(Into::into)
                .collect()
        })
        .collect();

    let backend_ref = match single_backend_ref(&rules) {
        Ok(backend_ref) => backend_ref,
        Err(err) => {
            warn!("udproute {} has an unsupported configuration: {}", nsname, err);
            let conditions = vec![route_accepted_condition(
                route.metadata.generation,
                "False",
                "UnsupportedValue",
                &err.to_string(),
            )];
            patch_route_status(
                &udproute_api,
                &nsname.name,
                ROUTE_API_VERSION,
                ROUTE_KIND,
                route_parents_status(&parent_ref, &nsname.namespace, &conditions),
            )
            .await?;
            // The condition stands until the resource changes.
            return Ok(Action::await_change());
        }
    };

    let vip = match gateway_vip(&gateway, &parent_ref) {
        Ok(vip) => vip,
        Err(err) => {
            warn!("udproute {} has an unusable gateway address: {}", nsname, err);
            let conditions = vec![route_accepted_condition(
                route.metadata.generation,
                "False",
                "UnsupportedAddress",
                &err.to_string(),
            )];
            patch_route_status(
                &udproute_api,
                &nsname.name,
                ROUTE_API_VERSION,
                ROUTE_KIND,
                route_parents_status(&parent_ref, &nsname.namespace, &conditions),
            )
            .await?;
            return Ok(Action::await_change());
        }
    };

    let targets =
        compile_route_targets(ctx.client.clone(), &nsname.namespace, vip, &backend_ref).await?;

    if let Err(err) = ctx.dataplane.update_targets(&targets).await {
        let conditions = vec![route_accepted_condition(
            route.metadata.generation,
            "False",
            "Pending",
            &err.to_string(),
        )];
        patch_route_status(
            &udproute_api,
            &nsname.name,
            ROUTE_API_VERSION,
            ROUTE_KIND,
            route_parents_status(&parent_ref, &nsname.namespace, &conditions),
        )
        .await?;
        return Err(err);
    }

    let conditions = vec![route_accepted_condition(
        route.metadata.generation,
        "True",
        "Accepted",
        "Route accepted and programmed on the dataplane",
    )];
    patch_route_status(
        &udproute_api,
        &nsname.name,
        ROUTE_API_VERSION,
        ROUTE_KIND,
        route_parents_status(&parent_ref, &nsname.namespace, &conditions),
    )
    .await?;

    info!("programmed udproute {} on the dataplane", nsname);

    // Endpoint changes have no dedicated watch; a periodic resync repushes
    // the same idempotent entry.
    Ok(Action::requeue(Duration::from_secs(30)))
}

pub async fn controller(ctx: Context, resync: mpsc::Receiver<()>) -> Result<()> {
    let udproute_api = Api::<UDPRoute>::all(ctx.client.clone());
    udproute_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    Controller::new(udproute_api, Config::default().any_semantic())
        .reconcile_all_on(ReceiverStream::new(resync))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<UDPRoute>, error: &Error, _: Arc<Context>) -> Action {
    match error {
        Error::EndpointsNotReady(_) => Action::requeue(Duration::from_secs(1)),
        _ => {
            warn!("reconcile failed: {:?}", error);
            Action::requeue(Duration::from_secs(5))
        }
    }
}

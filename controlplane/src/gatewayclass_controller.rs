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

use crate::conditions::{condition_is_true, new_condition, set_condition};
use crate::consts::{ASKA_FIELD_MANAGER, GATEWAY_CLASS_CONTROLLER_NAME};
use crate::{Context, Error, NamespaceName, Result};

use gateway_api::apis::standard::constants::{GatewayConditionReason, GatewayConditionType};
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::{controller::Action, watcher::Config, Controller},
};
use serde_json::json;
use tracing::{debug, info, warn};

// A class owned by another controller is rechecked occasionally in case its
// controllerName is corrected to ours.
const FOREIGN_CLASS_RECHECK: Duration = Duration::from_secs(1800);

/// Accepts every GatewayClass that names this controller; everything else is
/// left untouched.
pub async fn reconcile(gateway_class: Arc<GatewayClass>, ctx: Arc<Context>) -> Result<Action> {
    let name = gateway_class.metadata.name()?.to_string();

    if gateway_class.spec.controller_name != GATEWAY_CLASS_CONTROLLER_NAME {
        debug!(
            "gatewayclass {} belongs to {}; skipping",
            name, gateway_class.spec.controller_name
        );
        return Ok(Action::requeue(FOREIGN_CLASS_RECHECK));
    }

    let accepted_type = GatewayConditionType::Accepted.to_string();
    if condition_is_true(gateway_class.as_ref(), &accepted_type) {
        return Ok(Action::await_change());
    }

    info!("marking gatewayclass {} as accepted", name);

    let mut accepted = gateway_class.as_ref().clone();
    set_condition(
        &mut accepted,
        new_condition(
            &accepted_type,
            "True",
            &GatewayConditionReason::Accepted.to_string(),
            "Aska accepts responsibility for this GatewayClass",
            gateway_class.metadata.generation,
        ),
    );

    let gatewayclass_api = Api::<GatewayClass>::all(ctx.client.clone());
    publish_status(&gatewayclass_api, &name, &accepted).await?;

    Ok(Action::await_change())
}

async fn publish_status(
    api: &Api<GatewayClass>,
    name: &str,
    gateway_class: &GatewayClass,
) -> Result<()> {
    let empty = Vec::new();
    let conditions = gateway_class
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .unwrap_or(&empty);

    let patch = Patch::Apply(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "GatewayClass",
        "status": {
            "conditions": conditions
        }
    }));
    let params = PatchParams::apply(ASKA_FIELD_MANAGER).force();
    api.patch_status(name, &params, &patch)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

pub async fn controller(ctx: Context) -> Result<()> {
    let gwc_api = Api::<GatewayClass>::all(ctx.client.clone());
    gwc_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    Controller::new(gwc_api, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<GatewayClass>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5))
}

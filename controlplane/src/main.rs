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

use controlplane::*;

use std::sync::Arc;

use controlplane::agent_manager::{AgentManager, RouteResyncTrigger};
use kube::Client;
use tokio::sync::mpsc;
use tokio::try_join;
use tracing::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run().await;
    Ok(())
}

pub async fn run() {
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let dataplane = Arc::new(AgentManager::new());

    // Roster changes nudge the route controllers into a full re-push, which
    // is how a freshly joined agent receives the routes compiled before it
    // existed.
    let (tcp_resync_tx, tcp_resync_rx) = mpsc::channel(1);
    let (udp_resync_tx, udp_resync_rx) = mpsc::channel(1);
    dataplane
        .register_observer(Arc::new(RouteResyncTrigger::new(tcp_resync_tx)))
        .await;
    dataplane
        .register_observer(Arc::new(RouteResyncTrigger::new(udp_resync_tx)))
        .await;

    let ctx = Context {
        client: client.clone(),
        dataplane: dataplane.clone(),
    };

    let roster = {
        let dataplane = dataplane.clone();
        let client = client.clone();
        async move { dataplane.run(client).await }
    };

    if let Err(error) = try_join!(
        gateway_controller(ctx.clone()),
        gatewayclass_controller(ctx.clone()),
        tcproute_controller(ctx.clone(), tcp_resync_rx),
        udproute_controller(ctx.clone(), udp_resync_rx),
        roster,
    ) {
        error!("failed to start controllers: {error:?}");
        std::process::exit(1);
    }
}

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

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;

use crate::consts::{
    ASKA_APP_LABEL, ASKA_DATAPLANE_COMPONENT_LABEL, ASKA_NAMESPACE, DATAPLANE_API_PORT,
};
use crate::{Error, Result};
use backends::backends::{backends_client::BackendsClient, Targets, Vip};

use futures::{future::join_all, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use tokio::sync::{mpsc, RwLock};
use tonic::transport::Channel;
use tonic::Request;
use tracing::*;

/// One connected Node Agent: the pod it runs in and the gRPC stub dialed to
/// its data-plane API port. Cloning shares the underlying transport.
#[derive(Clone)]
pub struct AgentHandle {
    pub name: String,
    pub client: BackendsClient<Channel>,
}

/// Parties that want to re-push their state whenever the agent roster
/// changes, most importantly so a freshly joined agent receives routes that
/// were compiled before it existed. Registration is by handle; deregistration
/// by the same handle's identity.
#[tonic::async_trait]
pub trait ReconciliationObserver: Send + Sync {
    async fn setup_reconciliation(&self);
}

/// Feeds a roster-change notification into a controller's requeue stream
/// (see `Controller::reconcile_all_on`).
pub struct RouteResyncTrigger {
    tx: mpsc::Sender<()>,
}

impl RouteResyncTrigger {
    pub fn new(tx: mpsc::Sender<()>) -> Self {
        Self { tx }
    }
}

#[tonic::async_trait]
impl ReconciliationObserver for RouteResyncTrigger {
    async fn setup_reconciliation(&self) {
        // A full channel already guarantees a resync is coming.
        let _ = self.tx.try_send(());
    }
}

/// The roster of live Node Agents, one per data-plane pod, kept in step with
/// the cluster by a pod watch. All mutations notify the registered
/// observers.
#[derive(Default)]
pub struct AgentManager {
    agents: RwLock<HashMap<String, AgentHandle>>,
    observers: RwLock<Vec<Arc<dyn ReconciliationObserver>>>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_observer(&self, observer: Arc<dyn ReconciliationObserver>) {
        self.observers.write().await.push(observer);
    }

    pub async fn deregister_observer(&self, observer: &Arc<dyn ReconciliationObserver>) {
        self.observers
            .write()
            .await
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    async fn notify_observers(&self) {
        let observers: Vec<_> = self.observers.read().await.to_vec();
        join_all(
            observers
                .iter()
                .map(|observer| observer.setup_reconciliation()),
        )
        .await;
    }

    /// Watches the data-plane pods and keeps one connected agent per pod
    /// until the shutdown signal arrives, then drops every transport.
    pub async fn run(&self, client: Client) -> Result<()> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received; closing agent transports");
                self.shutdown().await;
                Ok(())
            }
            result = self.watch_dataplane_pods(client) => result,
        }
    }

    async fn watch_dataplane_pods(&self, client: Client) -> Result<()> {
        let pod_api: Api<Pod> = Api::namespaced(client, ASKA_NAMESPACE);
        let config = watcher::Config::default().labels(&format!(
            "app={ASKA_APP_LABEL},component={ASKA_DATAPLANE_COMPONENT_LABEL}"
        ));

        let stream = watcher(pod_api, config).default_backoff();
        let mut stream = pin!(stream);
        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|err| Error::DataplaneError(err.to_string()))?
        {
            match event {
                watcher::Event::Applied(pod) => self.register_agent(&pod).await,
                watcher::Event::Deleted(pod) => self.deregister_agent(&pod).await,
                watcher::Event::Restarted(pods) => {
                    for pod in &pods {
                        self.register_agent(pod).await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn register_agent(&self, pod: &Pod) {
        let Some(key) = agent_key(pod) else {
            return;
        };
        // The connection is long-lived; a status update on a pod we already
        // dialed is a no-op rather than a re-dial.
        if self.agents.read().await.contains_key(&key) {
            return;
        }
        let Some(pod_ip) = pod
            .status
            .as_ref()
            .and_then(|status| status.pod_ip.clone())
        else {
            return;
        };

        let endpoint = format!("http://{pod_ip}:{DATAPLANE_API_PORT}");
        match BackendsClient::connect(endpoint.clone()).await {
            Ok(client) => {
                info!("connected to dataplane pod {} at {}", key, pod_ip);
                self.agents.write().await.insert(
                    key,
                    AgentHandle {
                        name: pod.name_any(),
                        client,
                    },
                );
                self.notify_observers().await;
            }
            Err(err) => {
                // The next status update on the pod retries the dial.
                warn!("failed to connect to dataplane pod {key} at {endpoint}: {err}");
            }
        }
    }

    async fn deregister_agent(&self, pod: &Pod) {
        let Some(key) = agent_key(pod) else {
            return;
        };
        if self.agents.write().await.remove(&key).is_some() {
            info!("removed dataplane pod {}; transport closed", key);
            self.notify_observers().await;
        }
    }

    /// Drops the whole roster; dropping each handle closes its transport.
    pub async fn shutdown(&self) {
        self.agents.write().await.clear();
    }

    async fn snapshot(&self) -> Vec<AgentHandle> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Installs `targets` on every agent concurrently. Every agent is
    /// attempted; the failures are joined into one error, one contribution
    /// per failing agent. Successful agents keep the applied change, there
    /// is no rollback.
    pub async fn update_targets(&self, targets: &Targets) -> Result<()> {
        let agents = self.snapshot().await;
        if agents.is_empty() {
            return Err(Error::DataplaneError(
                "no dataplane agents available".to_string(),
            ));
        }

        let mut tasks = Vec::with_capacity(agents.len());
        for agent in agents {
            let targets = targets.clone();
            tasks.push(tokio::spawn(async move {
                let mut client = agent.client.clone();
                match client.update(Request::new(targets)).await {
                    Ok(_) => {
                        info!("updated targets on dataplane pod {}", agent.name);
                        Ok(())
                    }
                    Err(status) => Err(format!("{}: {}", agent.name, status.message())),
                }
            }));
        }

        join_fanout(tasks).await
    }

    /// Removes the entry for `vip` from every agent concurrently, with the
    /// same partial-failure semantics as `update_targets`. An empty roster
    /// holds no entries, so it is a success.
    pub async fn delete_vip(&self, vip: &Vip) -> Result<()> {
        let agents = self.snapshot().await;

        let mut tasks = Vec::with_capacity(agents.len());
        for agent in agents {
            let vip = vip.clone();
            tasks.push(tokio::spawn(async move {
                let mut client = agent.client.clone();
                match client.delete(Request::new(vip)).await {
                    Ok(_) => {
                        info!("deleted vip on dataplane pod {}", agent.name);
                        Ok(())
                    }
                    Err(status) => Err(format!("{}: {}", agent.name, status.message())),
                }
            }));
        }

        join_fanout(tasks).await
    }
}

async fn join_fanout(tasks: Vec<tokio::task::JoinHandle<Result<(), String>>>) -> Result<()> {
    let mut failures = Vec::new();
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => failures.push(failure),
            Err(err) => failures.push(format!("fan-out task panicked: {err}")),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::FanoutError(failures))
    }
}

fn agent_key(pod: &Pod) -> Option<String> {
    Some(format!("{}/{}", pod.namespace()?, pod.name_any()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        notified: AtomicUsize,
    }

    #[tonic::async_trait]
    impl ReconciliationObserver for CountingObserver {
        async fn setup_reconciliation(&self) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn observers_are_notified_until_deregistered() {
        let manager = AgentManager::new();
        let observer = Arc::new(CountingObserver {
            notified: AtomicUsize::new(0),
        });

        let handle: Arc<dyn ReconciliationObserver> = observer.clone();
        manager.register_observer(handle.clone()).await;

        manager.notify_observers().await;
        manager.notify_observers().await;
        assert_eq!(observer.notified.load(Ordering::SeqCst), 2);

        manager.deregister_observer(&handle).await;
        manager.notify_observers().await;
        assert_eq!(observer.notified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resync_trigger_tolerates_a_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let trigger = RouteResyncTrigger::new(tx);

        // The second notification lands on a full channel and is dropped;
        // the pending one still guarantees a resync.
        trigger.setup_reconciliation().await;
        trigger.setup_reconciliation().await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fanout_aggregates_one_entry_per_failure() {
        let tasks = vec![
            tokio::spawn(async { Ok(()) }),
            tokio::spawn(async { Err("agent-a: connection refused".to_string()) }),
            tokio::spawn(async { Err("agent-b: deadline exceeded".to_string()) }),
        ];

        let err = join_fanout(tasks).await.unwrap_err();
        match err {
            Error::FanoutError(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().any(|f| f.starts_with("agent-a")));
                assert!(failures.iter().any(|f| f.starts_with("agent-b")));
            }
            other => panic!("expected FanoutError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_with_empty_roster_is_a_success() {
        let manager = AgentManager::new();
        let vip = Vip { ip: 0, port: 9875 };
        assert!(manager.delete_vip(&vip).await.is_ok());
    }

    #[tokio::test]
    async fn update_with_empty_roster_is_an_error() {
        let manager = AgentManager::new();
        let targets = Targets {
            vip: Some(Vip { ip: 0, port: 9875 }),
            target: None,
        };
        assert!(manager.update_targets(&targets).await.is_err());
    }
}

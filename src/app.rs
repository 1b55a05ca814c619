// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::discovery::LocalClient;
use crate::state::WorkloadStore;
use crate::{config, proxy, signal};

pub async fn build(config: Arc<config::Config>) -> anyhow::Result<Bound> {
    let shutdown = signal::Shutdown::new();
    let state = Arc::new(RwLock::new(WorkloadStore::default()));
    // Dropping drain_tx (or sending on it) tells the proxy listener to stop
    // accepting new connections.
    let (drain_tx, drain_rx) = watch::channel(());

    match &config.workload_manifest {
        Some(source) => {
            let client = LocalClient::new(source.clone(), state.clone(), config.resync_interval);
            let shutdown_trigger = shutdown.trigger();
            tokio::spawn(async move {
                if let Err(e) = client.run().await {
                    error!("workload discovery failed: {e:#}");
                    shutdown_trigger.shutdown_now().await;
                }
            });
        }
        None => warn!("no workload manifest configured, all spans will be forwarded untagged"),
    }

    let proxy = proxy::Proxy::new(&config, state.clone()).await?;
    let proxy_address = proxy.address();
    tokio::spawn(proxy.run(drain_rx));

    Ok(Bound {
        proxy_address,
        state,
        shutdown,
        drain_tx,
    })
}

pub struct Bound {
    pub proxy_address: SocketAddr,
    pub state: Arc<RwLock<WorkloadStore>>,

    pub shutdown: signal::Shutdown,
    drain_tx: watch::Sender<()>,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        // Wait for a signal to shutdown from an explicit trigger or the OS
        self.shutdown.wait().await;
        let _ = self.drain_tx.send(());
        info!("shutdown completed");
        Ok(())
    }
}

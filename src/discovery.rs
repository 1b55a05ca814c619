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

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::ConfigSource;
use crate::state::{Workload, WorkloadStore};

/// One event from the workload feed. Any transport that eventually reflects
/// cluster state and heals missed events with a periodic resync can produce
/// these; the store only ever sees upserts and removes.
#[derive(Debug, Clone)]
pub enum WorkloadUpdate {
    Update(Workload),
    Remove(String),
}

/// Applies workload feed events to the shared store. All mutation goes
/// through here, so the store is only ever touched under its write lock.
#[derive(Clone)]
pub struct StateUpdater {
    state: Arc<RwLock<WorkloadStore>>,
}

impl StateUpdater {
    pub fn new(state: Arc<RwLock<WorkloadStore>>) -> Self {
        Self { state }
    }

    pub fn insert_workload(&self, w: Workload) {
        debug!(uid = %w.uid, "handling workload insert");
        self.state.write().unwrap().insert(w);
    }

    pub fn remove_workload(&self, uid: &str) {
        debug!(%uid, "handling workload delete");
        self.state.write().unwrap().remove(uid);
    }

    /// Replaces the entire store with a fresh snapshot. Used by full resyncs.
    pub fn replace_all(&self, workloads: Vec<Workload>) {
        let mut store = WorkloadStore::default();
        for w in workloads {
            trace!(uid = %w.uid, "inserting workload from snapshot");
            store.insert(w);
        }
        *self.state.write().unwrap() = store;
    }

    /// Consumes a stream of feed events until the sender side closes.
    pub async fn run(self, mut events: mpsc::Receiver<WorkloadUpdate>) {
        while let Some(event) = events.recv().await {
            match event {
                WorkloadUpdate::Update(w) => self.insert_workload(w),
                WorkloadUpdate::Remove(uid) => self.remove_workload(&uid),
            }
        }
        debug!("workload feed closed");
    }
}

#[derive(Default, Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalConfig {
    #[serde(default)]
    pub workloads: Vec<Workload>,
}

/// LocalClient feeds the store from a YAML manifest instead of a live watch.
/// The manifest is re-read on an interval; each pass replaces the snapshot
/// wholesale, which is also what heals any edits missed between passes.
pub struct LocalClient {
    cfg: ConfigSource,
    updater: StateUpdater,
    resync_interval: Duration,
}

impl LocalClient {
    pub fn new(
        cfg: ConfigSource,
        state: Arc<RwLock<WorkloadStore>>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            cfg,
            updater: StateUpdater::new(state),
            resync_interval,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        // A manifest that is broken at startup is an operator error; a manifest
        // that breaks later should not take down the last good snapshot.
        self.load_config()
            .await
            .context("initial workload manifest load")?;

        let mut interval = tokio::time::interval(self.resync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // the first tick completes immediately
        loop {
            interval.tick().await;
            if let Err(e) = self.load_config().await {
                warn!("workload manifest resync failed, keeping previous snapshot: {e:#}");
            }
        }
    }

    async fn load_config(&self) -> anyhow::Result<()> {
        let raw = self.cfg.read_to_string().await?;
        let config: LocalConfig = serde_yaml::from_str(&raw)?;
        let num_workloads = config.workloads.len();
        self.updater.replace_all(config.workloads);
        debug!(%num_workloads, "local workload manifest applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_workload;
    use bytes::Bytes;
    use std::net::IpAddr;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn updater_applies_event_stream() {
        let state = Arc::new(RwLock::new(WorkloadStore::default()));
        let updater = StateUpdater::new(state.clone());
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(updater.run(rx));

        tx.send(WorkloadUpdate::Update(test_workload(
            "default/a",
            Some("192.0.2.1"),
            Some("team-a"),
        )))
        .await
        .unwrap();
        tx.send(WorkloadUpdate::Update(test_workload(
            "default/b",
            Some("192.0.2.2"),
            None,
        )))
        .await
        .unwrap();
        tx.send(WorkloadUpdate::Remove("default/b".to_string()))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        let store = state.read().unwrap();
        assert_eq!(store.num_workloads(), 1);
        assert_eq!(store.find_address(&addr("192.0.2.1")).len(), 1);
        assert!(store.find_address(&addr("192.0.2.2")).is_empty());
    }

    #[tokio::test]
    async fn local_client_loads_manifest() {
        let manifest = r#"
workloads:
- uid: default/backend
  name: backend
  namespace: default
  address: 192.0.2.1
  labels:
    owner: team-backend
- uid: default/pending
  name: pending
  namespace: default
"#;
        let state = Arc::new(RwLock::new(WorkloadStore::default()));
        let client = LocalClient::new(
            ConfigSource::Static(Bytes::from_static(manifest.as_bytes())),
            state.clone(),
            Duration::from_secs(10),
        );
        client.load_config().await.unwrap();

        let store = state.read().unwrap();
        assert_eq!(store.num_workloads(), 2);
        let found = store.find_address(&addr("192.0.2.1"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].labels["owner"], "team-backend");
        // The unaddressed workload loaded, but is not reachable by address.
        assert!(store.find_uid("default/pending").is_some());
    }

    #[tokio::test]
    async fn resync_replaces_snapshot() {
        let state = Arc::new(RwLock::new(WorkloadStore::default()));
        let updater = StateUpdater::new(state.clone());
        updater.replace_all(vec![test_workload(
            "default/stale",
            Some("192.0.2.9"),
            Some("team-a"),
        )]);
        updater.replace_all(vec![test_workload(
            "default/fresh",
            Some("192.0.2.1"),
            Some("team-b"),
        )]);

        let store = state.read().unwrap();
        assert!(store.find_uid("default/stale").is_none());
        assert!(store.find_address(&addr("192.0.2.9")).is_empty());
        assert_eq!(store.find_address(&addr("192.0.2.1")).len(), 1);
    }

    #[tokio::test]
    async fn bad_manifest_keeps_previous_snapshot() {
        let state = Arc::new(RwLock::new(WorkloadStore::default()));
        let good = LocalClient::new(
            ConfigSource::Static(Bytes::from_static(
                b"workloads:\n- uid: default/a\n  address: 192.0.2.1\n",
            )),
            state.clone(),
            Duration::from_secs(10),
        );
        good.load_config().await.unwrap();

        let bad = LocalClient::new(
            ConfigSource::Static(Bytes::from_static(b"workloads: {not valid")),
            state.clone(),
            Duration::from_secs(10),
        );
        assert!(bad.load_config().await.is_err());

        // The earlier snapshot is untouched.
        assert_eq!(state.read().unwrap().num_workloads(), 1);
    }
}

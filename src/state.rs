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

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::trace;

/// A single workload known to the cluster: a stable identity, at most one
/// advertised address, and the metadata labels attribution is derived from.
#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Workload {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,

    /// The address the workload currently advertises. None until the cluster
    /// assigns one; unaddressed workloads are never indexed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Workload{{{} with uid {} at {}}}",
            self.name,
            self.uid,
            self.address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "None".into()),
        )
    }
}

/// A WorkloadStore encapsulates all workloads currently known to the proxy,
/// indexed by advertised address for the request path.
#[derive(Default, Debug)]
pub struct WorkloadStore {
    /// byAddr maps an address to every workload currently advertising it.
    /// Address reuse during workload churn means this is transiently
    /// many-to-many; an address with no owners is absent entirely.
    by_addr: HashMap<IpAddr, HashSet<String>>,
    /// byUid maps workload UIDs to workloads.
    by_uid: HashMap<String, Arc<Workload>>,
}

impl WorkloadStore {
    pub fn insert(&mut self, w: Workload) {
        // First, remove the entry entirely so an address move never leaves a
        // stale owner behind.
        self.remove(&w.uid);

        let w = Arc::new(w);
        if let Some(addr) = w.address {
            self.by_addr.entry(addr).or_default().insert(w.uid.clone());
        }
        self.by_uid.insert(w.uid.clone(), w);
    }

    pub fn remove(&mut self, uid: &str) -> Option<Arc<Workload>> {
        match self.by_uid.remove(uid) {
            None => {
                trace!("tried to remove workload keyed by {uid} but it was not found");
                None
            }
            Some(prev) => {
                if let Some(addr) = prev.address
                    && let Some(owners) = self.by_addr.get_mut(&addr)
                {
                    owners.remove(uid);
                    if owners.is_empty() {
                        self.by_addr.remove(&addr);
                    }
                }
                Some(prev)
            }
        }
    }

    /// Finds all workloads currently advertising the address. More than one
    /// result is possible while an address is being handed off between
    /// workloads; callers decide how to treat the ambiguity.
    pub fn find_address(&self, addr: &IpAddr) -> Vec<Arc<Workload>> {
        self.by_addr
            .get(addr)
            .map(|owners| {
                owners
                    .iter()
                    .filter_map(|uid| self.by_uid.get(uid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Finds the workload by uid.
    pub fn find_uid(&self, uid: &str) -> Option<Arc<Workload>> {
        self.by_uid.get(uid).cloned()
    }

    pub fn num_workloads(&self) -> usize {
        self.by_uid.len()
    }
}

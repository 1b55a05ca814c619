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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{Map, Value};

use crate::config::{Config, default_label_tag_mapping};
use crate::state::Workload;
use crate::telemetry;

// Ensure that the `tracing` stack is only initialised once using `once_cell`
static TRACING: Lazy<()> = Lazy::new(telemetry::setup_logging);

pub fn initialize_telemetry() {
    Lazy::force(&TRACING);
}

/// A config pointed at a collector, with everything else defaulted for tests.
pub fn test_config(collector_addr: SocketAddr) -> Config {
    Config {
        label_tag_mapping: default_label_tag_mapping(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        collector_addr,
        workload_manifest: None,
        resync_interval: Duration::from_secs(10),
    }
}

/// A workload whose uid doubles as `namespace/name`. An `owner` of None means
/// the workload carries no labels at all.
pub fn test_workload(uid: &str, address: Option<&str>, owner: Option<&str>) -> Workload {
    let (namespace, name) = uid.split_once('/').unwrap_or(("default", uid));
    Workload {
        uid: uid.to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
        address: address.map(|a| a.parse().expect("test address must parse")),
        labels: owner
            .map(|o| HashMap::from([("owner".to_string(), o.to_string())]))
            .unwrap_or_default(),
    }
}

/// One span in Zipkin v2 JSON, with the given tags (None omits the tags key
/// entirely).
pub fn test_span(tags: Option<&[(&str, &str)]>) -> String {
    let mut span = serde_json::json!({
        "id": "352bff9a74ca9ad2",
        "traceId": "5af7183fb1d4cf5f",
        "parentId": "6b221d5bc9e6496c",
        "name": "get /api",
        "timestamp": 1556604172355737u64,
        "duration": 1431,
        "kind": "SERVER",
        "localEndpoint": {"serviceName": "backend", "ipv4": "192.168.99.1", "port": 3306},
        "remoteEndpoint": {"ipv4": "172.19.0.2", "port": 58648}
    });
    if let Some(tags) = tags {
        span["tags"] = Value::Object(
            tags.iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect::<Map<String, Value>>(),
        );
    }
    span.to_string()
}

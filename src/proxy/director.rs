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
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Method, Request, Uri, header};
use http_body::Body;
use http_body_util::BodyExt;
use serde_json::{Map, Value};
use tracing::{debug, error, trace, warn};

use super::{BoxError, ProxyBody, full_body};
use crate::config::Config;
use crate::state::WorkloadStore;

/// The only endpoint whose body is ever inspected.
pub const SPANS_PATH: &str = "/api/v2/spans";

/// Director rewrites each inbound request before it is forwarded: the target
/// host always, the body only when the caller resolves to exactly one known
/// workload and a mapped label would actually change a tag.
///
/// Failures in the tag path degrade to forwarding the original body
/// untouched; a broken inbound stream is surfaced upstream as-is, never
/// papered over with a fabricated body.
pub struct Director {
    state: Arc<RwLock<WorkloadStore>>,
    mapping: HashMap<String, String>,
    collector: Authority,
}

impl Director {
    pub fn new(cfg: &Config, state: Arc<RwLock<WorkloadStore>>) -> Self {
        Director {
            state,
            mapping: cfg.label_tag_mapping.clone(),
            collector: cfg
                .collector_addr
                .to_string()
                .parse()
                .expect("a socket address is a valid authority"),
        }
    }

    pub async fn direct<B>(&self, mut req: Request<B>, peer: SocketAddr) -> Request<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        // The forwarding decision itself: every request goes to the collector,
        // tagged or not.
        self.set_upstream(&mut req);

        if req.method() != Method::POST || req.uri().path() != SPANS_PATH {
            trace!(method = %req.method(), path = req.uri().path(), "not a span submission, passing through");
            return req.map(|b| ProxyBody::new(b.map_err(Into::into)));
        }
        let Some(staged) = self.staged_tags(peer.ip()) else {
            return req.map(|b| ProxyBody::new(b.map_err(Into::into)));
        };

        let (parts, body) = req.into_parts();
        let original = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let e = e.into();
                error!("failed to read span submission body: {e}");
                // The caller's stream already failed; surface that failure
                // upstream rather than fabricate a complete empty submission.
                return Request::from_parts(parts, super::error_body(e));
            }
        };

        let body = match inject_tags(&original, &staged) {
            Some(updated) => Bytes::from(updated),
            None => original,
        };
        rebuild(parts, body)
    }

    fn set_upstream<B>(&self, req: &mut Request<B>) {
        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(Scheme::HTTP);
        parts.authority = Some(self.collector.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        *req.uri_mut() = Uri::from_parts(parts).expect("scheme, authority and path are all set");
    }

    /// Resolves the caller and stages the tags to inject. None means there is
    /// nothing to do and the body does not even need to be read.
    fn staged_tags(&self, caller: IpAddr) -> Option<Map<String, Value>> {
        let owners = self.state.read().unwrap().find_address(&caller);
        let workload = match owners.as_slice() {
            [workload] => workload,
            [] => {
                debug!(%caller, "no workload found for caller address");
                return None;
            }
            _ => {
                // Never guess between owners during an address handoff.
                debug!(%caller, count = owners.len(), "multiple workloads share caller address, skipping");
                return None;
            }
        };

        let mut staged = Map::new();
        for (label, tag) in &self.mapping {
            match workload.labels.get(label) {
                Some(value) if !value.is_empty() => {
                    staged.insert(tag.clone(), Value::String(value.clone()));
                }
                _ => trace!(label, workload = %workload.uid, "label not set on workload"),
            }
        }
        if staged.is_empty() {
            debug!(workload = %workload.uid, "no mapped labels present, passing through");
            return None;
        }
        Some(staged)
    }
}

/// Rebuilds a buffered request. The replacement body gets an exact length so
/// the collector never sees a stale content-length from the original stream.
fn rebuild(mut parts: http::request::Parts, body: Bytes) -> Request<ProxyBody> {
    parts.headers.remove(header::TRANSFER_ENCODING);
    parts
        .headers
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from(body.len()));
    Request::from_parts(parts, full_body(body))
}

/// Applies the staged tags to a span submission. Returns the re-serialized
/// body only if at least one span actually changed; any parse or serialize
/// failure, or a no-op pass, returns None so the caller keeps the original
/// bytes exactly as received.
fn inject_tags(body: &[u8], staged: &Map<String, Value>) -> Option<Vec<u8>> {
    let mut spans: Vec<Map<String, Value>> = match serde_json::from_slice(body) {
        Ok(spans) => spans,
        Err(e) => {
            warn!("failed to parse spans from request body: {e}");
            return None;
        }
    };

    let mut modified = false;
    for span in spans.iter_mut() {
        if !span.contains_key("tags") {
            span.insert("tags".to_string(), Value::Object(staged.clone()));
            modified = true;
            continue;
        }
        // A malformed tag container skips this span only; siblings still get
        // their tags.
        let Some(Value::Object(tags)) = span.get_mut("tags") else {
            warn!("span tags are not an object, skipping span");
            continue;
        };
        if !tags.values().all(Value::is_string) {
            warn!("span tags are not a flat string map, skipping span");
            continue;
        }
        for (tag, value) in staged {
            // A caller-supplied tag always wins over attribution.
            let caller_set = matches!(tags.get(tag.as_str()), Some(Value::String(v)) if !v.is_empty());
            if caller_set {
                trace!(tag, "tag already set on span, keeping original value");
                continue;
            }
            tags.insert(tag.clone(), value.clone());
            modified = true;
        }
    }

    if !modified {
        trace!("no tags changed, keeping original body");
        return None;
    }
    match serde_json::to_vec(&spans) {
        Ok(updated) => Some(updated),
        Err(e) => {
            warn!("failed to serialize updated spans, keeping original body: {e}");
            None
        }
    }
}

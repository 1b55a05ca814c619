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
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

const LABEL_TAG_MAPPING: &str = "LABEL_TAG_MAPPING";
const LISTEN_PORT: &str = "LISTEN_PORT";
const COLLECTOR_ADDRESS: &str = "COLLECTOR_ADDRESS";
const WORKLOAD_MANIFEST_PATH: &str = "WORKLOAD_MANIFEST_PATH";
const RESYNC_INTERVAL_SECS: &str = "RESYNC_INTERVAL_SECS";

const DEFAULT_LISTEN_PORT: u16 = 9411;
const DEFAULT_COLLECTOR_ADDRESS: SocketAddr =
    SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 9410);
const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(10);

/// The mapping applied when LABEL_TAG_MAPPING is unset: the `owner` label
/// becomes the `owner` span tag.
pub fn default_label_tag_mapping() -> HashMap<String, String> {
    HashMap::from([("owner".to_string(), "owner".to_string())])
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Static(Bytes),
}

impl ConfigSource {
    pub async fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(match self {
            ConfigSource::File(path) => tokio::fs::read_to_string(path).await?,
            ConfigSource::Static(data) => std::str::from_utf8(data).map(|s| s.to_string())?,
        })
    }
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Workload label name -> span tag name. Only labels named here are ever
    /// copied onto spans.
    pub label_tag_mapping: HashMap<String, String>,

    pub listen_addr: SocketAddr,
    /// The collector every request is forwarded to, tagged or not.
    pub collector_addr: SocketAddr,

    /// YAML manifest of workloads, used as the local discovery feed. If unset,
    /// no workloads are known and all spans pass through untagged.
    pub workload_manifest: Option<ConfigSource>,
    /// How often the workload manifest is re-read to heal missed events.
    pub resync_interval: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
}

/// Raw environment overrides, separated from the environment itself so parsing
/// is testable without mutating process state.
#[derive(Default, Debug, Clone)]
pub struct EnvOverrides {
    pub label_tag_mapping: Option<String>,
    pub listen_port: Option<String>,
    pub collector_address: Option<String>,
    pub workload_manifest_path: Option<String>,
    pub resync_interval_secs: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        EnvOverrides {
            label_tag_mapping: std::env::var(LABEL_TAG_MAPPING).ok(),
            listen_port: std::env::var(LISTEN_PORT).ok(),
            collector_address: std::env::var(COLLECTOR_ADDRESS).ok(),
            workload_manifest_path: std::env::var(WORKLOAD_MANIFEST_PATH).ok(),
            resync_interval_secs: std::env::var(RESYNC_INTERVAL_SECS).ok(),
        }
    }
}

fn parse<T: FromStr>(env: &str, val: Option<&str>) -> Result<Option<T>, Error> {
    match empty_to_none(val) {
        Some(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val.to_string())),
        None => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, val: Option<&str>, default: T) -> Result<T, Error> {
    parse(env, val).map(|v| v.unwrap_or(default))
}

fn parse_label_tag_mapping(val: Option<&str>) -> Result<HashMap<String, String>, Error> {
    match empty_to_none(val) {
        None => Ok(default_label_tag_mapping()),
        // Anything other than a JSON object of strings is a fatal configuration error.
        Some(val) => serde_json::from_str(val)
            .map_err(|_| Error::EnvVar(LABEL_TAG_MAPPING.to_string(), val.to_string())),
    }
}

pub fn parse_config() -> Result<Config, Error> {
    construct_config(EnvOverrides::from_env())
}

pub fn construct_config(env: EnvOverrides) -> Result<Config, Error> {
    Ok(Config {
        label_tag_mapping: parse_label_tag_mapping(env.label_tag_mapping.as_deref())?,

        listen_addr: SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            parse_default(LISTEN_PORT, env.listen_port.as_deref(), DEFAULT_LISTEN_PORT)?,
        ),
        collector_addr: parse_default(
            COLLECTOR_ADDRESS,
            env.collector_address.as_deref(),
            DEFAULT_COLLECTOR_ADDRESS,
        )?,

        workload_manifest: parse::<PathBuf>(
            WORKLOAD_MANIFEST_PATH,
            env.workload_manifest_path.as_deref(),
        )?
        .map(ConfigSource::File),
        resync_interval: Duration::from_secs(parse_default(
            RESYNC_INTERVAL_SECS,
            env.resync_interval_secs.as_deref(),
            DEFAULT_RESYNC_INTERVAL.as_secs(),
        )?),
    })
}

pub fn empty_to_none(inp: Option<&str>) -> Option<&str> {
    match inp {
        Some("") => None,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn config_with_mapping(mapping: Option<&str>) -> Result<Config, Error> {
        construct_config(EnvOverrides {
            label_tag_mapping: mapping.map(|s| s.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn mapping_with_two_entries() {
        let cfg = config_with_mapping(Some(r#"{"label_a":"tag_a", "label_b": "tag_b"}"#)).unwrap();
        assert_eq!(
            cfg.label_tag_mapping,
            HashMap::from([
                ("label_a".to_string(), "tag_a".to_string()),
                ("label_b".to_string(), "tag_b".to_string()),
            ])
        );
    }

    #[test_case(None; "unset")]
    #[test_case(Some(""); "empty string")]
    fn mapping_defaults(mapping: Option<&str>) {
        let cfg = config_with_mapping(mapping).unwrap();
        assert_eq!(cfg.label_tag_mapping, default_label_tag_mapping());
    }

    #[test]
    fn mapping_empty_object_disables_tagging() {
        let cfg = config_with_mapping(Some("{}")).unwrap();
        assert!(cfg.label_tag_mapping.is_empty());
    }

    #[test_case(r#"["asdf"]"#; "array")]
    #[test_case(r#"{"owner": 1}"#; "non string value")]
    #[test_case("not json"; "garbage")]
    fn mapping_rejects_non_object(mapping: &str) {
        assert!(config_with_mapping(Some(mapping)).is_err());
    }

    #[test]
    fn listen_port() {
        let cfg = construct_config(EnvOverrides {
            listen_port: Some("9999".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.listen_addr.port(), 9999);

        let cfg = construct_config(EnvOverrides::default()).unwrap();
        assert_eq!(cfg.listen_addr.port(), DEFAULT_LISTEN_PORT);

        let res = construct_config(EnvOverrides {
            listen_port: Some("not-a-port".to_string()),
            ..Default::default()
        });
        assert!(res.is_err());
    }

    #[test]
    fn collector_address() {
        let cfg = construct_config(EnvOverrides::default()).unwrap();
        assert_eq!(cfg.collector_addr, "127.0.0.1:9410".parse().unwrap());

        let cfg = construct_config(EnvOverrides {
            collector_address: Some("10.1.2.3:9999".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.collector_addr, "10.1.2.3:9999".parse().unwrap());
    }

    #[test]
    fn workload_manifest_path() {
        let cfg = construct_config(EnvOverrides {
            workload_manifest_path: Some("/etc/tagproxy/workloads.yaml".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            cfg.workload_manifest,
            Some(ConfigSource::File(PathBuf::from(
                "/etc/tagproxy/workloads.yaml"
            )))
        );

        let cfg = construct_config(EnvOverrides::default()).unwrap();
        assert_eq!(cfg.workload_manifest, None);
    }
}

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

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::hyper_util::plaintext_response;
use crate::state::WorkloadStore;

mod director;
pub use director::Director;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The single body type flowing upstream: either the caller's stream passed
/// through untouched, or a buffered replacement.
pub type ProxyBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pub(crate) fn full_body(data: Bytes) -> ProxyBody {
    ProxyBody::new(Full::new(data).map_err(|never| match never {}))
}

/// A body that fails on first poll. Used when the inbound stream broke
/// mid-read: the upstream attempt must fail the same way the original
/// stream did, not look like a complete request.
pub(crate) fn error_body(err: BoxError) -> ProxyBody {
    ProxyBody::new(ErrorBody(Some(err)))
}

struct ErrorBody(Option<BoxError>);

impl http_body::Body for ErrorBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<http_body::Frame<Bytes>, BoxError>>> {
        std::task::Poll::Ready(self.0.take().map(Err))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind to address {0}: {1}")]
    Bind(SocketAddr, io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The listener plus everything a request needs: the director deciding how to
/// rewrite it and the client that carries it to the collector.
pub struct Proxy {
    listener: tokio::net::TcpListener,
    address: SocketAddr,
    director: Arc<Director>,
    client: Client<HttpConnector, ProxyBody>,
}

impl Proxy {
    pub async fn new(cfg: &Config, state: Arc<RwLock<WorkloadStore>>) -> Result<Self, Error> {
        let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
            .await
            .map_err(|e| Error::Bind(cfg.listen_addr, e))?;
        let address = listener.local_addr()?;

        let mut connector = HttpConnector::new();
        connector.set_keepalive(Some(Duration::from_secs(90)));
        connector.set_connect_timeout(Some(Duration::from_secs(5)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Proxy {
            listener,
            address,
            director: Arc::new(Director::new(cfg, state)),
            client,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        info!(address=%self.address, component="proxy", "listener established");
        loop {
            tokio::select! {
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let director = self.director.clone();
                        let client = self.client.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(director, client, stream, peer).await {
                                error!(%peer, "error serving connection: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {e}");
                    }
                },
                _ = shutdown.changed() => {
                    info!("proxy listener draining");
                    return;
                }
            }
        }
    }
}

async fn handle_connection(
    director: Arc<Director>,
    client: Client<HttpConnector, ProxyBody>,
    stream: TcpStream,
    peer: SocketAddr,
) -> hyper::Result<()> {
    crate::hyper_util::http1_server()
        .half_close(true)
        .header_read_timeout(Duration::from_secs(2))
        .serve_connection(
            TokioIo::new(stream),
            service_fn(move |req: Request<Incoming>| {
                let director = director.clone();
                let client = client.clone();
                async move { forward(&director, &client, req, peer).await }
            }),
        )
        .await
}

async fn forward(
    director: &Director,
    client: &Client<HttpConnector, ProxyBody>,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    let req = director.direct(req, peer).await;
    match client.request(req).await {
        Ok(resp) => Ok(resp.map(|b| ProxyBody::new(b.map_err(Into::into)))),
        Err(e) => {
            warn!("failed to reach collector: {e}");
            Ok(
                plaintext_response(StatusCode::BAD_GATEWAY, format!("collector unreachable: {e}\n"))
                    .map(|b| ProxyBody::new(b.map_err(|never| match never {}))),
            )
        }
    }
}

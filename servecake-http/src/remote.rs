use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use parking_lot::RwLock;
use serde_json::{json, Value};
use servecake_router::{
    CallArgs,
    DeploymentService,
    LocalChannel,
    ReplicaChannel,
    ReplicaFailure,
    ReplicaRequest,
};
use tokio::task::JoinHandle;

use crate::net::{start_server, RequestHandler};
use crate::status::{failure_status, json_response, APPLICATION_JSON};
use crate::CALL_ID_HEADER;

pub(crate) static HEALTH_PATH: &str = "/_health";

#[derive(Debug, thiserror::Error)]
#[error("Failed to bind replica server to {addr}: {source}")]
pub struct ReplicaServerBindError {
    addr: SocketAddr,
    #[source]
    source: hyper::Error,
}

/// Hosts deployment services so replicas can run in another process.
///
/// Services can be added and removed while the server is running.
/// Each call arrives as `POST /{deployment}/{method}` with a JSON
/// encoded [CallArgs] body.
pub struct ReplicaServer {
    local_addr: SocketAddr,
    state: ReplicaServerState,
    handle: JoinHandle<()>,
}

impl ReplicaServer {
    /// Spawns the replica server task and returns the server handle.
    pub async fn listen(addr: SocketAddr) -> Result<Self, ReplicaServerBindError> {
        let state = ReplicaServerState::default();
        let (local_addr, handle) = start_server(addr, state.clone(), true)
            .map_err(|source| ReplicaServerBindError { addr, source })?;

        info!(listen_addr = %local_addr, "Replica server is accepting calls.");

        Ok(Self {
            local_addr,
            state,
            handle,
        })
    }

    #[inline]
    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Adds a new service to the live replica server.
    ///
    /// A service already hosted under the same deployment name is replaced.
    pub fn add_service<Svc>(&self, service: Svc)
    where
        Svc: DeploymentService,
    {
        self.add_channel(LocalChannel::new(service));
    }

    /// Hosts an existing local channel, sharing its service instance.
    pub fn add_channel(&self, channel: LocalChannel) {
        let name = channel.deployment_name();
        self.state.services.write().insert(name, channel);
        debug!(deployment = name, "Added service to replica server.");
    }

    /// Removes the service hosting the given deployment.
    pub fn remove_service(&self, deployment: &str) {
        self.state.services.write().remove(deployment);
    }

    /// Signals the server to shutdown.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

#[derive(Clone, Default)]
struct ReplicaServerState {
    services: Arc<RwLock<BTreeMap<&'static str, LocalChannel>>>,
}

impl ReplicaServerState {
    fn get_service(&self, deployment: &str) -> Option<LocalChannel> {
        self.services.read().get(deployment).cloned()
    }
}

#[async_trait]
impl RequestHandler for ReplicaServerState {
    async fn handle(
        &self,
        req: Request<Body>,
        _remote_addr: SocketAddr,
    ) -> anyhow::Result<Response<Body>> {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path();

        if path == HEALTH_PATH {
            return Ok(json_response(StatusCode::OK, &json!({ "status": "ok" })));
        }

        let (deployment, method) = match split_call_path(path) {
            Some(target) => target,
            None => {
                let failure = ReplicaFailure::with_status(
                    404,
                    format!("Expected a path of the form /{{deployment}}/{{method}}, got {path:?}"),
                );
                return Ok(failure_response(&failure));
            },
        };

        if parts.method != Method::POST {
            let failure = ReplicaFailure::with_status(405, "Calls must use POST");
            return Ok(failure_response(&failure));
        }

        let channel = match self.get_service(deployment) {
            Some(channel) => channel,
            None => {
                let failure = ReplicaFailure::with_status(
                    404,
                    format!("Unknown deployment: {deployment}"),
                );
                return Ok(failure_response(&failure));
            },
        };

        let body = hyper::body::to_bytes(body).await?;
        let args = if body.is_empty() {
            CallArgs::default()
        } else {
            match serde_json::from_slice::<CallArgs>(&body) {
                Ok(args) => args,
                Err(e) => {
                    let failure = ReplicaFailure::invalid_args(format!("Invalid call body: {e}"));
                    return Ok(failure_response(&failure));
                },
            }
        };

        trace!(
            deployment = deployment,
            method = method,
            call_id = ?parts.headers.get(CALL_ID_HEADER),
            "Handling remote call."
        );

        match channel.call_method(method, args).await {
            Ok(value) => Ok(json_response(StatusCode::OK, &value)),
            Err(failure) => Ok(failure_response(&failure)),
        }
    }
}

fn failure_response(failure: &ReplicaFailure) -> Response<Body> {
    let status = failure_status(failure).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match serde_json::to_value(failure) {
        Ok(value) => json_response(status, &value),
        Err(e) => crate::status::error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

fn split_call_path(path: &str) -> Option<(&str, &str)> {
    let (deployment, method) = path.strip_prefix('/')?.split_once('/')?;
    if deployment.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((deployment, method))
}

#[derive(Clone)]
/// A replica channel forwarding calls to a [ReplicaServer].
///
/// The underlying connection is established lazily and shared by every
/// clone of the channel.
pub struct HttpReplicaChannel {
    remote_addr: SocketAddr,
    deployment: String,
    client: Client<HttpConnector>,
}

impl HttpReplicaChannel {
    /// Creates a channel calling `deployment` on the replica server at `remote_addr`.
    pub fn connect(remote_addr: SocketAddr, deployment: impl Into<String>) -> Self {
        let client = Client::builder().http2_only(true).build_http();

        Self {
            remote_addr,
            deployment: deployment.into(),
            client,
        }
    }

    #[inline]
    /// The address of the remote replica server.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn uri(&self, path: &str) -> Result<Uri, ReplicaFailure> {
        format!("http://{}{}", self.remote_addr, path)
            .parse::<Uri>()
            .map_err(|e| ReplicaFailure::internal(format!("Invalid replica URI: {e}")))
    }

    fn transport_failure(&self, e: impl std::fmt::Display) -> ReplicaFailure {
        ReplicaFailure::with_status(
            502,
            format!("Failed to reach replica at {}: {}", self.remote_addr, e),
        )
    }
}

#[async_trait]
impl ReplicaChannel for HttpReplicaChannel {
    async fn invoke(&self, request: ReplicaRequest) -> Result<Value, ReplicaFailure> {
        let uri = self.uri(&format!("/{}/{}", self.deployment, request.method))?;
        let body = serde_json::to_vec(&request.args)
            .map_err(|e| ReplicaFailure::invalid_args(format!("Failed to encode args: {e}")))?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON))
            .header(CALL_ID_HEADER, request.call_id)
            .body(Body::from(body))
            .map_err(|e| ReplicaFailure::internal(format!("Failed to build request: {e}")))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| self.transport_failure(e))?;

        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| self.transport_failure(e))?;

        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|e| {
                ReplicaFailure::with_status(502, format!("Invalid replica response: {e}"))
            });
        }

        Err(serde_json::from_slice::<ReplicaFailure>(&body).unwrap_or_else(|_| {
            ReplicaFailure::with_status(status.as_u16(), String::from_utf8_lossy(&body))
        }))
    }

    async fn check_health(&self) -> Result<(), ReplicaFailure> {
        let uri = self.uri(HEALTH_PATH)?;
        let response = self
            .client
            .get(uri)
            .await
            .map_err(|e| self.transport_failure(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ReplicaFailure::with_status(
                503,
                format!("Replica reported status {}", response.status()),
            ))
        }
    }
}

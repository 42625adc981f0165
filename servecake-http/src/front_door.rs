use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::Body;
use servecake_router::{
    AsyncHandle,
    Call,
    CallArgs,
    DeploymentRegistry,
    Dispatcher,
    RouteMatch,
    Target,
};
use tokio::task::JoinHandle;

use crate::adapter::{JsonAdapter, RequestAdapter};
use crate::net::{start_server, RequestHandler};
use crate::status::{dispatch_error_status, error_response, json_response};
use crate::{CALL_ID_HEADER, TIMEOUT_HEADER};

#[derive(Debug, thiserror::Error)]
pub enum FrontDoorError {
    #[error("Failed to bind front door to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },
}

/// Configures and starts a [FrontDoor].
pub struct FrontDoorBuilder {
    dispatcher: Dispatcher,
    adapter: Arc<dyn RequestAdapter>,
}

impl FrontDoorBuilder {
    /// Sets the adapter converting request bodies into call arguments.
    ///
    /// Defaults to [JsonAdapter].
    pub fn with_adapter(mut self, adapter: impl RequestAdapter) -> Self {
        self.adapter = Arc::new(adapter);
        self
    }

    /// Binds the front door to the given address and starts serving requests.
    pub async fn listen(self, addr: SocketAddr) -> Result<FrontDoor, FrontDoorError> {
        let state = FrontDoorState {
            registry: self.dispatcher.registry().clone(),
            handle: self.dispatcher.async_handle(),
            adapter: self.adapter,
        };

        let (local_addr, handle) = start_server(addr, state, false)
            .map_err(|source| FrontDoorError::Bind { addr, source })?;

        info!(listen_addr = %local_addr, "Front door is accepting requests.");

        Ok(FrontDoor { local_addr, handle })
    }
}

/// Exposes the registered deployments over HTTP.
///
/// Each request is routed to the deployment owning the longest prefix of
/// the request path and dispatched through an [AsyncHandle], so the
/// server never blocks on replicas.
///
/// If the first segment of the path after the prefix names one of the
/// deployment's declared methods, that method is called. Otherwise the
/// deployment's default method is called.
pub struct FrontDoor {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FrontDoor {
    /// Creates a new front door builder using the given dispatcher.
    pub fn builder(dispatcher: Dispatcher) -> FrontDoorBuilder {
        FrontDoorBuilder {
            dispatcher,
            adapter: Arc::new(JsonAdapter),
        }
    }

    /// Starts a front door with the default [JsonAdapter].
    pub async fn listen(
        addr: SocketAddr,
        dispatcher: Dispatcher,
    ) -> Result<Self, FrontDoorError> {
        Self::builder(dispatcher).listen(addr).await
    }

    #[inline]
    /// The address the front door is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals the front door to shutdown.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

struct FrontDoorState {
    registry: DeploymentRegistry,
    handle: AsyncHandle,
    adapter: Arc<dyn RequestAdapter>,
}

#[async_trait]
impl RequestHandler for FrontDoorState {
    async fn handle(
        &self,
        req: Request<Body>,
        remote_addr: SocketAddr,
    ) -> anyhow::Result<Response<Body>> {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();

        let route = match self.registry.resolve_by_prefix(&path) {
            Ok(route) => route,
            Err(e) => {
                debug!(path = %path, remote_addr = %remote_addr, "No deployment owns the request path.");
                return Ok(error_response(StatusCode::NOT_FOUND, e));
            },
        };

        let deadline = match parse_deadline(&parts) {
            Ok(deadline) => deadline,
            Err(msg) => return Ok(error_response(StatusCode::BAD_REQUEST, msg)),
        };

        let body = hyper::body::to_bytes(body).await?;
        let args = match self.adapter.adapt(&parts, body).await {
            Ok(args) => args,
            Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, e)),
        };

        let call = build_call(&route, args, deadline);
        let pending = self.handle.submit(call);
        let call_id = pending.call_id();

        let mut response = match pending.await {
            Ok(value) => json_response(StatusCode::OK, &value),
            Err(e) => {
                let status = dispatch_error_status(&e);
                debug!(
                    call_id = %call_id,
                    path = %path,
                    status = %status,
                    error = %e,
                    "Call failed."
                );
                error_response(status, e)
            },
        };

        if let Ok(value) = HeaderValue::from_str(&call_id.to_string()) {
            response.headers_mut().insert(CALL_ID_HEADER, value);
        }

        Ok(response)
    }
}

/// Works out which method the request targets from the path remainder.
fn method_from_remainder<'a>(route: &RouteMatch, remainder: &'a str) -> Option<&'a str> {
    let segment = remainder.trim_start_matches('/').split('/').next()?;

    if !segment.is_empty() && route.deployment.has_method(segment) {
        Some(segment)
    } else {
        None
    }
}

fn build_call(route: &RouteMatch, args: CallArgs, deadline: Option<Duration>) -> Call {
    let method = method_from_remainder(route, &route.remainder)
        .map(|method| Cow::Owned(method.to_string()));

    let call = Call::new(
        Target::Deployment(route.deployment.name().to_string()),
        method,
        args,
    );

    match deadline {
        Some(deadline) => call.with_deadline(deadline),
        None => call,
    }
}

fn parse_deadline(parts: &http::request::Parts) -> Result<Option<Duration>, String> {
    let value = match parts.headers.get(TIMEOUT_HEADER) {
        None => return Ok(None),
        Some(value) => value,
    };

    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|millis| Some(Duration::from_millis(millis)))
        .ok_or_else(|| {
            format!("Header {TIMEOUT_HEADER:?} must be a whole number of milliseconds")
        })
}

#[cfg(test)]
mod tests {
    use servecake_router::DeploymentConfig;

    use super::*;

    fn route(remainder: &str) -> RouteMatch {
        let registry = DeploymentRegistry::default();
        registry
            .register(
                DeploymentConfig::new("echo")
                    .with_route_prefix("/echo")
                    .with_methods(["call", "shout"]),
            )
            .expect("Register deployment.");

        let mut route = registry
            .resolve_by_prefix("/echo")
            .expect("Resolve route.");
        route.remainder = remainder.to_string();
        route
    }

    #[test]
    fn test_method_from_remainder() {
        let r = route("");
        assert_eq!(method_from_remainder(&r, ""), None);
        assert_eq!(method_from_remainder(&r, "/"), None);
        assert_eq!(method_from_remainder(&r, "/shout"), Some("shout"));
        assert_eq!(method_from_remainder(&r, "/shout/loudly"), Some("shout"));
        assert_eq!(method_from_remainder(&r, "/whisper"), None);
    }

    #[test]
    fn test_build_call() {
        let call = build_call(&route("/shout"), CallArgs::default(), None);
        assert_eq!(call.target(), &Target::Deployment("echo".to_string()));
        assert_eq!(call.method(), Some("shout"));
        assert_eq!(call.deadline(), None);

        let call = build_call(
            &route("/users/1"),
            CallArgs::default(),
            Some(Duration::from_millis(250)),
        );
        assert_eq!(call.method(), None);
        assert_eq!(call.deadline(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_parse_deadline() {
        let (parts, _) = Request::builder()
            .header(TIMEOUT_HEADER, "1500")
            .body(())
            .expect("Build request.")
            .into_parts();
        assert_eq!(parse_deadline(&parts), Ok(Some(Duration::from_millis(1500))));

        let (parts, _) = Request::new(()).into_parts();
        assert_eq!(parse_deadline(&parts), Ok(None));

        let (parts, _) = Request::builder()
            .header(TIMEOUT_HEADER, "soon")
            .body(())
            .expect("Build request.")
            .into_parts();
        assert!(parse_deadline(&parts).is_err());
    }
}

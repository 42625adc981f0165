use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use hyper::Body;
use tokio::task::JoinHandle;

use crate::status::error_response;

#[async_trait]
/// Produces the response for a single inbound request.
pub(crate) trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        req: Request<Body>,
        remote_addr: SocketAddr,
    ) -> anyhow::Result<Response<Body>>;
}

/// Binds the socket and spawns the HTTP server task.
///
/// Returns the address the server is actually bound to, which differs from
/// `bind_addr` when binding to port `0`.
pub(crate) fn start_server<H>(
    bind_addr: SocketAddr,
    handler: H,
    http2_only: bool,
) -> Result<(SocketAddr, JoinHandle<()>), hyper::Error>
where
    H: RequestHandler,
{
    let incoming = AddrIncoming::bind(&bind_addr)?;
    let local_addr = incoming.local_addr();
    let handler = Arc::new(handler);

    let make_service = make_service_fn(move |socket: &AddrStream| {
        let remote_addr = socket.remote_addr();
        let handler = handler.clone();

        async move {
            let service = move |req| handle_connection(req, handler.clone(), remote_addr);
            Ok::<_, Infallible>(service_fn(service))
        }
    });

    let handle = tokio::spawn(async move {
        let server = hyper::Server::builder(incoming)
            .tcp_nodelay(true)
            .http2_only(http2_only)
            .serve(make_service);

        if let Err(e) = server.await {
            error!(error = ?e, "Server failed to handle requests.");
        }
    });

    Ok((local_addr, handle))
}

async fn handle_connection<H>(
    req: Request<Body>,
    handler: Arc<H>,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, Infallible>
where
    H: RequestHandler,
{
    match handler.handle(req, remote_addr).await {
        Ok(r) => Ok(r),
        Err(e) => {
            warn!(error = ?e, remote_addr = %remote_addr, "Failed to handle request.");
            Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, e))
        },
    }
}

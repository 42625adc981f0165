use std::fmt::Display;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, Response, StatusCode};
use hyper::Body;
use serde_json::{json, Value};
use servecake_router::{DispatchError, ReplicaFailure};

pub(crate) static APPLICATION_JSON: &str = "application/json";

/// Maps a dispatch error onto the HTTP status returned to the client.
///
/// Replica failures carrying their own client or server error status keep
/// that status, any other replica failure becomes `502 Bad Gateway`.
pub fn dispatch_error_status(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::NoReplicaAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Replica { failure, .. } => {
            failure_status(failure).unwrap_or(StatusCode::BAD_GATEWAY)
        },
        DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::Cancelled | DispatchError::BlockingInRuntime => {
            StatusCode::INTERNAL_SERVER_ERROR
        },
    }
}

/// The status embedded in a replica failure, if it is a usable error status.
pub(crate) fn failure_status(failure: &ReplicaFailure) -> Option<StatusCode> {
    failure
        .status
        .and_then(|status| StatusCode::from_u16(status).ok())
        .filter(|status| status.is_client_error() || status.is_server_error())
}

pub(crate) fn json_response(status: StatusCode, value: &Value) -> Response<Body> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = ?e, "Failed to serialize response body.");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
        },
    };

    let mut response = Response::new(Body::from(body));
    (*response.status_mut()) = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    response
}

/// Produces a `{"error": "..."}` body with the given status.
pub(crate) fn error_response(status: StatusCode, msg: impl Display) -> Response<Body> {
    let body = json!({ "error": msg.to_string() }).to_string();

    let mut response = Response::new(Body::from(body));
    (*response.status_mut()) = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use servecake_router::NotFound;

    use super::*;

    fn replica_error(failure: ReplicaFailure) -> DispatchError {
        DispatchError::Replica {
            deployment: "echo".to_string(),
            replica: "echo-1".to_string(),
            failure,
        }
    }

    #[test]
    fn test_dispatch_error_status() {
        let err = DispatchError::NotFound(NotFound::Route("/x".to_string()));
        assert_eq!(dispatch_error_status(&err), StatusCode::NOT_FOUND);

        let err = DispatchError::NoReplicaAvailable {
            deployment: "echo".to_string(),
            attempts: 3,
        };
        assert_eq!(dispatch_error_status(&err), StatusCode::SERVICE_UNAVAILABLE);

        let err = DispatchError::Timeout {
            deadline: Duration::from_secs(1),
        };
        assert_eq!(dispatch_error_status(&err), StatusCode::GATEWAY_TIMEOUT);

        assert_eq!(
            dispatch_error_status(&DispatchError::Cancelled),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
    }

    #[test]
    fn test_replica_failure_status() {
        let err = replica_error(ReplicaFailure::new("Oops"));
        assert_eq!(dispatch_error_status(&err), StatusCode::BAD_GATEWAY);

        let err = replica_error(ReplicaFailure::with_status(409, "Conflict"));
        assert_eq!(dispatch_error_status(&err), StatusCode::CONFLICT);

        // Success and out of range statuses are not passed through.
        let err = replica_error(ReplicaFailure::with_status(200, "Fine?"));
        assert_eq!(dispatch_error_status(&err), StatusCode::BAD_GATEWAY);

        let err = replica_error(ReplicaFailure::with_status(1200, "Nope"));
        assert_eq!(dispatch_error_status(&err), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = error_response(StatusCode::NOT_FOUND, "No deployment");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static(APPLICATION_JSON))
        );

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .expect("Read body.");
        let body: Value = serde_json::from_slice(&body).expect("Parse body.");
        assert_eq!(body, json!({ "error": "No deployment" }));
    }
}

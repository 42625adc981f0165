//! # Servecake HTTP
//! The HTTP surface of servecake.
//!
//! - [FrontDoor] exposes registered deployments under their route prefixes.
//! - [ReplicaServer] hosts deployment services for replicas running in other
//!   processes, which the router reaches through a [HttpReplicaChannel].

#[macro_use]
extern crate tracing;

mod adapter;
mod front_door;
mod net;
mod remote;
mod status;

pub use adapter::{AdapterError, JsonAdapter, RequestAdapter};
pub use front_door::{FrontDoor, FrontDoorBuilder, FrontDoorError};
pub use remote::{HttpReplicaChannel, ReplicaServer, ReplicaServerBindError};
pub use status::dispatch_error_status;

/// The request header setting the deadline of a call in milliseconds.
pub const TIMEOUT_HEADER: &str = "x-servecake-timeout-ms";
/// The response header carrying the correlation ID of the call.
pub const CALL_ID_HEADER: &str = "x-servecake-call-id";

//! # Servecake
//! Route calls to independently scaled deployments and spread them across
//! their replicas.
//!
//! This is a convenience package which includes all of the sub-projects within
//! Servecake, realistically you probably only want some of these projects:
//!
//! ### Features
//! - `servecake_router` - The deployment registry, load balancing policies, dispatcher and call handles.
//! - `servecake_http` - The HTTP front door and the transport for replicas running in other processes.

#[cfg(feature = "servecake-http")]
pub use servecake_http as http;
#[cfg(feature = "servecake-router")]
pub use servecake_router as router;

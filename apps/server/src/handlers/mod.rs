//! Handler modules
//!
//! - `connect`: tunnel registration over WebSocket and the per-session frame loop
//! - `response`: frames arriving from agents
//! - `disconnect`: session teardown
//! - `forwarding`: public requests routed into tunnels
//! - `admin`: status, dashboard stats and tunnel-user administration
//! - `cleanup`: periodic purge of expired dashboard entries

pub mod admin;
pub mod cleanup;
pub mod connect;
pub mod disconnect;
pub mod forwarding;
pub mod response;

pub use admin::admin_router;
pub use cleanup::{handle_cleanup, run_cleanup};
pub use connect::handle_connect;
pub use disconnect::handle_disconnect;
pub use forwarding::forward_request;
pub use response::handle_response;

//! Processing worker: dials the gateway, turns uploaded documents into
//! passage sets and streams retrieval-grounded answers back per identity.

pub mod config;
pub mod dispatch;
pub mod extract;
pub mod link;
pub mod pipeline;
pub mod providers;
pub mod store;

pub use dispatch::WorkerService;

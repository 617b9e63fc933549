//! Backend client for shoutmap.
//!
//! This crate is the boundary to the managed backend: row-level CRUD,
//! server functions, object storage and the realtime change feed.
//!
//! ## Features
//!
//! - **REST client**: table CRUD, RPC and storage upload over HTTP
//! - **Realtime socket**: one shared websocket multiplexing every channel
//! - **Memory backend**: in-process backend with a change feed, for tests and simulation

mod backend;
mod client;
mod config;
mod error;
pub mod memory;
mod query;
pub mod realtime;
mod tables;
mod types;

pub use backend::{Backend, RealtimeTransport};
pub use client::RestClient;
pub use config::BackendConfig;
pub use error::BackendError;
pub use memory::{MemoryBackend, MemorySocket, RpcHandler};
pub use query::{Filter, Order, Query};
pub use realtime::RealtimeSocket;
pub use tables::*;
pub use types::*;

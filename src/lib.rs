//! Wire-facing connection and call machinery for a distributed storage
//! server's RPC layer.
//!
//! `basalt-rpc` accepts persistent TCP connections, performs the binary
//! handshake and authentication-method negotiation, frames and decodes
//! request messages, hands decoded calls to a pluggable scheduler, and
//! asynchronously writes responses back over the same connection. Business
//! logic, SASL mechanisms, and access control live behind the
//! [`dispatch::RpcScheduler`] and [`auth::NegotiatorProvider`] traits.

pub mod auth;
pub mod call;
pub mod config;
mod connection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod preamble;
pub mod server;
pub mod wire;

pub use auth::{NegotiationStep, Negotiator, NegotiatorProvider};
pub use call::{CallResponder, ServerCall};
pub use config::ServerConfig;
pub use dispatch::{DispatchRejection, RpcScheduler, SchedulerError};
pub use error::{CallError, FatalConnectionError};
pub use frame::{FrameDecoder, FrameError};
pub use preamble::Preamble;
pub use server::RpcServer;
pub use wire::{AuthMethod, ConnectionHeader, RequestHeader, ResponseHeader};

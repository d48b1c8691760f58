// SPDX-License-Identifier: MIT
//! JSON-RPC 2.0 message model and duplex connection (spec §4.2).

pub mod connection;
pub mod message;

pub use connection::{Connection, InboundHandler};
pub use message::{JsonRpcMessage, RequestId, RpcError};

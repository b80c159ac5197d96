//! Backend adapter layer for Relaybot.
//!
//! Normalizes three structurally different streaming wire protocols
//! (blocking SDK chunk iteration, SSE over HTTP, WebSocket RPC) into one
//! internal event stream.

mod adapter;
mod chunk;
mod error;
mod rpc;
mod sse;
mod types;

pub use adapter::{BackendAdapter, EventStream};
pub use chunk::{ChunkAdapter, ChunkSource, VendorChunk, VendorUsage};
pub use error::{BackendError, Result, is_auth_message, is_retryable_message};
pub use rpc::{RpcConfig, RpcStreamAdapter, cumulative_delta};
pub use sse::{SseAdapter, SseConfig};
pub use types::{BackendRequest, ChatMessage, Role, StreamEvent, UsageStats};

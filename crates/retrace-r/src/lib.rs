//! WebSocket push channel for retrace session topics.

pub mod protocol;
pub mod server;

pub use server::{PushHandle, PushServer};

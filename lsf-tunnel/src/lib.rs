//! Framed-transport tunnelling
//!
//! A [`TunnelClient`] holds an upgraded WebSocket connection to a backend and
//! turns its binary frames into a byte stream through a [`Pipe`]. The
//! [`TunnelBridge`] pumps that byte stream into a raw client socket behind a
//! synthesized HTTP response head.

pub mod bridge;
pub mod client;
mod connect;
pub mod error;
pub mod pipe;

pub use bridge::{StartError, TunnelBridge};
pub use client::TunnelClient;
pub use error::{Error, Result};
pub use pipe::{Pipe, PipeError};

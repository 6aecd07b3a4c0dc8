//! Message bus between the repeater and the control plane.

mod grpc;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::messages::BusMessage;

pub use grpc::{BusConfig, GrpcBus, ReconnectPolicy};

/// Called once when the bus gives up restoring a lost connection.
pub type ReconnectionFailureCallback = Box<dyn FnOnce(Error) + Send + Sync>;

/// A typed payload ready to go on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: String,
    pub payload: Value,
}

impl Message {
    pub fn new<M: BusMessage>(message: &M) -> Result<Self> {
        Ok(Self {
            message_type: M::TYPE.to_string(),
            payload: serde_json::to_value(message)?,
        })
    }
}

/// Decode a command payload into its message type.
pub fn decode<M: DeserializeOwned>(payload: Value) -> Result<M> {
    Ok(serde_json::from_value(payload)?)
}

/// Handles one inbound command type. The returned value is sent back as
/// the reply; an error is sent back as a failed reply.
#[async_trait]
pub trait Handler: Send + Sync {
    fn message_type(&self) -> &'static str;

    async fn handle(&self, payload: Value) -> Result<Value>;
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Open the connection. Must precede every other call.
    async fn init(&self) -> Result<()>;

    /// Fire-and-forget event.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Request/reply command; resolves with the reply payload.
    async fn send(&self, message: Message) -> Result<Value>;

    async fn subscribe(&self, handler: Arc<dyn Handler>) -> Result<()>;

    fn on_reconnection_failure(&self, callback: ReconnectionFailureCallback);

    /// Close the connection. Safe to call more than once.
    async fn destroy(&self) -> Result<()>;
}

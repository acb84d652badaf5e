//! Message serialization contract.
//!
//! The transport never interprets application payloads; every typed channel is
//! given a [`Serializer`] that turns messages into frame payloads and back.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors raised by a [`Serializer`].
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    /// JSON encoding or decoding failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure reported by an application-provided [`Serializer`]; the
    /// built-in serializers never produce it.
    #[error("{0}")]
    Custom(String),
}

/// Converts messages of type `M` to and from frame payloads.
pub trait Serializer<M>: Send + Sync + 'static {
    fn serialize(&self, message: &M) -> Result<Vec<u8>, SerializerError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<M, SerializerError>;
}

/// Shared serializer handle, as held by every connection of a channel.
pub type SerializerHandle<M> = Arc<dyn Serializer<M>>;

/// JSON via `serde_json`.
pub struct JsonSerializer<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> JsonSerializer<M> {
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> Default for JsonSerializer<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for JsonSerializer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonSerializer")
    }
}

impl<M> Serializer<M> for JsonSerializer<M>
where
    M: Serialize + DeserializeOwned + 'static,
{
    fn serialize(&self, message: &M) -> Result<Vec<u8>, SerializerError> {
        Ok(serde_json::to_vec(message)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<M, SerializerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Identity serializer for raw byte messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl Serializer<Bytes> for BytesSerializer {
    fn serialize(&self, message: &Bytes) -> Result<Vec<u8>, SerializerError> {
        Ok(message.to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Bytes, SerializerError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::codec::{Codec, JsonCodec};
use crate::error::{BusError, Result};
use crate::schema::{MethodDescriptor, SchemaRegistry};

/// JSON wire form shared by every envelope
pub trait Envelope: Serialize + DeserializeOwned {
    /// Serialize envelope to bytes for transmission
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize envelope from bytes
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// RPC request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// `<namespace>.<service>.<method>`
    pub method: String,
    /// Caller identity
    #[serde(default)]
    pub actor: Option<String>,
    /// Request encoded with the method's request type
    pub payload: Vec<u8>,
}

impl RequestEnvelope {
    /// Method name without its service prefix
    pub fn short_method(&self) -> &str {
        self.method
            .rsplit_once('.')
            .map(|(_, method)| method)
            .unwrap_or(&self.method)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub method: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub method: String,
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// RPC reply, carrying exactly one of a result or an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseEnvelope {
    Result(ResultEnvelope),
    Error(ErrorEnvelope),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Envelope for RequestEnvelope {}
impl Envelope for ResponseEnvelope {}
impl Envelope for EventEnvelope {}

/// A decoded inbound request
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub method: String,
    pub actor: Option<String>,
    pub data: Value,
}

/// A decoded inbound event
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEvent {
    pub event_type: String,
    pub topic: String,
    pub data: Value,
}

/// A decoded reply
#[derive(Debug, Clone, PartialEq)]
pub enum MethodResponse {
    Success { method: String, data: Value },
    Failure(ErrorEnvelope),
}

impl MethodResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Extract success data, turning an error envelope into [`BusError::Remote`]
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Success { data, .. } => Ok(data),
            Self::Failure(error) => Err(BusError::Remote {
                method: error.method,
                message: error.message,
                code: error.code,
            }),
        }
    }
}

fn invalid_request(e: impl ToString) -> BusError {
    BusError::InvalidRequest { reason: e.to_string() }
}

fn invalid_response(e: impl ToString) -> BusError {
    BusError::InvalidResponse { reason: e.to_string() }
}

/// Builds and opens envelopes, encoding payloads by the types the schema declares
#[derive(Clone)]
pub struct MessageFactory {
    codec: Arc<dyn Codec>,
    schema: Arc<SchemaRegistry>,
}

impl MessageFactory {
    pub fn new(codec: Arc<dyn Codec>, schema: Arc<SchemaRegistry>) -> Self {
        Self { codec, schema }
    }

    /// Factory with a permissive JSON codec and an empty registry
    pub fn json() -> Self {
        Self::new(Arc::new(JsonCodec::new()), Arc::new(SchemaRegistry::new()))
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    fn method(&self, method: &str) -> Result<MethodDescriptor> {
        self.schema
            .lookup_method(method)
            .map(|(_, descriptor)| descriptor)
            .ok_or_else(|| BusError::InvalidMethod {
                method: method.to_string(),
            })
    }

    pub fn build_request(&self, method: &str, request: &Value, actor: Option<&str>) -> Result<Vec<u8>> {
        let descriptor = self.method(method)?;
        let payload = self
            .codec
            .encode(&descriptor.request_type, request)
            .map_err(invalid_request)?;

        RequestEnvelope {
            method: method.to_string(),
            actor: actor.map(str::to_string),
            payload,
        }
        .to_bytes()
        .map_err(invalid_request)
    }

    /// Parse the outer request envelope without touching its payload
    pub fn read_request(&self, bytes: &[u8]) -> Result<RequestEnvelope> {
        RequestEnvelope::from_bytes(bytes).map_err(invalid_request)
    }

    /// Decode the payload of a parsed request with the method's request type
    pub fn request_data(&self, envelope: &RequestEnvelope) -> Result<Value> {
        let descriptor = self.method(&envelope.method)?;
        self.codec
            .decode(&descriptor.request_type, &envelope.payload)
            .map_err(invalid_request)
    }

    pub fn decode_request(&self, bytes: &[u8]) -> Result<IncomingRequest> {
        let envelope = self.read_request(bytes)?;
        let data = self.request_data(&envelope)?;
        Ok(IncomingRequest {
            method: envelope.method,
            actor: envelope.actor,
            data,
        })
    }

    /// Encode the outcome of `method`. Errors become an [`ErrorEnvelope`] carrying
    /// the error's message and code.
    pub fn build_response(&self, method: &str, outcome: std::result::Result<&Value, &BusError>) -> Result<Vec<u8>> {
        let envelope = match outcome {
            Ok(value) => {
                let descriptor = self.method(method)?;
                let payload = self
                    .codec
                    .encode(&descriptor.response_type, value)
                    .map_err(invalid_response)?;
                ResponseEnvelope::Result(ResultEnvelope {
                    method: method.to_string(),
                    payload,
                })
            }
            Err(error) => ResponseEnvelope::Error(ErrorEnvelope {
                method: method.to_string(),
                message: error.to_string(),
                code: Some(error.code().to_string()),
            }),
        };
        envelope.to_bytes().map_err(invalid_response)
    }

    pub fn decode_response(&self, bytes: &[u8]) -> Result<MethodResponse> {
        match ResponseEnvelope::from_bytes(bytes).map_err(invalid_response)? {
            ResponseEnvelope::Result(result) => {
                let descriptor = self.method(&result.method).map_err(invalid_response)?;
                let data = self
                    .codec
                    .decode(&descriptor.response_type, &result.payload)
                    .map_err(invalid_response)?;
                Ok(MethodResponse::Success {
                    method: result.method,
                    data,
                })
            }
            ResponseEnvelope::Error(error) => Ok(MethodResponse::Failure(error)),
        }
    }

    pub fn build_event(&self, event_type: &str, content: &Value, topic: &str) -> Result<Vec<u8>> {
        let payload = self
            .codec
            .encode(event_type, content)
            .map_err(BusError::invalid_message)?;

        EventEnvelope {
            event_type: event_type.to_string(),
            topic: topic.to_string(),
            payload,
        }
        .to_bytes()
        .map_err(BusError::invalid_message)
    }

    pub fn decode_event(&self, bytes: &[u8]) -> Result<IncomingEvent> {
        let envelope = EventEnvelope::from_bytes(bytes).map_err(BusError::invalid_message)?;
        let data = self
            .codec
            .decode(&envelope.event_type, &envelope.payload)
            .map_err(BusError::invalid_message)?;
        Ok(IncomingEvent {
            event_type: envelope.event_type,
            topic: envelope.topic,
            data,
        })
    }
}

impl std::fmt::Debug for MessageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFactory")
            .field("services", &self.schema.service_names())
            .finish()
    }
}

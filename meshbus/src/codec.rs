use serde_json::Value;
use std::collections::HashSet;

use crate::error::{BusError, Result};

/// Payload encoding keyed by type name
pub trait Codec: Send + Sync {
    fn encode(&self, type_name: &str, value: &Value) -> Result<Vec<u8>>;

    fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<Value>;
}

/// JSON payload codec.
///
/// In strict mode only registered type names are accepted.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    known_types: Option<HashSet<String>>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict<I, S>(type_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_types: Some(type_names.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_strict(&self) -> bool {
        self.known_types.is_some()
    }

    fn check_type(&self, type_name: &str) -> Result<()> {
        if type_name.is_empty() {
            return Err(BusError::invalid_message("missing type name"));
        }
        match &self.known_types {
            Some(known) if !known.contains(type_name) => Err(BusError::UnknownType(type_name.to_string())),
            _ => Ok(()),
        }
    }
}

impl Codec for JsonCodec {
    fn encode(&self, type_name: &str, value: &Value) -> Result<Vec<u8>> {
        self.check_type(type_name)?;
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<Value> {
        self.check_type(type_name)?;
        Ok(serde_json::from_slice(bytes)?)
    }
}

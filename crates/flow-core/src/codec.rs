//! Codec de objetos a bytes.
//!
//! El orquestador solo necesita codificar/decodificar valores JSON; los
//! helpers tipados viven sobre `dyn Codec` para mantener el trait
//! object-safe.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::errors::CodecError;

pub trait Codec: Send + Sync + 'static {
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn decode_value(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

impl dyn Codec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let v = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.encode_value(&v)
    }

    /// Falla con `CodecError::Decode` si los bytes no son válidos o no
    /// corresponden a `T`.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let v = self.decode_value(bytes)?;
        serde_json::from_value(v).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Codec JSON (serde_json).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionId;
    use crate::protocol::SessionMessage;

    #[test]
    fn malformed_bytes_fail_with_decode_error() {
        let codec: &dyn Codec = &JsonCodec;
        let err = codec.decode::<SessionMessage>(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn wrong_shape_fails_with_decode_error() {
        let codec: &dyn Codec = &JsonCodec;
        let bytes = codec.encode(&serde_json::json!({"type": "SessionData"})).unwrap();
        assert!(matches!(codec.decode::<SessionMessage>(&bytes), Err(CodecError::Decode(_))));
        let ok = codec.encode(&SessionMessage::NormalSessionEnd { recipient_session_id: SessionId::new() }).unwrap();
        assert!(codec.decode::<SessionMessage>(&ok).is_ok());
    }
}

//! Payload envelope codec.
//!
//! Pure encode/decode consumed by the broker workers. Typed values travel
//! as JSON, binary serialization, or base64-wrapped binary; byte-oriented
//! payloads travel raw or sealed in a protobuf envelope that carries the
//! message id. Failures are logged before they are returned so a dropped
//! message is never silent.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use prost::Message;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Wire encodings supported by producers and consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    /// Binary serialization wrapped in base64 text.
    #[default]
    Base64Bin,
    /// Binary serialization.
    Bin,
    /// Protobuf envelope around an opaque payload.
    Proto,
    /// Raw bytes, untouched.
    Raw,
    /// JSON.
    Json,
}

/// Errors from payload marshalling.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("encoding {0:?} carries opaque bytes, not typed values")]
    Unsupported(Encoding),
}

/// Protobuf envelope for [`Encoding::Proto`] payloads.
///
/// Pairs the message id with the already-marshalled payload bytes so the
/// receiving side can correlate replies without decoding the payload.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// AMQP content-type property for an encoding.
pub fn content_type(encoding: Encoding) -> &'static str {
    match encoding {
        Encoding::Json => "application/json",
        Encoding::Proto => "application/protobuf",
        Encoding::Base64Bin | Encoding::Bin | Encoding::Raw => "application/octet-stream",
    }
}

/// Encode a typed value for the wire.
pub fn encode<T: Serialize>(encoding: Encoding, value: &T) -> Result<Vec<u8>, CodecError> {
    let result = match encoding {
        Encoding::Json => serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string())),
        Encoding::Bin => bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string())),
        Encoding::Base64Bin => bincode::serialize(value)
            .map(|raw| BASE64.encode(raw).into_bytes())
            .map_err(|e| CodecError::Encode(e.to_string())),
        Encoding::Proto | Encoding::Raw => Err(CodecError::Unsupported(encoding)),
    };
    if let Err(err) = &result {
        error!(encoding = ?encoding, error = %err, "payload encode failed");
    }
    result
}

/// Decode a typed value from the wire.
pub fn decode<T: DeserializeOwned>(encoding: Encoding, bytes: &[u8]) -> Result<T, CodecError> {
    let result = match encoding {
        Encoding::Json => {
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
        }
        Encoding::Bin => {
            bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
        }
        Encoding::Base64Bin => BASE64
            .decode(bytes)
            .map_err(|e| CodecError::Decode(e.to_string()))
            .and_then(|raw| {
                bincode::deserialize(&raw).map_err(|e| CodecError::Decode(e.to_string()))
            }),
        Encoding::Proto | Encoding::Raw => Err(CodecError::Unsupported(encoding)),
    };
    if let Err(err) = &result {
        error!(encoding = ?encoding, error = %err, "payload decode failed");
    }
    result
}

/// Seal payload bytes in a protobuf [`Envelope`].
pub fn seal(id: &str, payload: Vec<u8>) -> Vec<u8> {
    Envelope {
        id: id.to_string(),
        payload,
    }
    .encode_to_vec()
}

/// Open a protobuf [`Envelope`].
pub fn unseal(bytes: &[u8]) -> Result<Envelope, CodecError> {
    Envelope::decode(bytes).map_err(|e| {
        let err = CodecError::Decode(e.to_string());
        error!(error = %err, "envelope decode failed");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Sample {
        id: String,
        count: u32,
    }

    fn sample() -> Sample {
        Sample {
            id: "abc-123".to_string(),
            count: 7,
        }
    }

    #[test]
    fn test_json_round_trip() {
        let bytes = encode(Encoding::Json, &sample()).unwrap();
        let back: Sample = decode(Encoding::Json, &bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_binary_round_trip() {
        let bytes = encode(Encoding::Bin, &sample()).unwrap();
        let back: Sample = decode(Encoding::Bin, &bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_base64_wraps_binary() {
        let bytes = encode(Encoding::Base64Bin, &sample()).unwrap();
        // Wire form is valid base64 text over the binary serialization.
        let inner = BASE64.decode(&bytes).unwrap();
        assert_eq!(bincode::deserialize::<Sample>(&inner).unwrap(), sample());
        let back: Sample = decode(Encoding::Base64Bin, &bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_typed_codec_rejects_byte_encodings() {
        assert!(matches!(
            encode(Encoding::Raw, &sample()),
            Err(CodecError::Unsupported(Encoding::Raw))
        ));
        assert!(matches!(
            decode::<Sample>(Encoding::Proto, b"ignored"),
            Err(CodecError::Unsupported(Encoding::Proto))
        ));
    }

    #[test]
    fn test_envelope_round_trip() {
        let sealed = seal("msg-9", vec![1, 2, 3]);
        let envelope = unseal(&sealed).unwrap();
        assert_eq!(envelope.id, "msg-9");
        assert_eq!(envelope.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_surfaces_malformed_input() {
        assert!(decode::<Sample>(Encoding::Json, b"{not json").is_err());
        assert!(decode::<Sample>(Encoding::Base64Bin, b"***").is_err());
    }
}

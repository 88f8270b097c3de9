use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Trait for encoding and decoding request and response payloads
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Encode a serializable value into bytes
    fn encode<T: Serialize + ?Sized>(&self, data: &T) -> Result<Vec<u8>>;

    /// Decode bytes into a deserializable value
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

/// Default codec (JSON text payloads)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, data: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(data)?)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Bincode codec - compact binary, Rust peers only
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode<T: Serialize + ?Sized>(&self, data: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(data)?)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Request {
        name: String,
        values: Vec<i32>,
    }

    #[test]
    fn test_json_codec_is_text() {
        let req = Request {
            name: "json".to_string(),
            values: vec![1, 2],
        };
        let bytes = JsonCodec.encode(&req).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"name\":\"json\""));

        let decoded: Request = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_decode_error_is_serialization() {
        let result: Result<Request> = JsonCodec.decode(b"not json");
        assert!(matches!(
            result,
            Err(crate::error::RpcError::Serialization(_))
        ));

        let result: Result<String> = BincodeCodec.decode(&[0xff]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unit_encodes_to_null() {
        let bytes = JsonCodec.encode(&()).unwrap();
        assert_eq!(bytes, b"null");
        JsonCodec.decode::<()>(&bytes).unwrap();
    }
}

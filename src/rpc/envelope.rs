//! Request and response envelopes.
//!
//! ```text
//! request:  request_id u32 | kind_len u32 | kind | payload_len u32 | payload
//! response: request_id u32 | payload_len u32 | payload
//! ```
//!
//! All integers are big-endian. A response payload starts with a status
//! byte: [`STATUS_OK`] followed by the encoded value, or [`STATUS_FAILURE`]
//! followed by a UTF-8 error message.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, RpcError};

pub const STATUS_OK: u8 = 0;
pub const STATUS_FAILURE: u8 = 1;

/// Upper bound for a single kind or payload field
pub const MAX_FIELD_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub request_id: u32,
    pub kind: String,
    pub payload: Bytes,
}

impl RequestEnvelope {
    pub fn new(request_id: u32, kind: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let kind = self.kind.as_bytes();
        let mut buf = BytesMut::with_capacity(12 + kind.len() + self.payload.len());
        buf.put_u32(self.request_id);
        buf.put_u32(kind.len() as u32);
        buf.put_slice(kind);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub async fn read_from<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let request_id = reader.read_u32().await?;
        let kind = read_field(reader).await?;
        let kind = String::from_utf8(kind.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid kind: {}", e)))?;
        let payload = read_field(reader).await?;
        Ok(Self {
            request_id,
            kind,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub request_id: u32,
    pub payload: Bytes,
}

impl ResponseEnvelope {
    /// Successful response carrying an encoded value.
    pub fn success(request_id: u32, body: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + body.len());
        payload.put_u8(STATUS_OK);
        payload.put_slice(body);
        Self {
            request_id,
            payload: payload.freeze(),
        }
    }

    /// Failed response carrying an error message.
    pub fn failure(request_id: u32, message: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + message.len());
        payload.put_u8(STATUS_FAILURE);
        payload.put_slice(message.as_bytes());
        Self {
            request_id,
            payload: payload.freeze(),
        }
    }

    /// Split off the status byte: the encoded value, or the remote failure.
    pub fn into_result(mut self) -> Result<Bytes> {
        if self.payload.is_empty() {
            return Err(RpcError::InvalidMessage(format!(
                "response {} has no status byte",
                self.request_id
            )));
        }
        let body = self.payload.split_off(1);
        match self.payload[0] {
            STATUS_OK => Ok(body),
            STATUS_FAILURE => Err(RpcError::Remote(String::from_utf8_lossy(&body).into_owned())),
            status => Err(RpcError::InvalidMessage(format!(
                "response {} has unknown status {}",
                self.request_id, status
            ))),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.payload.len());
        buf.put_u32(self.request_id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub async fn read_from<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let request_id = reader.read_u32().await?;
        let payload = read_field(reader).await?;
        Ok(Self {
            request_id,
            payload,
        })
    }
}

async fn read_field<R>(reader: &mut R) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FIELD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("field of {} bytes exceeds {}", len, MAX_FIELD_SIZE),
        ));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Bytes::from(data))
}

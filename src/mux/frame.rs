//! Multiplexor frame layout.
//!
//! ```text
//! channel_id: u32 (big-endian)
//! length:     u32 (big-endian, <= max packet size)
//! payload:    [u8; length]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{TransportError, TransportResult};

pub const FRAME_HEADER_SIZE: usize = 8;
pub const MAX_PACKET_SIZE: usize = 1024;

/// Encode one frame, header followed by payload.
pub fn encode_frame(channel_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(channel_id);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary. A
/// stream that ends in the middle of a frame yields an `UnexpectedEof` I/O
/// error.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> TransportResult<Option<(u32, Bytes)>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let channel_id = match reader.read_u32().await {
        Ok(id) => id,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let length = reader.read_u32().await? as usize;
    if length > max_payload {
        return Err(TransportError::FrameTooLarge {
            size: length,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Some((channel_id, Bytes::from(payload))))
}

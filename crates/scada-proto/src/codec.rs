//! ---
//! scada_section: "02-control-channel-data-model"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Shared data model and control-channel framing."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frames::Frame;

/// Upper bound on a single frame. A full snapshot with an hour of breaker
/// history stays well under this.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Errors produced by the control-channel codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying transport failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Payload was not valid JSON for any known frame kind.
    #[error("frame decode error: {0}")]
    Json(#[from] serde_json::Error),
    /// Declared length exceeded [`MAX_FRAME_BYTES`].
    #[error("frame of {0} bytes exceeds limit")]
    Oversize(usize),
}

/// Write one frame as a big-endian u32 length prefix followed by JSON.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(CodecError::Oversize(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `Io` with `UnexpectedEof` when the
/// peer closed the channel cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::Oversize(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{Command, CommandFrame};

    #[tokio::test]
    async fn frames_roundtrip_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let outbound = Frame::Command(CommandFrame::new(Command::Ping));
        write_frame(&mut client, &outbound).await.unwrap();
        write_frame(&mut client, &Frame::heartbeat()).await.unwrap();

        let first = read_frame(&mut server).await.unwrap();
        assert_eq!(first, outbound);
        let second = read_frame(&mut server).await.unwrap();
        assert_eq!(second.kind(), "heartbeat");
    }

    #[tokio::test]
    async fn oversize_length_is_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32((MAX_FRAME_BYTES + 1) as u32).await.unwrap();
        match read_frame(&mut server).await {
            Err(CodecError::Oversize(len)) => assert_eq!(len, MAX_FRAME_BYTES + 1),
            other => panic!("expected oversize error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_stream_surfaces_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(10).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(CodecError::Io(_))
        ));
    }
}

//! Wire protocol framing
//!
//! Reads and writes length-prefixed messages on an async stream.

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{Message, MessageId};

/// Decodes messages from the read half of a peer connection
pub struct MessageReader<R> {
    reader: R,
    piece_count: u32,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Create a reader for a torrent with `piece_count` pieces
    pub fn new(reader: R, piece_count: u32) -> Self {
        Self { reader, piece_count }
    }

    /// Read one complete message.
    ///
    /// The length prefix is checked against the message layout before the
    /// payload is read. Payloads of unknown ids are skipped without being
    /// buffered, so the stream stays aligned on the next prefix.
    pub async fn read_message(&mut self) -> Result<Message> {
        let length = self.reader.read_u32().await?;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        let raw_id = self.reader.read_u8().await?;
        let payload_len = u64::from(length - 1);
        let id = match MessageId::try_from(raw_id) {
            Ok(id) => id,
            Err(_) => {
                trace!("Discarding {} bytes of unknown message {}", payload_len, raw_id);
                let skipped = tokio::io::copy(
                    &mut (&mut self.reader).take(payload_len),
                    &mut tokio::io::sink(),
                )
                .await?;
                if skipped != payload_len {
                    return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
                }
                return Ok(Message::Unknown { id: raw_id, length });
            }
        };

        id.check_len(length, self.piece_count)?;

        let mut payload = vec![0u8; payload_len as usize];
        self.reader.read_exact(&mut payload).await?;
        Ok(Message::from_payload(id, Bytes::from(payload)))
    }
}

/// Write a message to the stream
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&message.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

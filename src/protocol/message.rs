//! BitTorrent protocol messages
//!
//! Defines all message types exchanged after the handshake.

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::TorrentError;
use crate::protocol::{num_bytes, MAX_BLOCK_LEN};

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = TorrentError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => Err(TorrentError::protocol_error_with_source(
                "Unknown message ID",
                format!("value: {}", value),
            )),
        }
    }
}

impl MessageId {
    /// Check a length prefix (id byte included) against this message's
    /// fixed layout.
    ///
    /// This runs before any payload byte is read, so a hostile prefix never
    /// makes us buffer more than the layout allows.
    pub fn check_len(self, len: u32, piece_count: u32) -> Result<()> {
        let ok = match self {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => len == 1,
            MessageId::Have => len == 5,
            MessageId::Bitfield => len as usize == 1 + num_bytes(piece_count),
            MessageId::Request | MessageId::Cancel => len == 13,
            MessageId::Piece => (9..=9 + MAX_BLOCK_LEN).contains(&len),
            MessageId::Port => len == 3,
        };
        if ok {
            Ok(())
        } else {
            Err(TorrentError::protocol_error_with_source(
                "Invalid message length",
                format!("id: {:?}, length: {}", self, len),
            )
            .into())
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    /// A message with an id we do not know; its payload was skipped
    Unknown { id: u8, length: u32 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive and unknown messages)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::KeepAlive | Message::Unknown { .. } => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke => 1,
            Message::Unchoke => 1,
            Message::Interested => 1,
            Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Cancel { .. } => 13,
            Message::Port { .. } => 3,
            Message::Unknown { length, .. } => *length,
        }
    }

    /// Append the framed message (length prefix included) to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(4 + self.length() as usize);
        buf.put_u32(self.length());

        match self {
            Message::KeepAlive => {
                // No message ID for KeepAlive
            }
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::Have { piece_index } => {
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bitfield);
            }
            Message::Request { index, begin, length } => {
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port { listen_port } => {
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*listen_port);
            }
            Message::Unknown { id, length } => {
                // only used by tests to feed a peer something we cannot parse
                buf.put_u8(*id);
                buf.put_bytes(0, length.saturating_sub(1) as usize);
            }
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Bytes {
        trace!("Serializing message: {:?}", self.message_id());
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Build a message from a payload whose length already passed
    /// [`MessageId::check_len`].
    pub fn from_payload(id: MessageId, mut payload: Bytes) -> Self {
        match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: payload.get_u32(),
            },
            MessageId::Bitfield => Message::Bitfield { bitfield: payload },
            MessageId::Request => Message::Request {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                length: payload.get_u32(),
            },
            MessageId::Piece => {
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: payload,
                }
            }
            MessageId::Cancel => Message::Cancel {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                length: payload.get_u32(),
            },
            MessageId::Port => Message::Port {
                listen_port: payload.get_u16(),
            },
        }
    }
}

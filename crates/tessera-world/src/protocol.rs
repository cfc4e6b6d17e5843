//! Wire protocol for chunk streaming.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use tessera_core::ChunkPos;

use crate::error::StreamError;

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest message body accepted by [`read_message`].
pub const MAX_MESSAGE_BYTES: usize = 32 * 1024 * 1024;

/// Message from the server to a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMessage {
    /// The viewer's reference chunk changed.
    SetCenter { x: i32, z: i32 },
    /// Contents of a chunk that entered view.
    ChunkData { x: i32, z: i32, data: Vec<u8> },
    /// A chunk left view, or could not be loaded.
    UnloadChunk { x: i32, z: i32 },
}

impl StreamMessage {
    /// Get the message kind.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::SetCenter { .. } => FrameKind::SetCenter,
            Self::ChunkData { .. } => FrameKind::ChunkData,
            Self::UnloadChunk { .. } => FrameKind::UnloadChunk,
        }
    }

    /// Chunk the message refers to.
    pub fn pos(&self) -> ChunkPos {
        match *self {
            Self::SetCenter { x, z } | Self::ChunkData { x, z, .. } | Self::UnloadChunk { x, z } => {
                ChunkPos::new(x, z)
            }
        }
    }
}

/// Encode a message to bytes with length prefix.
pub fn encode(msg: &StreamMessage) -> Result<Vec<u8>, bincode::Error> {
    let data = bincode::serialize(msg)?;
    let len = data.len() as u32;
    let mut result = Vec::with_capacity(4 + data.len());
    result.extend_from_slice(&len.to_le_bytes());
    result.extend(data);
    Ok(result)
}

/// Decode a message from bytes (without length prefix).
pub fn decode(data: &[u8]) -> Result<StreamMessage, bincode::Error> {
    bincode::deserialize(data)
}

/// Read one length-prefixed message from a stream.
pub fn read_message<R: Read>(reader: &mut R) -> Result<StreamMessage, StreamError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(StreamError::FrameTooLarge {
            len,
            limit: MAX_MESSAGE_BYTES,
        });
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(decode(&data)?)
}

/// Kind of message carried by a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    SetCenter,
    ChunkData,
    UnloadChunk,
}

/// An encoded message, shared between recipients without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    /// Chunk the message refers to.
    pub pos: ChunkPos,
    /// Length-prefixed encoding, ready to write to a socket.
    pub bytes: Arc<[u8]>,
}

impl Frame {
    /// Encode a message into a frame.
    pub fn encode(msg: &StreamMessage) -> Result<Self, StreamError> {
        Ok(Self {
            kind: msg.kind(),
            pos: msg.pos(),
            bytes: encode(msg)?.into(),
        })
    }

    pub fn set_center(pos: ChunkPos) -> Result<Self, StreamError> {
        Self::encode(&StreamMessage::SetCenter { x: pos.x, z: pos.z })
    }

    pub fn unload(pos: ChunkPos) -> Result<Self, StreamError> {
        Self::encode(&StreamMessage::UnloadChunk { x: pos.x, z: pos.z })
    }

    /// Decode the message back out of the frame.
    pub fn message(&self) -> Result<StreamMessage, StreamError> {
        Ok(decode(&self.bytes[4..])?)
    }
}

/// Outgoing side of a viewer's connection.
pub trait ViewerConnection: Send {
    /// Deliver one frame. An error marks the viewer as disconnected.
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()>;
}

impl ViewerConnection for TcpStream {
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.write_all(&frame.bytes)
    }
}

/// Hands frames to a separate network I/O pool.
impl ViewerConnection for Sender<Frame> {
    fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.send(frame.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "viewer channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn roundtrip_chunk_data() {
        let msg = StreamMessage::ChunkData {
            x: -3,
            z: 9,
            data: vec![1, 2, 3],
        };
        let encoded = encode(&msg).unwrap();
        assert_eq!(
            u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize,
            encoded.len() - 4
        );

        // Skip length prefix (4 bytes)
        let decoded = decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.pos(), ChunkPos::new(-3, 9));
    }

    #[test]
    fn frame_remembers_kind_and_position() {
        let frame = Frame::unload(ChunkPos::new(4, -4)).unwrap();
        assert_eq!(frame.kind, FrameKind::UnloadChunk);
        assert_eq!(frame.pos, ChunkPos::new(4, -4));
        assert_eq!(
            frame.message().unwrap(),
            StreamMessage::UnloadChunk { x: 4, z: -4 }
        );
    }

    #[test]
    fn read_message_rejects_oversized_length() {
        let mut bytes: &[u8] = &u32::MAX.to_le_bytes();
        assert!(matches!(
            read_message(&mut bytes),
            Err(StreamError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn channel_connection_forwards_frames() {
        let (mut tx, rx) = crossbeam::channel::unbounded::<Frame>();
        let frame = Frame::set_center(ChunkPos::new(1, 2)).unwrap();
        tx.send_frame(&frame).unwrap();
        assert!(Arc::ptr_eq(&rx.try_recv().unwrap().bytes, &frame.bytes));

        drop(rx);
        assert!(tx.send_frame(&frame).is_err());
    }

    #[test]
    fn tcp_connection_writes_length_prefixed_frames() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();

        let frame = Frame::set_center(ChunkPos::new(-7, 70)).unwrap();
        server_side.send_frame(&frame).unwrap();
        assert_eq!(
            read_message(&mut client).unwrap(),
            StreamMessage::SetCenter { x: -7, z: 70 }
        );
    }
}

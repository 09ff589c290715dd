//! src/tunnel/frame.rs
//!
//! The logical-stream multiplexing frame format carried inside WebSocket
//! binary messages. Each tunnel session may carry many concurrent logical
//! streams (listener registration, HTTP proxying, TCP proxying); frames
//! are distinguished by a stream ID so a single WebSocket connection can
//! multiplex all of them.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    ListenRegister = 0,
    HttpProxy = 1,
    TcpProxy = 2,
}

impl StreamType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::ListenRegister),
            1 => Some(Self::HttpProxy),
            2 => Some(Self::TcpProxy),
            _ => None,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamType::ListenRegister => "listen-register",
            StreamType::HttpProxy => "http-proxy",
            StreamType::TcpProxy => "tcp-proxy",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Open { stream_id: u32, stream_type: StreamType },
    Data { stream_id: u32, payload: Vec<u8> },
    Close { stream_id: u32 },
    Heartbeat,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short")]
    Truncated,
    #[error("unknown frame opcode {0}")]
    UnknownOpcode(u8),
    #[error("unknown stream type byte {0}")]
    UnknownStreamType(u8),
}

const OP_OPEN: u8 = 0;
const OP_DATA: u8 = 1;
const OP_CLOSE: u8 = 2;
const OP_HEARTBEAT: u8 = 3;

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Open { stream_id, stream_type } => {
                let mut out = Vec::with_capacity(6);
                out.push(OP_OPEN);
                out.extend_from_slice(&stream_id.to_be_bytes());
                out.push(*stream_type as u8);
                out
            }
            Frame::Data { stream_id, payload } => {
                let mut out = Vec::with_capacity(5 + payload.len());
                out.push(OP_DATA);
                out.extend_from_slice(&stream_id.to_be_bytes());
                out.extend_from_slice(payload);
                out
            }
            Frame::Close { stream_id } => {
                let mut out = Vec::with_capacity(5);
                out.push(OP_CLOSE);
                out.extend_from_slice(&stream_id.to_be_bytes());
                out
            }
            Frame::Heartbeat => vec![OP_HEARTBEAT],
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&opcode, rest) = bytes.split_first().ok_or(FrameError::Truncated)?;
        match opcode {
            OP_HEARTBEAT => Ok(Frame::Heartbeat),
            OP_OPEN => {
                if rest.len() < 5 {
                    return Err(FrameError::Truncated);
                }
                let stream_id = u32::from_be_bytes(rest[0..4].try_into().unwrap());
                let stream_type = StreamType::from_byte(rest[4]).ok_or(FrameError::UnknownStreamType(rest[4]))?;
                Ok(Frame::Open { stream_id, stream_type })
            }
            OP_DATA => {
                if rest.len() < 4 {
                    return Err(FrameError::Truncated);
                }
                let stream_id = u32::from_be_bytes(rest[0..4].try_into().unwrap());
                Ok(Frame::Data { stream_id, payload: rest[4..].to_vec() })
            }
            OP_CLOSE => {
                if rest.len() < 4 {
                    return Err(FrameError::Truncated);
                }
                let stream_id = u32::from_be_bytes(rest[0..4].try_into().unwrap());
                Ok(Frame::Close { stream_id })
            }
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

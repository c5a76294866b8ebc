//! Wire protocol: length-prefixed JSON frames over a `UnixStream`.
//!
//! Each frame is a 4-byte little-endian length prefix followed by that many
//! bytes of `serde_json`-encoded [`Frame`]. This gives request/response
//! calls, server-initiated progress streaming, and connection-scoped
//! notifications on the same socket without pulling in a full RPC
//! framework — the server-initiated message channel spec §9 calls for in
//! place of the original RPC framework's automatic proxy semantics.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    Response {
        id: u64,
        payload: Value,
    },
    Progress {
        id: u64,
        current: usize,
        total: usize,
        path: String,
        info: String,
    },
    Notification {
        event: String,
        payload: Value,
    },
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let bytes = serde_json::to_vec(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum size",
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trips_through_framing() {
        let frame = Frame::Request {
            id: 1,
            method: "query".to_string(),
            params: serde_json::json!({"project": "/tmp/p", "query": "database"}),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).unwrap();
        match decoded {
            Frame::Request { id, method, .. } => {
                assert_eq!(id, 1);
                assert_eq!(method, "query");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn progress_frame_round_trips() {
        let frame = Frame::Progress {
            id: 7,
            current: 3,
            total: 10,
            path: "src/main.rs".to_string(),
            info: "chunking".to_string(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).unwrap();
        assert!(matches!(decoded, Frame::Progress { total: 10, .. }));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_le_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }
}

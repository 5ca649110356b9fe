//! Frame codec for the emulated fabric.
//!
//! Every message on an established connection is one length-prefixed frame:
//! a fixed header of `{kind: u8, seq: u64, body_len: u32}` in little-endian,
//! followed by `body_len` bytes of body. `seq` matches requests to their
//! acknowledgements; frames without a pending counterpart carry zero.
//!
//! A frame is written with a single vectored-style buffer and never
//! fragmented at this layer, so small control payloads (the 12-byte remote
//! memory descriptor in particular) always arrive as one unit.

use std::io::{self, Read, Write};

/// Fixed frame header length: kind + seq + body length.
const HEADER_LEN: usize = 1 + 8 + 4;

/// Upper bound on a frame body. Anything larger is treated as stream
/// corruption.
const MAX_BODY_LEN: u32 = 16 << 20;

/// Remote-side outcome of a serviced operation, as carried in ack frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WireStatus {
    Ok = 0,
    /// No receive was outstanding for an inbound send.
    ReceiverNotReady = 1,
    /// The outstanding receive was too small for the inbound send.
    LengthMismatch = 2,
    /// Key, range, or permission validation failed on the remote side.
    AccessDenied = 3,
}

impl WireStatus {
    pub(crate) fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0 => Ok(Self::Ok),
            1 => Ok(Self::ReceiverNotReady),
            2 => Ok(Self::LengthMismatch),
            3 => Ok(Self::AccessDenied),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid wire status {v}"),
            )),
        }
    }
}

/// One message of the emulated fabric protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    /// Connection request from the initiator.
    ConnectReq,
    /// The responder accepted the connection.
    ConnectAccept,
    /// The responder rejected the connection.
    ConnectReject,
    /// Two-sided send payload.
    Send { seq: u64, payload: Vec<u8> },
    /// Acknowledgement for a `Send`, produced by the peer engine once the
    /// payload has been matched (or failed to match) a posted receive.
    SendAck { seq: u64, status: WireStatus },
    /// One-sided read request.
    ReadReq {
        seq: u64,
        addr: u64,
        rkey: u32,
        len: u32,
    },
    /// Response to a `ReadReq`; carries data only on success.
    ReadResp {
        seq: u64,
        status: WireStatus,
        data: Vec<u8>,
    },
    /// One-sided write request.
    WriteReq {
        seq: u64,
        addr: u64,
        rkey: u32,
        payload: Vec<u8>,
    },
    /// Acknowledgement for a `WriteReq`.
    WriteAck { seq: u64, status: WireStatus },
    /// Orderly teardown notice.
    Disconnect,
}

mod kind {
    pub const CONNECT_REQ: u8 = 1;
    pub const CONNECT_ACCEPT: u8 = 2;
    pub const CONNECT_REJECT: u8 = 3;
    pub const SEND: u8 = 4;
    pub const SEND_ACK: u8 = 5;
    pub const READ_REQ: u8 = 6;
    pub const READ_RESP: u8 = 7;
    pub const WRITE_REQ: u8 = 8;
    pub const WRITE_ACK: u8 = 9;
    pub const DISCONNECT: u8 = 10;
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::ConnectReq => kind::CONNECT_REQ,
            Frame::ConnectAccept => kind::CONNECT_ACCEPT,
            Frame::ConnectReject => kind::CONNECT_REJECT,
            Frame::Send { .. } => kind::SEND,
            Frame::SendAck { .. } => kind::SEND_ACK,
            Frame::ReadReq { .. } => kind::READ_REQ,
            Frame::ReadResp { .. } => kind::READ_RESP,
            Frame::WriteReq { .. } => kind::WRITE_REQ,
            Frame::WriteAck { .. } => kind::WRITE_ACK,
            Frame::Disconnect => kind::DISCONNECT,
        }
    }

    fn seq(&self) -> u64 {
        match self {
            Frame::Send { seq, .. }
            | Frame::SendAck { seq, .. }
            | Frame::ReadReq { seq, .. }
            | Frame::ReadResp { seq, .. }
            | Frame::WriteReq { seq, .. }
            | Frame::WriteAck { seq, .. } => *seq,
            _ => 0,
        }
    }

    fn body(&self) -> Vec<u8> {
        match self {
            Frame::ConnectReq
            | Frame::ConnectAccept
            | Frame::ConnectReject
            | Frame::Disconnect => Vec::new(),
            Frame::Send { payload, .. } => payload.clone(),
            Frame::SendAck { status, .. } | Frame::WriteAck { status, .. } => vec![*status as u8],
            Frame::ReadReq {
                addr, rkey, len, ..
            } => {
                let mut body = Vec::with_capacity(16);
                body.extend_from_slice(&addr.to_le_bytes());
                body.extend_from_slice(&rkey.to_le_bytes());
                body.extend_from_slice(&len.to_le_bytes());
                body
            }
            Frame::ReadResp { status, data, .. } => {
                let mut body = Vec::with_capacity(1 + data.len());
                body.push(*status as u8);
                body.extend_from_slice(data);
                body
            }
            Frame::WriteReq {
                addr,
                rkey,
                payload,
                ..
            } => {
                let mut body = Vec::with_capacity(12 + payload.len());
                body.extend_from_slice(&addr.to_le_bytes());
                body.extend_from_slice(&rkey.to_le_bytes());
                body.extend_from_slice(payload);
                body
            }
        }
    }
}

fn bad_frame(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn split_u64(body: &[u8]) -> io::Result<(u64, &[u8])> {
    let (head, rest) = body
        .split_first_chunk::<8>()
        .ok_or_else(|| bad_frame("frame body truncated"))?;
    Ok((u64::from_le_bytes(*head), rest))
}

fn split_u32(body: &[u8]) -> io::Result<(u32, &[u8])> {
    let (head, rest) = body
        .split_first_chunk::<4>()
        .ok_or_else(|| bad_frame("frame body truncated"))?;
    Ok((u32::from_le_bytes(*head), rest))
}

/// Serialize one frame into the writer as a single contiguous write.
pub(crate) fn write_frame(w: &mut impl Write, frame: &Frame) -> io::Result<()> {
    let body = frame.body();
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.push(frame.kind());
    buf.extend_from_slice(&frame.seq().to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    w.write_all(&buf)?;
    w.flush()
}

/// Read exactly one frame from the reader.
pub(crate) fn read_frame(r: &mut impl Read) -> io::Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header)?;
    let kind = header[0];
    let seq = u64::from_le_bytes(header[1..9].try_into().unwrap());
    let body_len = u32::from_le_bytes(header[9..13].try_into().unwrap());
    if body_len > MAX_BODY_LEN {
        return Err(bad_frame(format!("frame body too large: {body_len}")));
    }

    let mut body = vec![0u8; body_len as usize];
    r.read_exact(&mut body)?;

    let frame = match kind {
        kind::CONNECT_REQ => Frame::ConnectReq,
        kind::CONNECT_ACCEPT => Frame::ConnectAccept,
        kind::CONNECT_REJECT => Frame::ConnectReject,
        kind::DISCONNECT => Frame::Disconnect,
        kind::SEND => Frame::Send { seq, payload: body },
        kind::SEND_ACK => {
            let status = *body.first().ok_or_else(|| bad_frame("empty ack body"))?;
            Frame::SendAck {
                seq,
                status: WireStatus::from_u8(status)?,
            }
        }
        kind::WRITE_ACK => {
            let status = *body.first().ok_or_else(|| bad_frame("empty ack body"))?;
            Frame::WriteAck {
                seq,
                status: WireStatus::from_u8(status)?,
            }
        }
        kind::READ_REQ => {
            let (addr, rest) = split_u64(&body)?;
            let (rkey, rest) = split_u32(rest)?;
            let (len, _) = split_u32(rest)?;
            Frame::ReadReq {
                seq,
                addr,
                rkey,
                len,
            }
        }
        kind::READ_RESP => {
            let (&status, data) = body
                .split_first()
                .ok_or_else(|| bad_frame("empty read response"))?;
            Frame::ReadResp {
                seq,
                status: WireStatus::from_u8(status)?,
                data: data.to_vec(),
            }
        }
        kind::WRITE_REQ => {
            let (addr, rest) = split_u64(&body)?;
            let (rkey, payload) = split_u32(rest)?;
            Frame::WriteReq {
                seq,
                addr,
                rkey,
                payload: payload.to_vec(),
            }
        }
        other => return Err(bad_frame(format!("unknown frame kind {other}"))),
    };
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        read_frame(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn control_frames() {
        for f in [
            Frame::ConnectReq,
            Frame::ConnectAccept,
            Frame::ConnectReject,
            Frame::Disconnect,
        ] {
            assert_eq!(roundtrip(f.clone()), f);
        }
    }

    #[test]
    fn data_frames() {
        let send = Frame::Send {
            seq: 7,
            payload: b"hello".to_vec(),
        };
        assert_eq!(roundtrip(send.clone()), send);

        let read = Frame::ReadReq {
            seq: 8,
            addr: 0xdead_beef_0000,
            rkey: 42,
            len: 100,
        };
        assert_eq!(roundtrip(read.clone()), read);

        let write = Frame::WriteReq {
            seq: 9,
            addr: 0x1000,
            rkey: 43,
            payload: vec![0xa5; 50],
        };
        assert_eq!(roundtrip(write.clone()), write);

        let resp = Frame::ReadResp {
            seq: 8,
            status: WireStatus::Ok,
            data: vec![1, 2, 3],
        };
        assert_eq!(roundtrip(resp.clone()), resp);

        let nack = Frame::SendAck {
            seq: 7,
            status: WireStatus::ReceiverNotReady,
        };
        assert_eq!(roundtrip(nack.clone()), nack);
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::Disconnect).unwrap();
        buf.truncate(HEADER_LEN - 2);
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &Frame::Send {
                seq: 1,
                payload: vec![0; 32],
            },
        )
        .unwrap();
        buf.truncate(buf.len() - 5);
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut buf = vec![kind::SEND];
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&(MAX_BODY_LEN + 1).to_le_bytes());
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn invalid_status_is_rejected() {
        let mut buf = vec![kind::SEND_ACK];
        buf.extend_from_slice(&3u64.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(200);
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }
}

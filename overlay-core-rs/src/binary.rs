//! Binary framing for OCPP binary transfers
//!
//! ## Frame Format
//!
//! ```text
//! +-------------+----------+----------+----------------+
//! | Version (1B)| Type (1B)| Mode (1B)| Request id     |
//! +-------------+----------+----------+----------------+
//! | [overlay] Destination | Path count (2B) | Path ids   |
//! +-----------------------+-----------------+------------+
//! | [request] Action | Payload length (4B BE) | Payload  |
//! +------------------+------------------------+----------+
//! ```
//!
//! Strings are a 2-byte big-endian length followed by UTF-8 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::FrameError;
use crate::messages::{BinaryRequest, BinaryResponse, MessageType, OcppFrame};
use crate::types::{NetworkPath, NetworkingMode, NodeId, RequestId};

/// Current binary frame version
pub const BINARY_FRAME_VERSION: u8 = 1;

const MODE_STANDARD: u8 = 0;
const MODE_OVERLAY: u8 = 1;

/// Encode a binary CALL for a link in `mode`
pub fn encode_request(request: &BinaryRequest, mode: NetworkingMode) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(64 + request.payload.len());
    put_header(
        &mut dst,
        MessageType::Call,
        mode,
        &request.request_id,
        &request.destination,
        &request.network_path,
    )?;
    put_str(&mut dst, &request.action)?;
    put_payload(&mut dst, &request.payload)?;
    Ok(dst.freeze())
}

/// Encode a binary CALLRESULT for a link in `mode`
pub fn encode_response(response: &BinaryResponse, mode: NetworkingMode) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(64 + response.payload.len());
    put_header(
        &mut dst,
        MessageType::CallResult,
        mode,
        &response.request_id,
        &response.destination,
        &response.network_path,
    )?;
    put_payload(&mut dst, &response.payload)?;
    Ok(dst.freeze())
}

/// Decode one binary frame
pub fn decode_binary(data: &[u8]) -> Result<OcppFrame, FrameError> {
    let mut src = data;

    let version = get_u8(&mut src)?;
    if version != BINARY_FRAME_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let msg_type = get_u8(&mut src)?;
    let mode = match get_u8(&mut src)? {
        MODE_STANDARD => NetworkingMode::Standard,
        MODE_OVERLAY => NetworkingMode::OverlayNetwork,
        _ => return Err(FrameError::InvalidFormat("unknown networking mode")),
    };
    let request_id = RequestId::new(get_str(&mut src)?);

    let (destination, path) = match mode {
        NetworkingMode::Standard => (NodeId::zero(), NetworkPath::empty()),
        NetworkingMode::OverlayNetwork => {
            let destination = NodeId::new(get_str(&mut src)?);
            let count = get_u16(&mut src)?;
            let mut hops = Vec::with_capacity(count as usize);
            for _ in 0..count {
                hops.push(NodeId::new(get_str(&mut src)?));
            }
            (destination, NetworkPath::from(hops))
        }
    };

    match MessageType::from_id(msg_type as i64) {
        Some(MessageType::Call) => {
            let action = get_str(&mut src)?;
            let payload = get_payload(&mut src)?;
            let mut request = BinaryRequest::new(request_id, destination, action, payload).with_path(path);
            request.networking_mode = mode;
            Ok(OcppFrame::BinaryRequest(request))
        }
        Some(MessageType::CallResult) => {
            let payload = get_payload(&mut src)?;
            let mut response = BinaryResponse::new(request_id, destination, payload).with_path(path);
            response.networking_mode = mode;
            Ok(OcppFrame::BinaryResponse(response))
        }
        _ => Err(FrameError::UnknownMessageType(msg_type as i64)),
    }
}

fn put_header(
    dst: &mut BytesMut,
    msg_type: MessageType,
    mode: NetworkingMode,
    request_id: &RequestId,
    destination: &NodeId,
    path: &NetworkPath,
) -> Result<(), FrameError> {
    dst.put_u8(BINARY_FRAME_VERSION);
    dst.put_u8(msg_type as u8);
    match mode {
        NetworkingMode::Standard => {
            dst.put_u8(MODE_STANDARD);
            put_str(dst, request_id.as_str())?;
        }
        NetworkingMode::OverlayNetwork => {
            dst.put_u8(MODE_OVERLAY);
            put_str(dst, request_id.as_str())?;
            put_str(dst, destination.as_str())?;
            let count = u16::try_from(path.len()).map_err(|_| FrameError::FieldTooLong(path.len()))?;
            dst.put_u16(count);
            for hop in path.iter() {
                put_str(dst, hop.as_str())?;
            }
        }
    }
    Ok(())
}

fn put_str(dst: &mut BytesMut, value: &str) -> Result<(), FrameError> {
    let len = u16::try_from(value.len()).map_err(|_| FrameError::FieldTooLong(value.len()))?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_payload(dst: &mut BytesMut, payload: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::FieldTooLong(payload.len()))?;
    dst.put_u32(len);
    dst.put_slice(payload);
    Ok(())
}

fn get_u8(src: &mut &[u8]) -> Result<u8, FrameError> {
    if src.remaining() < 1 {
        return Err(FrameError::Truncated);
    }
    Ok(src.get_u8())
}

fn get_u16(src: &mut &[u8]) -> Result<u16, FrameError> {
    if src.remaining() < 2 {
        return Err(FrameError::Truncated);
    }
    Ok(src.get_u16())
}

fn get_str(src: &mut &[u8]) -> Result<String, FrameError> {
    let len = get_u16(src)? as usize;
    if src.remaining() < len {
        return Err(FrameError::Truncated);
    }
    let value = std::str::from_utf8(&src[..len])
        .map_err(|_| FrameError::InvalidFormat("string is not UTF-8"))?
        .to_string();
    src.advance(len);
    Ok(value)
}

fn get_payload(src: &mut &[u8]) -> Result<Bytes, FrameError> {
    if src.remaining() < 4 {
        return Err(FrameError::Truncated);
    }
    let len = src.get_u32() as usize;
    if src.remaining() < len {
        return Err(FrameError::Truncated);
    }
    let payload = Bytes::copy_from_slice(&src[..len]);
    src.advance(len);
    Ok(payload)
}

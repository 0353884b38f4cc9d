//! OCPP-J text framing
//!
//! Standard mode (classic OCPP-J):
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Overlay mode inserts the destination and the network path right after the
//! message type, e.g. `[2, destination, [path...], messageId, action, payload]`.
//! The two modes are told apart by array length.

use serde_json::{json, Value};
use thiserror::Error;

use crate::messages::*;
use crate::types::{NetworkPath, NetworkingMode, NodeId, RequestId};

/// Errors in frame encoding and decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid frame format: {0}")]
    InvalidFormat(&'static str),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Binary frame truncated")]
    Truncated,

    #[error("Unsupported binary frame version: {0}")]
    UnsupportedVersion(u8),

    #[error("Field too long for binary frame: {0} bytes")]
    FieldTooLong(usize),
}

/// Decode one text frame
pub fn decode_text(text: &str) -> Result<OcppFrame, FrameError> {
    let array: Vec<Value> = serde_json::from_str(text)?;

    let msg_type = array
        .first()
        .and_then(Value::as_i64)
        .ok_or(FrameError::InvalidFormat("missing message type"))?;
    let msg_type = MessageType::from_id(msg_type).ok_or(FrameError::UnknownMessageType(msg_type))?;

    match (msg_type, array.len()) {
        (MessageType::Call, 4) => Ok(OcppFrame::JsonRequest(call(&array[1..], None)?)),
        (MessageType::Call, 6) => {
            let header = overlay_header(&array)?;
            Ok(OcppFrame::JsonRequest(call(&array[3..], Some(header))?))
        }
        (MessageType::CallResult, 3) => Ok(OcppFrame::JsonResponse(call_result(&array[1..], None)?)),
        (MessageType::CallResult, 5) => {
            let header = overlay_header(&array)?;
            Ok(OcppFrame::JsonResponse(call_result(&array[3..], Some(header))?))
        }
        (MessageType::CallError, 5) => Ok(OcppFrame::JsonError(call_error(&array[1..], None)?)),
        (MessageType::CallError, 7) => {
            let header = overlay_header(&array)?;
            Ok(OcppFrame::JsonError(call_error(&array[3..], Some(header))?))
        }
        _ => Err(FrameError::InvalidFormat("unexpected array length")),
    }
}

fn overlay_header(array: &[Value]) -> Result<(NodeId, NetworkPath), FrameError> {
    let destination = array[1]
        .as_str()
        .ok_or(FrameError::InvalidFormat("destination must be a string"))?;
    let path: NetworkPath = serde_json::from_value(array[2].clone())?;
    Ok((NodeId::from(destination), path))
}

fn message_id(value: &Value) -> Result<RequestId, FrameError> {
    value
        .as_str()
        .map(RequestId::from)
        .ok_or(FrameError::InvalidFormat("message id must be a string"))
}

fn apply_header(
    header: Option<(NodeId, NetworkPath)>,
) -> (NodeId, NetworkPath, NetworkingMode) {
    match header {
        Some((destination, path)) => (destination, path, NetworkingMode::OverlayNetwork),
        None => (NodeId::zero(), NetworkPath::empty(), NetworkingMode::Standard),
    }
}

fn call(fields: &[Value], header: Option<(NodeId, NetworkPath)>) -> Result<JsonRequest, FrameError> {
    let request_id = message_id(&fields[0])?;
    let action = fields[1]
        .as_str()
        .ok_or(FrameError::InvalidFormat("action must be a string"))?;
    let (destination, path, mode) = apply_header(header);

    let mut request = JsonRequest::new(request_id, destination, action, fields[2].clone()).with_path(path);
    request.networking_mode = mode;
    Ok(request)
}

fn call_result(
    fields: &[Value],
    header: Option<(NodeId, NetworkPath)>,
) -> Result<JsonResponse, FrameError> {
    let request_id = message_id(&fields[0])?;
    let (destination, path, mode) = apply_header(header);

    let mut response = JsonResponse::new(request_id, destination, fields[1].clone()).with_path(path);
    response.networking_mode = mode;
    Ok(response)
}

fn call_error(fields: &[Value], header: Option<(NodeId, NetworkPath)>) -> Result<JsonError, FrameError> {
    let request_id = message_id(&fields[0])?;
    let error_code = fields[1]
        .as_str()
        .map(ErrorCode::parse)
        .ok_or(FrameError::InvalidFormat("error code must be a string"))?;
    let description = fields[2].as_str().unwrap_or("");
    let (destination, path, mode) = apply_header(header);

    let mut error = JsonError::new(request_id, destination, error_code, description)
        .with_path(path)
        .with_details(fields[3].clone());
    error.networking_mode = mode;
    Ok(error)
}

/// Serialize a CALL for a link in `mode`
pub fn encode_request(request: &JsonRequest, mode: NetworkingMode) -> Result<String, FrameError> {
    let array = match mode {
        NetworkingMode::Standard => json!([
            MessageType::Call as i32,
            request.request_id,
            request.action,
            request.payload
        ]),
        NetworkingMode::OverlayNetwork => json!([
            MessageType::Call as i32,
            request.destination,
            request.network_path,
            request.request_id,
            request.action,
            request.payload
        ]),
    };
    Ok(serde_json::to_string(&array)?)
}

/// Serialize a CALLRESULT for a link in `mode`
pub fn encode_response(response: &JsonResponse, mode: NetworkingMode) -> Result<String, FrameError> {
    let array = match mode {
        NetworkingMode::Standard => json!([
            MessageType::CallResult as i32,
            response.request_id,
            response.payload
        ]),
        NetworkingMode::OverlayNetwork => json!([
            MessageType::CallResult as i32,
            response.destination,
            response.network_path,
            response.request_id,
            response.payload
        ]),
    };
    Ok(serde_json::to_string(&array)?)
}

/// Serialize a CALLERROR for a link in `mode`
pub fn encode_error(error: &JsonError, mode: NetworkingMode) -> Result<String, FrameError> {
    let array = match mode {
        NetworkingMode::Standard => json!([
            MessageType::CallError as i32,
            error.request_id,
            error.error_code.to_string(),
            error.error_description,
            error.error_details
        ]),
        NetworkingMode::OverlayNetwork => json!([
            MessageType::CallError as i32,
            error.destination,
            error.network_path,
            error.request_id,
            error.error_code.to_string(),
            error.error_description,
            error.error_details
        ]),
    };
    Ok(serde_json::to_string(&array)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_call_parsing() {
        let frame = decode_text(r#"[2, "msg-123", "Heartbeat", {}]"#).unwrap();

        match frame {
            OcppFrame::JsonRequest(request) => {
                assert_eq!(request.request_id, RequestId::from("msg-123"));
                assert_eq!(request.action, "Heartbeat");
                assert_eq!(request.networking_mode, NetworkingMode::Standard);
                assert!(request.network_path.is_empty());
                assert!(request.destination.is_zero());
            }
            _ => panic!("Expected JsonRequest"),
        }
    }

    #[test]
    fn test_overlay_call_parsing() {
        let text = r#"[2, "CSMS", ["CS001", "NN1"], "100001", "Reset", {"type": "Immediate"}]"#;

        match decode_text(text).unwrap() {
            OcppFrame::JsonRequest(request) => {
                assert_eq!(request.destination, NodeId::csms());
                assert_eq!(request.network_path.len(), 2);
                assert_eq!(request.network_path.source(), Some(&NodeId::from("CS001")));
                assert_eq!(request.networking_mode, NetworkingMode::OverlayNetwork);
                assert_eq!(request.payload["type"], "Immediate");
            }
            _ => panic!("Expected JsonRequest"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let text = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;

        match decode_text(text).unwrap() {
            OcppFrame::JsonError(error) => {
                assert_eq!(error.request_id, RequestId::from("msg-123"));
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.error_description, "Action not supported");
            }
            _ => panic!("Expected JsonError"),
        }
    }

    #[test]
    fn test_overlay_response_keeps_path() {
        let path = NetworkPath::from_source(NodeId::from("CS001")).append(NodeId::from("NN1"));
        let response = JsonResponse::new(
            RequestId::from(100_001),
            NodeId::from("CS001"),
            json!({"status": "Accepted"}),
        )
        .with_path(path.clone());

        let text = encode_response(&response, NetworkingMode::OverlayNetwork).unwrap();
        assert!(text.starts_with(r#"[3,"CS001",["CS001","NN1"],"100001""#));

        match decode_text(&text).unwrap() {
            OcppFrame::JsonResponse(decoded) => {
                assert_eq!(decoded.network_path, path);
                assert_eq!(decoded.destination, NodeId::from("CS001"));
            }
            _ => panic!("Expected JsonResponse"),
        }
    }

    #[test]
    fn test_standard_encoding_drops_routing_header() {
        let request = JsonRequest::new(RequestId::from(5), NodeId::csms(), "Heartbeat", json!({}))
            .with_path(NetworkPath::from_source(NodeId::from("CS001")));

        let text = encode_request(&request, NetworkingMode::Standard).unwrap();
        assert_eq!(text, r#"[2,"5","Heartbeat",{}]"#);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(decode_text("not json"), Err(FrameError::Json(_))));
        assert!(matches!(decode_text("[]"), Err(FrameError::InvalidFormat(_))));
        assert!(matches!(
            decode_text(r#"[9, "x", {}]"#),
            Err(FrameError::UnknownMessageType(9))
        ));
        assert!(matches!(
            decode_text(r#"[2, "x", "Heartbeat"]"#),
            Err(FrameError::InvalidFormat(_))
        ));
        assert!(matches!(
            decode_text(r#"[3, 17, {}]"#),
            Err(FrameError::InvalidFormat(_))
        ));
    }
}

//! Wire protocol
//!
//! Every frame is a UTF-8 JSON array whose first element is the message
//! type discriminant:
//!
//! | Frame | Shape |
//! |---|---|
//! | Subscribe request | `[1, seq, "uri"]` |
//! | Subscribe response | `[1, seq, 0, id, data]` or `[1, seq, status, "message"]` |
//! | Unsubscribe request | `[2, seq, id]` |
//! | Unsubscribe response | `[2, seq, status]` |
//! | Change event | `[3, id, data]` |
//! | Resync | `[4]` |

use crate::error::{Result, RtaError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};

/// Status code of a successful response
pub const STATUS_SUCCESS: i64 = 0;

/// Message type discriminant (array element 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Subscribe = 1,
    Unsubscribe = 2,
    ChangeEvent = 3,
    Resync = 4,
}

impl MessageType {
    /// Numeric discriminant as sent on the wire
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a discriminant
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(MessageType::Subscribe),
            2 => Some(MessageType::Unsubscribe),
            3 => Some(MessageType::ChangeEvent),
            4 => Some(MessageType::Resync),
            _ => None,
        }
    }
}

static SEQUENCE: AtomicU32 = AtomicU32::new(1);

/// Next request sequence number.
///
/// One counter serves every registry in the process. It wraps at `u32::MAX`;
/// a wrapped number only collides with a request that is still in flight
/// four billion requests later.
pub fn next_sequence_number() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Encode a subscribe request
pub fn encode_subscribe(seq: u32, resource_uri: &str) -> String {
    json!([MessageType::Subscribe.code(), seq, resource_uri]).to_string()
}

/// Encode an unsubscribe request
pub fn encode_unsubscribe(seq: u32, subscription_id: u32) -> String {
    json!([MessageType::Unsubscribe.code(), seq, subscription_id]).to_string()
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    SubscribeResponse {
        seq: u32,
        status: i64,
        /// Present when `status == 0`
        subscription_id: Option<u32>,
        /// Initial payload; `Null` on failure
        data: Value,
        /// Provider message on failure
        message: Option<String>,
    },
    UnsubscribeResponse {
        seq: u32,
        status: i64,
    },
    ChangeEvent {
        subscription_id: u32,
        data: Value,
    },
    Resync,
}

impl InboundFrame {
    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let elements = value
            .as_array()
            .ok_or_else(|| RtaError::Protocol("frame is not a JSON array".to_string()))?;

        let code = elements
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| RtaError::Protocol("frame has no message type".to_string()))?;

        let message_type = MessageType::from_code(code)
            .ok_or_else(|| RtaError::Protocol(format!("unknown message type {}", code)))?;

        match message_type {
            MessageType::Subscribe => {
                let seq = element_u32(elements, 1, "sequence number")?;
                let status = element_i64(elements, 2, "status")?;
                if status == STATUS_SUCCESS {
                    Ok(InboundFrame::SubscribeResponse {
                        seq,
                        status,
                        subscription_id: Some(element_u32(elements, 3, "subscription id")?),
                        data: elements.get(4).cloned().unwrap_or(Value::Null),
                        message: None,
                    })
                } else {
                    Ok(InboundFrame::SubscribeResponse {
                        seq,
                        status,
                        subscription_id: None,
                        data: Value::Null,
                        message: elements.get(3).and_then(Value::as_str).map(str::to_string),
                    })
                }
            }
            MessageType::Unsubscribe => Ok(InboundFrame::UnsubscribeResponse {
                seq: element_u32(elements, 1, "sequence number")?,
                status: element_i64(elements, 2, "status")?,
            }),
            MessageType::ChangeEvent => Ok(InboundFrame::ChangeEvent {
                subscription_id: element_u32(elements, 1, "subscription id")?,
                data: elements.get(2).cloned().unwrap_or(Value::Null),
            }),
            MessageType::Resync => Ok(InboundFrame::Resync),
        }
    }

    /// Message type of this frame
    pub fn message_type(&self) -> MessageType {
        match self {
            InboundFrame::SubscribeResponse { .. } => MessageType::Subscribe,
            InboundFrame::UnsubscribeResponse { .. } => MessageType::Unsubscribe,
            InboundFrame::ChangeEvent { .. } => MessageType::ChangeEvent,
            InboundFrame::Resync => MessageType::Resync,
        }
    }
}

fn element_i64(elements: &[Value], index: usize, name: &str) -> Result<i64> {
    elements
        .get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| RtaError::Protocol(format!("missing or invalid {} at index {}", name, index)))
}

fn element_u32(elements: &[Value], index: usize, name: &str) -> Result<u32> {
    let value = element_i64(elements, index, name)?;
    u32::try_from(value)
        .map_err(|_| RtaError::Protocol(format!("{} {} out of range", name, value)))
}

//! Kernel wire protocol
//!
//! Multipart message framing and hmac-sha256 signing for the kernel
//! channels. A message on the wire is
//! `[identities..., <IDS|MSG>, signature, header, parent_header, metadata,
//! content]`; the signature covers the four JSON frames in order.

use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{Result, SandboxError};

/// Protocol version stamped on every outgoing header.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Frame separating routing identities from message payload.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

const USERNAME: &str = "kernelbox";

type HmacSha256 = Hmac<Sha256>;

/// Message header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_id: String,
    pub session: String,
    pub username: String,
    pub date: String,
    pub msg_type: String,
    pub version: String,
}

/// One channel message, decoded.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub header: MessageHeader,
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
}

impl WireMessage {
    /// Fresh request message with a new correlation id.
    pub fn request(msg_type: &str, session: &str, content: Value) -> Self {
        Self {
            header: MessageHeader {
                msg_id: Uuid::new_v4().to_string(),
                session: session.to_string(),
                username: USERNAME.to_string(),
                date: Utc::now().to_rfc3339(),
                msg_type: msg_type.to_string(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: json!({}),
            metadata: json!({}),
            content,
        }
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Correlation id of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }

    /// Encode to wire frames, signing with `key` (empty key → empty
    /// signature, per the protocol).
    pub fn encode(&self, key: &[u8]) -> Result<Vec<Bytes>> {
        let header = serde_json::to_vec(&self.header)
            .map_err(|e| SandboxError::Channel(format!("encoding header: {}", e)))?;
        let parent = serde_json::to_vec(&self.parent_header)
            .map_err(|e| SandboxError::Channel(format!("encoding parent header: {}", e)))?;
        let metadata = serde_json::to_vec(&self.metadata)
            .map_err(|e| SandboxError::Channel(format!("encoding metadata: {}", e)))?;
        let content = serde_json::to_vec(&self.content)
            .map_err(|e| SandboxError::Channel(format!("encoding content: {}", e)))?;

        let signature = sign(key, [&header, &parent, &metadata, &content])?;

        Ok(vec![
            Bytes::from_static(DELIMITER),
            Bytes::from(signature),
            Bytes::from(header),
            Bytes::from(parent),
            Bytes::from(metadata),
            Bytes::from(content),
        ])
    }

    /// Decode wire frames, skipping any routing identities before the
    /// delimiter and verifying the signature when a key is set.
    pub fn decode(frames: &[Bytes], key: &[u8]) -> Result<Self> {
        let delim = frames
            .iter()
            .position(|f| f.as_ref() == DELIMITER)
            .ok_or_else(|| SandboxError::Channel("message has no delimiter frame".into()))?;

        if frames.len() < delim + 6 {
            return Err(SandboxError::Channel(format!(
                "message has {} frames after the delimiter, expected at least 5",
                frames.len() - delim - 1
            )));
        }

        let signature = &frames[delim + 1];
        let header = &frames[delim + 2];
        let parent = &frames[delim + 3];
        let metadata = &frames[delim + 4];
        let content = &frames[delim + 5];

        if !key.is_empty() {
            let expected = sign(key, [header, parent, metadata, content])?;
            if expected.as_bytes() != signature.as_ref() {
                return Err(SandboxError::Channel("message signature mismatch".into()));
            }
        }

        Ok(Self {
            header: serde_json::from_slice(header)
                .map_err(|e| SandboxError::Channel(format!("decoding header: {}", e)))?,
            parent_header: serde_json::from_slice(parent)
                .map_err(|e| SandboxError::Channel(format!("decoding parent header: {}", e)))?,
            metadata: serde_json::from_slice(metadata)
                .map_err(|e| SandboxError::Channel(format!("decoding metadata: {}", e)))?,
            content: serde_json::from_slice(content)
                .map_err(|e| SandboxError::Channel(format!("decoding content: {}", e)))?,
        })
    }
}

/// Hex hmac-sha256 over the payload frames. Empty key produces an empty
/// signature.
fn sign<T: AsRef<[u8]>>(key: &[u8], parts: [&T; 4]) -> Result<String> {
    if key.is_empty() {
        return Ok(String::new());
    }

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SandboxError::Channel(format!("bad signing key: {}", e)))?;
    for part in parts {
        mac.update(part.as_ref());
    }
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEY: &[u8] = b"a0b1c2d3-key";

    #[test]
    fn encode_decode_round_trip() {
        let msg = WireMessage::request("execute_request", "sess-1", json!({"code": "x = 1"}));
        let frames = msg.encode(KEY).unwrap();

        let decoded = WireMessage::decode(&frames, KEY).unwrap();
        assert_eq!(decoded.header.msg_id, msg.header.msg_id);
        assert_eq!(decoded.msg_type(), "execute_request");
        assert_eq!(decoded.content["code"], "x = 1");
    }

    #[test]
    fn decode_skips_routing_identities() {
        let msg = WireMessage::request("status", "sess-1", json!({"execution_state": "idle"}));
        let mut frames = msg.encode(KEY).unwrap();
        frames.insert(0, Bytes::from_static(b"iopub-topic"));
        frames.insert(0, Bytes::from_static(b"router-identity"));

        let decoded = WireMessage::decode(&frames, KEY).unwrap();
        assert_eq!(decoded.msg_type(), "status");
    }

    #[test]
    fn tampered_content_is_rejected() {
        let msg = WireMessage::request("execute_request", "sess-1", json!({"code": "x = 1"}));
        let mut frames = msg.encode(KEY).unwrap();
        let last = frames.len() - 1;
        frames[last] = Bytes::from_static(b"{\"code\": \"import os\"}");

        let err = WireMessage::decode(&frames, KEY).unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn empty_key_means_unsigned() {
        let msg = WireMessage::request("kernel_info_request", "sess-1", json!({}));
        let frames = msg.encode(b"").unwrap();
        assert!(frames[1].is_empty());

        WireMessage::decode(&frames, b"").unwrap();
    }

    #[test]
    fn missing_delimiter_is_an_error() {
        let frames = vec![Bytes::from_static(b"junk")];
        assert!(WireMessage::decode(&frames, KEY).is_err());
    }

    #[test]
    fn parent_msg_id_reads_reply_parents() {
        let request = WireMessage::request("execute_request", "sess-1", json!({}));
        let reply = WireMessage {
            header: MessageHeader {
                msg_id: Uuid::new_v4().to_string(),
                session: "kernel".to_string(),
                username: "kernel".to_string(),
                date: Utc::now().to_rfc3339(),
                msg_type: "execute_reply".to_string(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: serde_json::to_value(&request.header).unwrap(),
            metadata: json!({}),
            content: json!({"status": "ok"}),
        };

        assert_eq!(reply.parent_msg_id(), Some(request.header.msg_id.as_str()));
    }
}

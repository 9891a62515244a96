//! `WireCodec`: framing of client <-> server JSON messages, size
//! validation, and gzip+base64 compression for large initial snapshots.
//!
//! Grounded on the teacher's `Event` wire enum (`#[serde(tag = "type")]`
//! over `bincode`), adapted to JSON per spec.md \S4.5 since the peer here
//! is a browser, not another Rust replica.

use std::io::{Read, Write};

use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::crdt::{Operation, SiteId};
use crate::error::{self, CoreResult};

/// A message received from the client over the WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Operation { operation: Operation },
    Cursor { cursor: ClientCursor },
    Presence { presence: serde_json::Map<String, serde_json::Value> },
    Ping {},
    RequestState {},
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientCursor {
    pub position: usize,
    #[serde(rename = "selectionStart", skip_serializing_if = "Option::is_none")]
    pub selection_start: Option<usize>,
    #[serde(rename = "selectionEnd", skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<usize>,
}

/// A message sent to the client over the WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    InitialState {
        #[serde(rename = "documentId")]
        document_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        #[serde(rename = "crdtState")]
        crdt_state: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        compressed: bool,
        text: String,
    },
    Operation {
        operation: Operation,
    },
    UserJoined {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        username: String,
        #[serde(rename = "siteId")]
        site_id: SiteId,
    },
    UserLeft {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        username: String,
        #[serde(rename = "siteId")]
        site_id: SiteId,
    },
    Cursor {
        cursor: ServerCursor,
    },
    Presence {
        presence: serde_json::Map<String, serde_json::Value>,
    },
    Error {
        message: String,
    },
    Pong {},
    RefreshRequired {},
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerCursor {
    #[serde(rename = "siteId")]
    pub site_id: SiteId,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub username: String,
    pub position: usize,
    #[serde(rename = "selectionStart", skip_serializing_if = "Option::is_none")]
    pub selection_start: Option<usize>,
    #[serde(rename = "selectionEnd", skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<usize>,
}

pub fn decode_client_message(bytes: &[u8], max_len: usize) -> CoreResult<ClientMessage> {
    if bytes.len() > max_len {
        return error::ProtocolSnafu {
            reason: format!("message of {} bytes exceeds {max_len} byte limit", bytes.len()),
        }
        .fail();
    }
    serde_json::from_slice(bytes).map_err(|e| error::CoreError::Protocol {
        reason: format!("invalid client message: {e}"),
    })
}

pub fn encode_server_message(message: &ServerMessage) -> String {
    serde_json::to_string(message).expect("ServerMessage always serializes")
}

/// Builds the `initial_state` message for a fresh subscriber, compressing
/// the snapshot when its JSON form exceeds `compress_threshold` bytes.
pub fn build_initial_state(
    document_id: &str,
    state_json: &serde_json::Value,
    full_text: &str,
    compress_threshold: usize,
    preview_chars: usize,
) -> ServerMessage {
    let preview: String = full_text.chars().take(preview_chars).collect();
    let state_str = state_json.to_string();

    if state_str.len() > compress_threshold {
        let data = gzip_base64(state_str.as_bytes());
        ServerMessage::InitialState {
            document_id: document_id.to_string(),
            crdt_state: None,
            data: Some(data),
            compressed: true,
            text: preview,
        }
    } else {
        ServerMessage::InitialState {
            document_id: document_id.to_string(),
            crdt_state: Some(state_json.clone()),
            data: None,
            compressed: false,
            text: preview,
        }
    }
}

fn gzip_base64(bytes: &[u8]) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).expect("in-memory gzip write cannot fail");
    let compressed = encoder.finish().expect("in-memory gzip finish cannot fail");
    base64::engine::general_purpose::STANDARD.encode(compressed)
}

#[allow(dead_code)]
fn gunzip_base64(data: &str) -> CoreResult<Vec<u8>> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| error::CoreError::Protocol {
            reason: format!("invalid base64 snapshot payload: {e}"),
        })?;
    let mut decoder = GzDecoder::new(&compressed[..]);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| error::CoreError::Protocol {
            reason: format!("invalid gzip snapshot payload: {e}"),
        })?;
    Ok(out)
}

//! Websocket envelope `{type, request_id?, payload?}`

use crate::error::ProbeResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Server to agent
pub const SET_CONFIG: &str = "set_config";
pub const PING: &str = "ping";
pub const REQUEST_SNAPSHOT: &str = "request_snapshot";
pub const PORT_CHECK_REQUEST: &str = "port_check_request";
pub const REQUEST_LOG: &str = "request_log";

// Agent to server
pub const HELLO: &str = "hello";
pub const HEARTBEAT: &str = "heartbeat";
pub const SNAPSHOT: &str = "snapshot";
pub const PONG: &str = "pong";
pub const LOG_CHUNK: &str = "log_chunk";
pub const LOG_END: &str = "log_end";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            request_id: None,
            payload: None,
        }
    }

    pub fn with_payload<T: Serialize>(kind: &str, payload: &T) -> ProbeResult<Self> {
        Ok(Self {
            payload: Some(serde_json::to_value(payload)?),
            ..Self::new(kind)
        })
    }

    pub fn request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn parse(text: &str) -> ProbeResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> ProbeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the payload, treating an absent one as `null`
    pub fn decode<T: DeserializeOwned>(&self) -> ProbeResult<T> {
        Ok(serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub probe_id: i64,
    pub agent_version: String,
    pub hostname: String,
    pub os_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub ts: i64,
    pub uptime_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunkPayload {
    pub seq: u64,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEndPayload {
    pub chunks: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn optional_fields_are_omitted() {
        let env = Envelope::new(HEARTBEAT);
        assert_eq!(env.to_json().unwrap(), r#"{"type":"heartbeat"}"#);

        let pong = Envelope::new(PONG).request_id(Some("r-1".into()));
        assert_eq!(pong.to_json().unwrap(), r#"{"type":"pong","request_id":"r-1"}"#);
    }

    #[test]
    fn parses_server_envelopes() {
        let env = Envelope::parse(
            r#"{"type":"set_config","payload":{"heartbeat_interval_sec":2}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, SET_CONFIG);
        assert_eq!(env.request_id, None);
        assert_eq!(env.payload, Some(json!({"heartbeat_interval_sec": 2})));

        let bare = Envelope::parse(r#"{"type":"ping","request_id":"abc"}"#).unwrap();
        assert_eq!(bare.decode::<Option<LogEndPayload>>().unwrap(), None);
    }
}

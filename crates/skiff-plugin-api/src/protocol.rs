//! Framing and handshake types for the plugin RPC channel
//!
//! Every frame is one line of JSON on the plugin's stdio. The plugin speaks
//! first with a [`Handshake`], after which the host multiplexes
//! [`Frame::Request`]s and the plugin answers with [`Frame::Response`]s that
//! may arrive in any order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Version of the framing/handshake layer
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Version of the service contract carried over the framing layer
pub const APP_PROTOCOL_VERSION: u32 = 1;

/// Environment variable the host sets before spawning a plugin
pub const MAGIC_COOKIE_KEY: &str = "SKIFF_PLUGIN_MAGIC_COOKIE";

/// Expected value of [`MAGIC_COOKIE_KEY`]
pub const MAGIC_COOKIE_VALUE: &str = "7c1f9e0b4a2d4be8a53b8d06d2c1f5aa";

/// Transport identifier advertised in the handshake
pub const TRANSPORT_NDJSON: &str = "ndjson";

/// Capability services a plugin can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Core,
    Payment,
    Sms,
    Kyc,
    Automation,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Payment => "payment",
            Self::Sms => "sms",
            Self::Kyc => "kyc",
            Self::Automation => "automation",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First frame written by a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub core_protocol_version: u32,
    pub app_protocol_version: u32,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub services: Vec<Service>,
}

fn default_transport() -> String {
    TRANSPORT_NDJSON.to_string()
}

impl Handshake {
    /// Handshake for the current protocol advertising `services` (core is always included)
    pub fn current(services: impl IntoIterator<Item = Service>) -> Self {
        let mut services: Vec<Service> = services.into_iter().collect();
        services.push(Service::Core);
        services.sort();
        services.dedup();
        Self {
            core_protocol_version: CORE_PROTOCOL_VERSION,
            app_protocol_version: APP_PROTOCOL_VERSION,
            transport: default_transport(),
            services,
        }
    }

    pub fn advertises(&self, service: Service) -> bool {
        self.services.contains(&service)
    }

    /// Check the handshake against what this host speaks
    pub fn check_compatible(&self) -> Result<(), String> {
        if self.core_protocol_version != CORE_PROTOCOL_VERSION {
            return Err(format!(
                "unsupported core protocol version {} (host speaks {})",
                self.core_protocol_version, CORE_PROTOCOL_VERSION
            ));
        }
        if self.app_protocol_version != APP_PROTOCOL_VERSION {
            return Err(format!(
                "unsupported app protocol version {} (host speaks {})",
                self.app_protocol_version, APP_PROTOCOL_VERSION
            ));
        }
        if !self.transport.eq_ignore_ascii_case(TRANSPORT_NDJSON) {
            return Err(format!("unsupported transport {:?}", self.transport));
        }
        if !self.advertises(Service::Core) {
            return Err("plugin does not advertise the core service".to_string());
        }
        Ok(())
    }
}

/// Status codes carried by failed responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Unknown,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Unimplemented,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

/// Error half of a response frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// One line on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Handshake(Handshake),
    Request {
        id: u64,
        service: Service,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcStatus>,
    },
}

impl Frame {
    pub fn ok(id: u64, result: Value) -> Self {
        Self::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, status: RpcStatus) -> Self {
        Self::Response {
            id,
            result: None,
            error: Some(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handshake_always_lists_core() {
        let hs = Handshake::current([Service::Payment, Service::Payment]);
        assert_eq!(hs.services, vec![Service::Core, Service::Payment]);
        assert!(hs.check_compatible().is_ok());
    }

    #[test]
    fn handshake_rejects_foreign_versions() {
        let mut hs = Handshake::current([]);
        hs.core_protocol_version = 9;
        assert!(hs.check_compatible().unwrap_err().contains("core protocol"));

        let mut hs = Handshake::current([]);
        hs.services.clear();
        assert!(hs.check_compatible().unwrap_err().contains("core service"));
    }

    #[test]
    fn request_frame_wire_shape() {
        let frame = Frame::Request {
            id: 7,
            service: Service::Payment,
            method: "list_methods".to_string(),
            params: json!({}),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["kind"], "request");
        assert_eq!(value["service"], "payment");
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn legacy_handshake_without_transport_defaults_to_ndjson() {
        let line = r#"{"kind":"handshake","core_protocol_version":1,"app_protocol_version":1,"services":["core"]}"#;
        let frame: Frame = serde_json::from_str(line).unwrap();
        match frame {
            Frame::Handshake(hs) => assert_eq!(hs.transport, TRANSPORT_NDJSON),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

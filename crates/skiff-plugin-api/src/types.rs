//! Request and response payloads for every capability service

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ========== Core ==========

/// Manifest as reported live by a running plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms: Option<SmsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyc: Option<KycCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation: Option<AutomationCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsCapability {
    #[serde(default)]
    pub send: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCapability {
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycCapability {
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub query_result: bool,
}

/// Automation capability, features carried as enum integers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationCapability {
    #[serde(default)]
    pub features: Vec<i32>,
    #[serde(default)]
    pub not_supported_reasons: BTreeMap<i32, String>,
}

/// Feature flags an automation plugin may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum AutomationFeature {
    CatalogSync = 1,
    Lifecycle = 2,
    PortMapping = 3,
    Backup = 4,
    Snapshot = 5,
    Firewall = 6,
    Monitor = 7,
    Vnc = 8,
    PanelUrl = 9,
    ElasticUpdate = 10,
    ResetPassword = 11,
    Rebuild = 12,
}

impl AutomationFeature {
    pub const ALL: [AutomationFeature; 12] = [
        Self::CatalogSync,
        Self::Lifecycle,
        Self::PortMapping,
        Self::Backup,
        Self::Snapshot,
        Self::Firewall,
        Self::Monitor,
        Self::Vnc,
        Self::PanelUrl,
        Self::ElasticUpdate,
        Self::ResetPassword,
        Self::Rebuild,
    ];

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_i32() == value)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CatalogSync => "catalog_sync",
            Self::Lifecycle => "lifecycle",
            Self::PortMapping => "port_mapping",
            Self::Backup => "backup",
            Self::Snapshot => "snapshot",
            Self::Firewall => "firewall",
            Self::Monitor => "monitor",
            Self::Vnc => "vnc",
            Self::PanelUrl => "panel_url",
            Self::ElasticUpdate => "elastic_update",
            Self::ResetPassword => "reset_password",
            Self::Rebuild => "rebuild",
        }
    }

    /// Parse a feature name; case and surrounding whitespace are ignored
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub json_schema: String,
    #[serde(default)]
    pub ui_schema: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateConfigRequest {
    pub config_json: String,
}

/// Shared shape for ValidateConfig, Init and ReloadConfig replies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: String,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub instance_id: String,
    pub config_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadConfigRequest {
    pub config_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRequest {
    pub instance_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub unix_millis: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

// ========== Payment ==========

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodInfo {
    pub method: String,
    pub name: String,
    #[serde(default)]
    pub icon_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMethodsResponse {
    pub methods: Vec<PaymentMethodInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub method: String,
    pub order_no: String,
    pub user_id: String,
    /// Amount in minor units
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub return_url: String,
    #[serde(default)]
    pub notify_url: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePaymentResponse {
    #[serde(default)]
    pub trade_no: String,
    #[serde(default)]
    pub pay_url: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPaymentRequest {
    pub method: String,
    pub order_no: String,
    #[serde(default)]
    pub trade_no: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemotePaymentStatus {
    #[default]
    Pending,
    Paid,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPaymentResponse {
    pub status: RemotePaymentStatus,
    #[serde(default)]
    pub trade_no: String,
    #[serde(default)]
    pub amount: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub method: String,
    pub order_no: String,
    pub trade_no: String,
    pub amount: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundResponse {
    #[serde(default)]
    pub refund_no: String,
    pub ok: bool,
    #[serde(default)]
    pub error: String,
}

/// Raw inbound HTTP request forwarded to a provider for notify verification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub raw_query: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyNotifyRequest {
    pub method: String,
    pub request: HttpRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyNotifyResponse {
    pub paid: bool,
    #[serde(default)]
    pub order_no: String,
    #[serde(default)]
    pub trade_no: String,
    #[serde(default)]
    pub amount: i64,
    /// Body the host writes back verbatim to the gateway
    #[serde(default)]
    pub ack_body: String,
}

// ========== SMS ==========

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSmsRequest {
    pub phone: String,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSmsResponse {
    #[serde(default)]
    pub message_id: String,
}

// ========== KYC ==========

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycStartRequest {
    pub user_id: String,
    pub real_name: String,
    pub id_number: String,
    #[serde(default)]
    pub return_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycStartResponse {
    pub token: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycQueryRequest {
    pub token: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    #[default]
    Pending,
    Verified,
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycQueryResponse {
    pub status: KycStatus,
    #[serde(default)]
    pub reason: String,
}

// ========== Automation ==========

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub state: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub id: i64,
    pub name: String,
    pub area_id: i64,
    #[serde(default)]
    pub state: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: i64,
    pub name: String,
    pub line_id: i64,
    #[serde(default)]
    pub cpu: i32,
    #[serde(default)]
    pub memory_gb: i32,
    #[serde(default)]
    pub disk_gb: i32,
    #[serde(default)]
    pub bandwidth_mbps: i32,
    #[serde(default)]
    pub monthly_price: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub image_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRequest {
    pub line_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAreasResponse {
    pub items: Vec<Area>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListLinesResponse {
    pub items: Vec<Line>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListPackagesResponse {
    pub items: Vec<Package>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListImagesResponse {
    pub items: Vec<Image>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSimple {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListInstancesSimpleRequest {
    #[serde(default)]
    pub search_tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListInstancesSimpleResponse {
    pub items: Vec<InstanceSimple>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub line_id: i64,
    pub name: String,
    pub os: String,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    pub password: String,
    pub expire_at_unix: i64,
    #[serde(default)]
    pub port_num: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceResponse {
    pub instance_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub instance_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub cpu: i32,
    #[serde(default)]
    pub memory_gb: i32,
    #[serde(default)]
    pub disk_gb: i32,
    #[serde(default)]
    pub bandwidth_mbps: i32,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub expire_at_unix: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildRequest {
    pub instance_id: i64,
    pub image_id: i64,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetPasswordRequest {
    pub instance_id: i64,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticUpdateRequest {
    pub instance_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_mbps: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_num: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewRequest {
    pub instance_id: i64,
    pub next_due_at_unix: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlResponse {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorResponse {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub storage_percent: f64,
    #[serde(default)]
    pub bytes_in: i64,
    #[serde(default)]
    pub bytes_out: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub sport: i32,
    pub dport: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPortMappingsResponse {
    pub items: Vec<PortMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPortMappingRequest {
    pub instance_id: i64,
    #[serde(default)]
    pub name: String,
    pub sport: i32,
    pub dport: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePortMappingRequest {
    pub instance_id: i64,
    pub mapping_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCandidatesRequest {
    pub instance_id: i64,
    #[serde(default)]
    pub keywords: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCandidatesResponse {
    pub ports: Vec<i32>,
}

/// Backup or snapshot record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePoint {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at_unix: i64,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRestorePointsResponse {
    pub items: Vec<RestorePoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePointRequest {
    pub instance_id: i64,
    pub point_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: i64,
    pub direction: String,
    pub protocol: String,
    pub method: String,
    pub port: String,
    pub ip: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFirewallRulesResponse {
    pub items: Vec<FirewallRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddFirewallRuleRequest {
    pub instance_id: i64,
    pub direction: String,
    pub protocol: String,
    pub method: String,
    pub port: String,
    pub ip: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFirewallRuleRequest {
    pub instance_id: i64,
    pub rule_id: i64,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

//! Capability-typed clients dispensed from an [`RpcClient`]

use crate::client::RpcClient;
use crate::protocol::Service;
use crate::types::*;
use crate::RpcResult;

/// Wire method names, shared by clients and the serve loop
pub mod method {
    pub const GET_MANIFEST: &str = "get_manifest";
    pub const GET_CONFIG_SCHEMA: &str = "get_config_schema";
    pub const VALIDATE_CONFIG: &str = "validate_config";
    pub const INIT: &str = "init";
    pub const RELOAD_CONFIG: &str = "reload_config";
    pub const HEALTH: &str = "health";

    pub const LIST_METHODS: &str = "list_methods";
    pub const CREATE_PAYMENT: &str = "create_payment";
    pub const QUERY_PAYMENT: &str = "query_payment";
    pub const REFUND: &str = "refund";
    pub const VERIFY_NOTIFY: &str = "verify_notify";

    pub const SEND: &str = "send";

    pub const START: &str = "start";
    pub const QUERY_RESULT: &str = "query_result";

    pub const LIST_AREAS: &str = "list_areas";
    pub const LIST_LINES: &str = "list_lines";
    pub const LIST_PACKAGES: &str = "list_packages";
    pub const LIST_IMAGES: &str = "list_images";
    pub const LIST_INSTANCES_SIMPLE: &str = "list_instances_simple";
    pub const CREATE_INSTANCE: &str = "create_instance";
    pub const GET_INSTANCE: &str = "get_instance";
    pub const START_INSTANCE: &str = "start_instance";
    pub const SHUTDOWN_INSTANCE: &str = "shutdown_instance";
    pub const REBOOT_INSTANCE: &str = "reboot_instance";
    pub const REBUILD_INSTANCE: &str = "rebuild_instance";
    pub const RESET_PASSWORD: &str = "reset_password";
    pub const ELASTIC_UPDATE: &str = "elastic_update";
    pub const LOCK_INSTANCE: &str = "lock_instance";
    pub const UNLOCK_INSTANCE: &str = "unlock_instance";
    pub const RENEW_INSTANCE: &str = "renew_instance";
    pub const DESTROY_INSTANCE: &str = "destroy_instance";
    pub const GET_PANEL_URL: &str = "get_panel_url";
    pub const GET_VNC_URL: &str = "get_vnc_url";
    pub const GET_MONITOR: &str = "get_monitor";
    pub const LIST_PORT_MAPPINGS: &str = "list_port_mappings";
    pub const ADD_PORT_MAPPING: &str = "add_port_mapping";
    pub const DELETE_PORT_MAPPING: &str = "delete_port_mapping";
    pub const FIND_PORT_CANDIDATES: &str = "find_port_candidates";
    pub const LIST_BACKUPS: &str = "list_backups";
    pub const CREATE_BACKUP: &str = "create_backup";
    pub const DELETE_BACKUP: &str = "delete_backup";
    pub const RESTORE_BACKUP: &str = "restore_backup";
    pub const LIST_SNAPSHOTS: &str = "list_snapshots";
    pub const CREATE_SNAPSHOT: &str = "create_snapshot";
    pub const DELETE_SNAPSHOT: &str = "delete_snapshot";
    pub const RESTORE_SNAPSHOT: &str = "restore_snapshot";
    pub const LIST_FIREWALL_RULES: &str = "list_firewall_rules";
    pub const ADD_FIREWALL_RULE: &str = "add_firewall_rule";
    pub const DELETE_FIREWALL_RULE: &str = "delete_firewall_rule";
}

/// Lifecycle service every plugin implements
#[derive(Debug, Clone)]
pub struct CoreClient {
    rpc: RpcClient,
}

impl CoreClient {
    pub(crate) fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub async fn get_manifest(&self) -> RpcResult<PluginManifest> {
        self.rpc
            .call(Service::Core, method::GET_MANIFEST, &Empty {})
            .await
    }

    pub async fn get_config_schema(&self) -> RpcResult<ConfigSchema> {
        self.rpc
            .call(Service::Core, method::GET_CONFIG_SCHEMA, &Empty {})
            .await
    }

    pub async fn validate_config(&self, config_json: &str) -> RpcResult<AckResponse> {
        let req = ValidateConfigRequest {
            config_json: config_json.to_string(),
        };
        self.rpc
            .call(Service::Core, method::VALIDATE_CONFIG, &req)
            .await
    }

    pub async fn init(&self, instance_id: &str, config_json: &str) -> RpcResult<AckResponse> {
        let req = InitRequest {
            instance_id: instance_id.to_string(),
            config_json: config_json.to_string(),
        };
        self.rpc.call(Service::Core, method::INIT, &req).await
    }

    pub async fn reload_config(&self, config_json: &str) -> RpcResult<AckResponse> {
        let req = ReloadConfigRequest {
            config_json: config_json.to_string(),
        };
        self.rpc
            .call(Service::Core, method::RELOAD_CONFIG, &req)
            .await
    }

    pub async fn health(&self, instance_id: &str) -> RpcResult<HealthResponse> {
        let req = HealthRequest {
            instance_id: instance_id.to_string(),
        };
        self.rpc.call(Service::Core, method::HEALTH, &req).await
    }
}

#[derive(Debug, Clone)]
pub struct PaymentClient {
    rpc: RpcClient,
}

impl PaymentClient {
    pub(crate) fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub async fn list_methods(&self) -> RpcResult<ListMethodsResponse> {
        self.rpc
            .call(Service::Payment, method::LIST_METHODS, &Empty {})
            .await
    }

    pub async fn create_payment(
        &self,
        req: &CreatePaymentRequest,
    ) -> RpcResult<CreatePaymentResponse> {
        self.rpc
            .call(Service::Payment, method::CREATE_PAYMENT, req)
            .await
    }

    pub async fn query_payment(&self, req: &QueryPaymentRequest) -> RpcResult<QueryPaymentResponse> {
        self.rpc
            .call(Service::Payment, method::QUERY_PAYMENT, req)
            .await
    }

    pub async fn refund(&self, req: &RefundRequest) -> RpcResult<RefundResponse> {
        self.rpc.call(Service::Payment, method::REFUND, req).await
    }

    pub async fn verify_notify(&self, req: &VerifyNotifyRequest) -> RpcResult<VerifyNotifyResponse> {
        self.rpc
            .call(Service::Payment, method::VERIFY_NOTIFY, req)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct SmsClient {
    rpc: RpcClient,
}

impl SmsClient {
    pub(crate) fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub async fn send(&self, req: &SendSmsRequest) -> RpcResult<SendSmsResponse> {
        self.rpc.call(Service::Sms, method::SEND, req).await
    }
}

#[derive(Debug, Clone)]
pub struct KycClient {
    rpc: RpcClient,
}

impl KycClient {
    pub(crate) fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub async fn start(&self, req: &KycStartRequest) -> RpcResult<KycStartResponse> {
        self.rpc.call(Service::Kyc, method::START, req).await
    }

    pub async fn query_result(&self, req: &KycQueryRequest) -> RpcResult<KycQueryResponse> {
        self.rpc.call(Service::Kyc, method::QUERY_RESULT, req).await
    }
}

/// Upstream VPS automation: catalog, instance lifecycle and per-instance resources
#[derive(Debug, Clone)]
pub struct AutomationClient {
    rpc: RpcClient,
}

impl AutomationClient {
    pub(crate) fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    async fn call<P, T>(&self, name: &str, params: &P) -> RpcResult<T>
    where
        P: serde::Serialize,
        T: serde::de::DeserializeOwned,
    {
        self.rpc.call(Service::Automation, name, params).await
    }

    // ========== Catalog ==========

    pub async fn list_areas(&self) -> RpcResult<ListAreasResponse> {
        self.call(method::LIST_AREAS, &Empty {}).await
    }

    pub async fn list_lines(&self) -> RpcResult<ListLinesResponse> {
        self.call(method::LIST_LINES, &Empty {}).await
    }

    pub async fn list_packages(&self, line_id: i64) -> RpcResult<ListPackagesResponse> {
        self.call(method::LIST_PACKAGES, &LineRequest { line_id }).await
    }

    pub async fn list_images(&self, line_id: i64) -> RpcResult<ListImagesResponse> {
        self.call(method::LIST_IMAGES, &LineRequest { line_id }).await
    }

    pub async fn list_instances_simple(
        &self,
        search_tag: &str,
    ) -> RpcResult<ListInstancesSimpleResponse> {
        let req = ListInstancesSimpleRequest {
            search_tag: search_tag.to_string(),
        };
        self.call(method::LIST_INSTANCES_SIMPLE, &req).await
    }

    // ========== Lifecycle ==========

    pub async fn create_instance(
        &self,
        req: &CreateInstanceRequest,
    ) -> RpcResult<CreateInstanceResponse> {
        self.call(method::CREATE_INSTANCE, req).await
    }

    pub async fn get_instance(&self, instance_id: i64) -> RpcResult<Instance> {
        self.call(method::GET_INSTANCE, &InstanceRequest { instance_id })
            .await
    }

    pub async fn start(&self, instance_id: i64) -> RpcResult<Empty> {
        self.call(method::START_INSTANCE, &InstanceRequest { instance_id })
            .await
    }

    pub async fn shutdown(&self, instance_id: i64) -> RpcResult<Empty> {
        self.call(method::SHUTDOWN_INSTANCE, &InstanceRequest { instance_id })
            .await
    }

    pub async fn reboot(&self, instance_id: i64) -> RpcResult<Empty> {
        self.call(method::REBOOT_INSTANCE, &InstanceRequest { instance_id })
            .await
    }

    pub async fn rebuild(&self, req: &RebuildRequest) -> RpcResult<Empty> {
        self.call(method::REBUILD_INSTANCE, req).await
    }

    pub async fn reset_password(&self, req: &ResetPasswordRequest) -> RpcResult<Empty> {
        self.call(method::RESET_PASSWORD, req).await
    }

    pub async fn elastic_update(&self, req: &ElasticUpdateRequest) -> RpcResult<Empty> {
        self.call(method::ELASTIC_UPDATE, req).await
    }

    pub async fn lock(&self, instance_id: i64) -> RpcResult<Empty> {
        self.call(method::LOCK_INSTANCE, &InstanceRequest { instance_id })
            .await
    }

    pub async fn unlock(&self, instance_id: i64) -> RpcResult<Empty> {
        self.call(method::UNLOCK_INSTANCE, &InstanceRequest { instance_id })
            .await
    }

    pub async fn renew(&self, req: &RenewRequest) -> RpcResult<Empty> {
        self.call(method::RENEW_INSTANCE, req).await
    }

    pub async fn destroy(&self, instance_id: i64) -> RpcResult<Empty> {
        self.call(method::DESTROY_INSTANCE, &InstanceRequest { instance_id })
            .await
    }

    pub async fn get_panel_url(&self, instance_id: i64) -> RpcResult<UrlResponse> {
        self.call(method::GET_PANEL_URL, &InstanceRequest { instance_id })
            .await
    }

    pub async fn get_vnc_url(&self, instance_id: i64) -> RpcResult<UrlResponse> {
        self.call(method::GET_VNC_URL, &InstanceRequest { instance_id })
            .await
    }

    pub async fn get_monitor(&self, instance_id: i64) -> RpcResult<MonitorResponse> {
        self.call(method::GET_MONITOR, &InstanceRequest { instance_id })
            .await
    }

    // ========== Port mappings ==========

    pub async fn list_port_mappings(&self, instance_id: i64) -> RpcResult<ListPortMappingsResponse> {
        self.call(method::LIST_PORT_MAPPINGS, &InstanceRequest { instance_id })
            .await
    }

    pub async fn add_port_mapping(&self, req: &AddPortMappingRequest) -> RpcResult<Empty> {
        self.call(method::ADD_PORT_MAPPING, req).await
    }

    pub async fn delete_port_mapping(&self, req: &DeletePortMappingRequest) -> RpcResult<Empty> {
        self.call(method::DELETE_PORT_MAPPING, req).await
    }

    pub async fn find_port_candidates(
        &self,
        req: &PortCandidatesRequest,
    ) -> RpcResult<PortCandidatesResponse> {
        self.call(method::FIND_PORT_CANDIDATES, req).await
    }

    // ========== Backups ==========

    pub async fn list_backups(&self, instance_id: i64) -> RpcResult<ListRestorePointsResponse> {
        self.call(method::LIST_BACKUPS, &InstanceRequest { instance_id })
            .await
    }

    pub async fn create_backup(&self, instance_id: i64) -> RpcResult<Empty> {
        self.call(method::CREATE_BACKUP, &InstanceRequest { instance_id })
            .await
    }

    pub async fn delete_backup(&self, req: &RestorePointRequest) -> RpcResult<Empty> {
        self.call(method::DELETE_BACKUP, req).await
    }

    pub async fn restore_backup(&self, req: &RestorePointRequest) -> RpcResult<Empty> {
        self.call(method::RESTORE_BACKUP, req).await
    }

    // ========== Snapshots ==========

    pub async fn list_snapshots(&self, instance_id: i64) -> RpcResult<ListRestorePointsResponse> {
        self.call(method::LIST_SNAPSHOTS, &InstanceRequest { instance_id })
            .await
    }

    pub async fn create_snapshot(&self, instance_id: i64) -> RpcResult<Empty> {
        self.call(method::CREATE_SNAPSHOT, &InstanceRequest { instance_id })
            .await
    }

    pub async fn delete_snapshot(&self, req: &RestorePointRequest) -> RpcResult<Empty> {
        self.call(method::DELETE_SNAPSHOT, req).await
    }

    pub async fn restore_snapshot(&self, req: &RestorePointRequest) -> RpcResult<Empty> {
        self.call(method::RESTORE_SNAPSHOT, req).await
    }

    // ========== Firewall ==========

    pub async fn list_firewall_rules(
        &self,
        instance_id: i64,
    ) -> RpcResult<ListFirewallRulesResponse> {
        self.call(method::LIST_FIREWALL_RULES, &InstanceRequest { instance_id })
            .await
    }

    pub async fn add_firewall_rule(&self, req: &AddFirewallRuleRequest) -> RpcResult<Empty> {
        self.call(method::ADD_FIREWALL_RULE, req).await
    }

    pub async fn delete_firewall_rule(&self, req: &DeleteFirewallRuleRequest) -> RpcResult<Empty> {
        self.call(method::DELETE_FIREWALL_RULE, req).await
    }
}

//! Plugin side of the RPC channel
//!
//! A plugin binary implements [`CoreService`] plus the capability traits it
//! advertises, then hands them to [`serve_stdio`].

use crate::capability::method;
use crate::protocol::{Frame, Handshake, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, RpcStatus, Service};
use crate::transport::{FrameReader, FrameWriter};
use crate::types::*;
use crate::{RpcError, RpcResult};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

type Reply<T> = Result<T, RpcStatus>;

#[async_trait]
pub trait CoreService: Send + Sync {
    async fn get_manifest(&self) -> Reply<PluginManifest>;
    async fn get_config_schema(&self) -> Reply<ConfigSchema>;
    async fn validate_config(&self, config_json: &str) -> Reply<AckResponse>;
    async fn init(&self, instance_id: &str, config_json: &str) -> Reply<AckResponse>;
    async fn reload_config(&self, config_json: &str) -> Reply<AckResponse>;
    async fn health(&self, instance_id: &str) -> Reply<HealthResponse>;
}

#[async_trait]
pub trait PaymentService: Send + Sync {
    async fn list_methods(&self) -> Reply<ListMethodsResponse>;
    async fn create_payment(&self, req: CreatePaymentRequest) -> Reply<CreatePaymentResponse>;
    async fn query_payment(&self, req: QueryPaymentRequest) -> Reply<QueryPaymentResponse>;
    async fn verify_notify(&self, req: VerifyNotifyRequest) -> Reply<VerifyNotifyResponse>;

    async fn refund(&self, _req: RefundRequest) -> Reply<RefundResponse> {
        Err(RpcStatus::unimplemented("refund is not supported"))
    }
}

#[async_trait]
pub trait SmsService: Send + Sync {
    async fn send(&self, req: SendSmsRequest) -> Reply<SendSmsResponse>;
}

#[async_trait]
pub trait KycService: Send + Sync {
    async fn start(&self, req: KycStartRequest) -> Reply<KycStartResponse>;
    async fn query_result(&self, req: KycQueryRequest) -> Reply<KycQueryResponse>;
}

fn unsupported<T>(what: &str) -> Reply<T> {
    Err(RpcStatus::unimplemented(format!("{what} is not supported")))
}

/// Upstream VPS automation; every method defaults to `unimplemented`
#[async_trait]
pub trait AutomationService: Send + Sync {
    async fn list_areas(&self) -> Reply<ListAreasResponse> {
        unsupported("list_areas")
    }
    async fn list_lines(&self) -> Reply<ListLinesResponse> {
        unsupported("list_lines")
    }
    async fn list_packages(&self, _req: LineRequest) -> Reply<ListPackagesResponse> {
        unsupported("list_packages")
    }
    async fn list_images(&self, _req: LineRequest) -> Reply<ListImagesResponse> {
        unsupported("list_images")
    }
    async fn list_instances_simple(
        &self,
        _req: ListInstancesSimpleRequest,
    ) -> Reply<ListInstancesSimpleResponse> {
        unsupported("list_instances_simple")
    }
    async fn create_instance(&self, _req: CreateInstanceRequest) -> Reply<CreateInstanceResponse> {
        unsupported("create_instance")
    }
    async fn get_instance(&self, _req: InstanceRequest) -> Reply<Instance> {
        unsupported("get_instance")
    }
    async fn start(&self, _req: InstanceRequest) -> Reply<Empty> {
        unsupported("start")
    }
    async fn shutdown(&self, _req: InstanceRequest) -> Reply<Empty> {
        unsupported("shutdown")
    }
    async fn reboot(&self, _req: InstanceRequest) -> Reply<Empty> {
        unsupported("reboot")
    }
    async fn rebuild(&self, _req: RebuildRequest) -> Reply<Empty> {
        unsupported("rebuild")
    }
    async fn reset_password(&self, _req: ResetPasswordRequest) -> Reply<Empty> {
        unsupported("reset_password")
    }
    async fn elastic_update(&self, _req: ElasticUpdateRequest) -> Reply<Empty> {
        unsupported("elastic_update")
    }
    async fn lock(&self, _req: InstanceRequest) -> Reply<Empty> {
        unsupported("lock")
    }
    async fn unlock(&self, _req: InstanceRequest) -> Reply<Empty> {
        unsupported("unlock")
    }
    async fn renew(&self, _req: RenewRequest) -> Reply<Empty> {
        unsupported("renew")
    }
    async fn destroy(&self, _req: InstanceRequest) -> Reply<Empty> {
        unsupported("destroy")
    }
    async fn get_panel_url(&self, _req: InstanceRequest) -> Reply<UrlResponse> {
        unsupported("get_panel_url")
    }
    async fn get_vnc_url(&self, _req: InstanceRequest) -> Reply<UrlResponse> {
        unsupported("get_vnc_url")
    }
    async fn get_monitor(&self, _req: InstanceRequest) -> Reply<MonitorResponse> {
        unsupported("get_monitor")
    }
    async fn list_port_mappings(&self, _req: InstanceRequest) -> Reply<ListPortMappingsResponse> {
        unsupported("list_port_mappings")
    }
    async fn add_port_mapping(&self, _req: AddPortMappingRequest) -> Reply<Empty> {
        unsupported("add_port_mapping")
    }
    async fn delete_port_mapping(&self, _req: DeletePortMappingRequest) -> Reply<Empty> {
        unsupported("delete_port_mapping")
    }
    async fn find_port_candidates(
        &self,
        _req: PortCandidatesRequest,
    ) -> Reply<PortCandidatesResponse> {
        unsupported("find_port_candidates")
    }
    async fn list_backups(&self, _req: InstanceRequest) -> Reply<ListRestorePointsResponse> {
        unsupported("list_backups")
    }
    async fn create_backup(&self, _req: InstanceRequest) -> Reply<Empty> {
        unsupported("create_backup")
    }
    async fn delete_backup(&self, _req: RestorePointRequest) -> Reply<Empty> {
        unsupported("delete_backup")
    }
    async fn restore_backup(&self, _req: RestorePointRequest) -> Reply<Empty> {
        unsupported("restore_backup")
    }
    async fn list_snapshots(&self, _req: InstanceRequest) -> Reply<ListRestorePointsResponse> {
        unsupported("list_snapshots")
    }
    async fn create_snapshot(&self, _req: InstanceRequest) -> Reply<Empty> {
        unsupported("create_snapshot")
    }
    async fn delete_snapshot(&self, _req: RestorePointRequest) -> Reply<Empty> {
        unsupported("delete_snapshot")
    }
    async fn restore_snapshot(&self, _req: RestorePointRequest) -> Reply<Empty> {
        unsupported("restore_snapshot")
    }
    async fn list_firewall_rules(&self, _req: InstanceRequest) -> Reply<ListFirewallRulesResponse> {
        unsupported("list_firewall_rules")
    }
    async fn add_firewall_rule(&self, _req: AddFirewallRuleRequest) -> Reply<Empty> {
        unsupported("add_firewall_rule")
    }
    async fn delete_firewall_rule(&self, _req: DeleteFirewallRuleRequest) -> Reply<Empty> {
        unsupported("delete_firewall_rule")
    }
}

/// The set of services one plugin process exposes
#[derive(Clone)]
pub struct PluginServices {
    core: Arc<dyn CoreService>,
    payment: Option<Arc<dyn PaymentService>>,
    sms: Option<Arc<dyn SmsService>>,
    kyc: Option<Arc<dyn KycService>>,
    automation: Option<Arc<dyn AutomationService>>,
}

impl PluginServices {
    pub fn new(core: Arc<dyn CoreService>) -> Self {
        Self {
            core,
            payment: None,
            sms: None,
            kyc: None,
            automation: None,
        }
    }

    pub fn with_payment(mut self, payment: Arc<dyn PaymentService>) -> Self {
        self.payment = Some(payment);
        self
    }

    pub fn with_sms(mut self, sms: Arc<dyn SmsService>) -> Self {
        self.sms = Some(sms);
        self
    }

    pub fn with_kyc(mut self, kyc: Arc<dyn KycService>) -> Self {
        self.kyc = Some(kyc);
        self
    }

    pub fn with_automation(mut self, automation: Arc<dyn AutomationService>) -> Self {
        self.automation = Some(automation);
        self
    }

    /// Handshake advertising exactly the registered services
    pub fn handshake(&self) -> Handshake {
        let mut services = Vec::new();
        if self.payment.is_some() {
            services.push(Service::Payment);
        }
        if self.sms.is_some() {
            services.push(Service::Sms);
        }
        if self.kyc.is_some() {
            services.push(Service::Kyc);
        }
        if self.automation.is_some() {
            services.push(Service::Automation);
        }
        Handshake::current(services)
    }
}

/// Serve requests until the host closes `reader`
pub async fn serve<R, W>(services: PluginServices, reader: R, writer: W) -> RpcResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let services = Arc::new(services);
    let mut writer = FrameWriter::new(writer);
    writer.send(&Frame::Handshake(services.handshake())).await?;

    let (tx, mut rx) = mpsc::channel::<Frame>(64);
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(err) = writer.send(&frame).await {
                tracing::debug!(error = %err, "host went away");
                break;
            }
        }
    });

    let mut frames = FrameReader::new(reader);
    let mut in_flight = JoinSet::new();
    while let Some(frame) = frames.next().await? {
        match frame {
            Frame::Request {
                id,
                service,
                method,
                params,
            } => {
                let services = services.clone();
                let tx = tx.clone();
                in_flight.spawn(async move {
                    let response = match dispatch(&services, service, &method, params).await {
                        Ok(value) => Frame::ok(id, value),
                        Err(status) => Frame::err(id, status),
                    };
                    let _ = tx.send(response).await;
                });
            }
            other => tracing::warn!(frame = ?other, "ignoring unexpected frame from host"),
        }
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    drop(tx);
    let _ = write_task.await;
    Ok(())
}

/// Serve over the process stdio, refusing to run outside a host
pub async fn serve_stdio(services: PluginServices) -> RpcResult<()> {
    match std::env::var(MAGIC_COOKIE_KEY) {
        Ok(value) if value == MAGIC_COOKIE_VALUE => {}
        _ => {
            return Err(RpcError::Protocol(
                "this binary is a skiff plugin and must be launched by the skiff host".to_string(),
            ));
        }
    }
    serve(services, tokio::io::stdin(), tokio::io::stdout()).await
}

fn decode<T: DeserializeOwned>(params: Value) -> Reply<T> {
    serde_json::from_value(params)
        .map_err(|err| RpcStatus::invalid_argument(format!("bad params: {err}")))
}

fn encode<T: Serialize>(reply: Reply<T>) -> Reply<Value> {
    let value = reply?;
    serde_json::to_value(value).map_err(|err| RpcStatus::internal(format!("encode reply: {err}")))
}

fn unknown_method(service: Service, name: &str) -> RpcStatus {
    RpcStatus::unimplemented(format!("unknown method {service}.{name}"))
}

async fn dispatch(
    services: &PluginServices,
    service: Service,
    name: &str,
    params: Value,
) -> Reply<Value> {
    match service {
        Service::Core => dispatch_core(services.core.as_ref(), name, params).await,
        Service::Payment => match &services.payment {
            Some(payment) => dispatch_payment(payment.as_ref(), name, params).await,
            None => Err(RpcStatus::unimplemented("payment service not served")),
        },
        Service::Sms => match &services.sms {
            Some(sms) if name == method::SEND => encode(sms.send(decode(params)?).await),
            Some(_) => Err(unknown_method(service, name)),
            None => Err(RpcStatus::unimplemented("sms service not served")),
        },
        Service::Kyc => match &services.kyc {
            Some(kyc) => match name {
                method::START => encode(kyc.start(decode(params)?).await),
                method::QUERY_RESULT => encode(kyc.query_result(decode(params)?).await),
                _ => Err(unknown_method(service, name)),
            },
            None => Err(RpcStatus::unimplemented("kyc service not served")),
        },
        Service::Automation => match &services.automation {
            Some(automation) => dispatch_automation(automation.as_ref(), name, params).await,
            None => Err(RpcStatus::unimplemented("automation service not served")),
        },
    }
}

async fn dispatch_core(core: &dyn CoreService, name: &str, params: Value) -> Reply<Value> {
    match name {
        method::GET_MANIFEST => encode(core.get_manifest().await),
        method::GET_CONFIG_SCHEMA => encode(core.get_config_schema().await),
        method::VALIDATE_CONFIG => {
            let req: ValidateConfigRequest = decode(params)?;
            encode(core.validate_config(&req.config_json).await)
        }
        method::INIT => {
            let req: InitRequest = decode(params)?;
            encode(core.init(&req.instance_id, &req.config_json).await)
        }
        method::RELOAD_CONFIG => {
            let req: ReloadConfigRequest = decode(params)?;
            encode(core.reload_config(&req.config_json).await)
        }
        method::HEALTH => {
            let req: HealthRequest = decode(params)?;
            encode(core.health(&req.instance_id).await)
        }
        _ => Err(unknown_method(Service::Core, name)),
    }
}

async fn dispatch_payment(payment: &dyn PaymentService, name: &str, params: Value) -> Reply<Value> {
    match name {
        method::LIST_METHODS => encode(payment.list_methods().await),
        method::CREATE_PAYMENT => encode(payment.create_payment(decode(params)?).await),
        method::QUERY_PAYMENT => encode(payment.query_payment(decode(params)?).await),
        method::REFUND => encode(payment.refund(decode(params)?).await),
        method::VERIFY_NOTIFY => encode(payment.verify_notify(decode(params)?).await),
        _ => Err(unknown_method(Service::Payment, name)),
    }
}

async fn dispatch_automation(
    automation: &dyn AutomationService,
    name: &str,
    params: Value,
) -> Reply<Value> {
    let a = automation;
    match name {
        method::LIST_AREAS => encode(a.list_areas().await),
        method::LIST_LINES => encode(a.list_lines().await),
        method::LIST_PACKAGES => encode(a.list_packages(decode(params)?).await),
        method::LIST_IMAGES => encode(a.list_images(decode(params)?).await),
        method::LIST_INSTANCES_SIMPLE => encode(a.list_instances_simple(decode(params)?).await),
        method::CREATE_INSTANCE => encode(a.create_instance(decode(params)?).await),
        method::GET_INSTANCE => encode(a.get_instance(decode(params)?).await),
        method::START_INSTANCE => encode(a.start(decode(params)?).await),
        method::SHUTDOWN_INSTANCE => encode(a.shutdown(decode(params)?).await),
        method::REBOOT_INSTANCE => encode(a.reboot(decode(params)?).await),
        method::REBUILD_INSTANCE => encode(a.rebuild(decode(params)?).await),
        method::RESET_PASSWORD => encode(a.reset_password(decode(params)?).await),
        method::ELASTIC_UPDATE => encode(a.elastic_update(decode(params)?).await),
        method::LOCK_INSTANCE => encode(a.lock(decode(params)?).await),
        method::UNLOCK_INSTANCE => encode(a.unlock(decode(params)?).await),
        method::RENEW_INSTANCE => encode(a.renew(decode(params)?).await),
        method::DESTROY_INSTANCE => encode(a.destroy(decode(params)?).await),
        method::GET_PANEL_URL => encode(a.get_panel_url(decode(params)?).await),
        method::GET_VNC_URL => encode(a.get_vnc_url(decode(params)?).await),
        method::GET_MONITOR => encode(a.get_monitor(decode(params)?).await),
        method::LIST_PORT_MAPPINGS => encode(a.list_port_mappings(decode(params)?).await),
        method::ADD_PORT_MAPPING => encode(a.add_port_mapping(decode(params)?).await),
        method::DELETE_PORT_MAPPING => encode(a.delete_port_mapping(decode(params)?).await),
        method::FIND_PORT_CANDIDATES => encode(a.find_port_candidates(decode(params)?).await),
        method::LIST_BACKUPS => encode(a.list_backups(decode(params)?).await),
        method::CREATE_BACKUP => encode(a.create_backup(decode(params)?).await),
        method::DELETE_BACKUP => encode(a.delete_backup(decode(params)?).await),
        method::RESTORE_BACKUP => encode(a.restore_backup(decode(params)?).await),
        method::LIST_SNAPSHOTS => encode(a.list_snapshots(decode(params)?).await),
        method::CREATE_SNAPSHOT => encode(a.create_snapshot(decode(params)?).await),
        method::DELETE_SNAPSHOT => encode(a.delete_snapshot(decode(params)?).await),
        method::RESTORE_SNAPSHOT => encode(a.restore_snapshot(decode(params)?).await),
        method::LIST_FIREWALL_RULES => encode(a.list_firewall_rules(decode(params)?).await),
        method::ADD_FIREWALL_RULE => encode(a.add_firewall_rule(decode(params)?).await),
        method::DELETE_FIREWALL_RULE => encode(a.delete_firewall_rule(decode(params)?).await),
        _ => Err(unknown_method(Service::Automation, name)),
    }
}

//! Automation plugins: fixed config schema and catalog sync

use crate::PluginResult;
use serde::Serialize;
use skiff_plugin_api::AutomationClient;
use skiff_plugin_api::types::{Area, Image, Line, Package};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Schema served for every automation instance; the plugin is not dialed
pub const AUTOMATION_CONFIG_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["base_url", "api_key"],
  "properties": {
    "base_url": {
      "type": "string",
      "title": "Base URL",
      "description": "Upstream automation API endpoint"
    },
    "api_key": {
      "type": "string",
      "title": "API key",
      "format": "password"
    },
    "timeout_sec": {
      "type": "integer",
      "title": "Request timeout (seconds)",
      "default": 12,
      "minimum": 1
    },
    "retry": {
      "type": "integer",
      "title": "Retries",
      "default": 0,
      "minimum": 0
    },
    "dry_run": {
      "type": "boolean",
      "title": "Dry run",
      "default": false
    }
  }
}"#;

pub const AUTOMATION_UI_SCHEMA: &str = r#"{
  "api_key": {"ui:widget": "password"},
  "ui:order": ["base_url", "api_key", "timeout_sec", "retry", "dry_run"]
}"#;

/// Upstream catalog as reported by one automation plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Catalog {
    pub areas: Vec<Area>,
    pub lines: Vec<Line>,
    pub packages: BTreeMap<i64, Vec<Package>>,
    pub images: BTreeMap<i64, Vec<Image>>,
}

/// Areas implied by the lines when the plugin cannot list them itself
fn areas_from_lines(lines: &[Line]) -> Vec<Area> {
    lines
        .iter()
        .map(|l| l.area_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|id| Area {
            id,
            name: format!("Area {id}"),
            state: 1,
        })
        .collect()
}

/// Pull areas, lines, packages and images
pub async fn sync_catalog(client: &AutomationClient) -> PluginResult<Catalog> {
    let lines = client.list_lines().await?.items;
    let areas = match client.list_areas().await {
        Ok(resp) => resp.items,
        Err(err) => {
            warn!(error = %err, "list_areas failed, deriving areas from lines");
            areas_from_lines(&lines)
        }
    };

    let mut catalog = Catalog {
        areas,
        ..Default::default()
    };
    for line in &lines {
        let packages = client.list_packages(line.id).await?.items;
        let images = client.list_images(line.id).await?.items;
        debug!(
            line_id = line.id,
            packages = packages.len(),
            images = images.len(),
            "synced line"
        );
        catalog.packages.insert(line.id, packages);
        catalog.images.insert(line.id, images);
    }
    catalog.lines = lines;
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_schema::{missing_required_config_fields, parse_schema, secret_paths};
    use async_trait::async_trait;
    use serde_json::json;
    use skiff_plugin_api::RpcClient;
    use skiff_plugin_api::RpcStatus;
    use skiff_plugin_api::server::{AutomationService, CoreService, PluginServices, serve};
    use skiff_plugin_api::types::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn embedded_schema_marks_api_key_secret() {
        let schema = parse_schema(AUTOMATION_CONFIG_SCHEMA).unwrap();
        assert_eq!(secret_paths(&schema), vec![vec!["api_key".to_string()]]);
        assert_eq!(
            missing_required_config_fields(&schema, &json!({"base_url": "https://x"})),
            vec!["api_key"]
        );
        serde_json::from_str::<serde_json::Value>(AUTOMATION_UI_SCHEMA).unwrap();
    }

    #[test]
    fn areas_are_deduplicated_from_lines() {
        let lines = vec![
            Line { id: 1, name: "a".into(), area_id: 7, state: 1 },
            Line { id: 2, name: "b".into(), area_id: 3, state: 1 },
            Line { id: 3, name: "c".into(), area_id: 7, state: 1 },
        ];
        let areas = areas_from_lines(&lines);
        assert_eq!(areas.iter().map(|a| a.id).collect::<Vec<_>>(), vec![3, 7]);
    }

    struct Core;

    #[async_trait]
    impl CoreService for Core {
        async fn get_manifest(&self) -> Result<PluginManifest, RpcStatus> {
            Ok(PluginManifest::default())
        }
        async fn get_config_schema(&self) -> Result<ConfigSchema, RpcStatus> {
            Ok(ConfigSchema::default())
        }
        async fn validate_config(&self, _c: &str) -> Result<AckResponse, RpcStatus> {
            Ok(AckResponse::ok())
        }
        async fn init(&self, _i: &str, _c: &str) -> Result<AckResponse, RpcStatus> {
            Ok(AckResponse::ok())
        }
        async fn reload_config(&self, _c: &str) -> Result<AckResponse, RpcStatus> {
            Ok(AckResponse::ok())
        }
        async fn health(&self, _i: &str) -> Result<HealthResponse, RpcStatus> {
            Ok(HealthResponse::default())
        }
    }

    /// Lists lines, packages and images but not areas
    struct NoAreas;

    #[async_trait]
    impl AutomationService for NoAreas {
        async fn list_lines(&self) -> Result<ListLinesResponse, RpcStatus> {
            Ok(ListLinesResponse {
                items: vec![Line { id: 10, name: "hk-1".into(), area_id: 2, state: 1 }],
            })
        }
        async fn list_packages(&self, req: LineRequest) -> Result<ListPackagesResponse, RpcStatus> {
            Ok(ListPackagesResponse {
                items: vec![Package {
                    id: 100,
                    name: "small".into(),
                    line_id: req.line_id,
                    ..Default::default()
                }],
            })
        }
        async fn list_images(&self, _req: LineRequest) -> Result<ListImagesResponse, RpcStatus> {
            Ok(ListImagesResponse {
                items: vec![Image { id: 5, name: "debian-12".into(), image_type: "linux".into() }],
            })
        }
    }

    #[tokio::test]
    async fn sync_falls_back_when_areas_unsupported() {
        let services = PluginServices::new(Arc::new(Core)).with_automation(Arc::new(NoAreas));
        let (host_read, plugin_write) = tokio::io::duplex(64 * 1024);
        let (plugin_read, host_write) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(services, plugin_read, plugin_write));
        let rpc = RpcClient::connect(host_read, host_write, Duration::from_secs(5))
            .await
            .unwrap();

        let catalog = sync_catalog(&rpc.dispense_automation().unwrap()).await.unwrap();
        assert_eq!(catalog.areas.len(), 1);
        assert_eq!(catalog.areas[0].id, 2);
        assert_eq!(catalog.lines[0].name, "hk-1");
        assert_eq!(catalog.packages[&10][0].name, "small");
        assert_eq!(catalog.images[&10][0].name, "debian-12");
    }
}

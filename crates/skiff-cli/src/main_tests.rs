//! CLI parsing tests

use crate::{Cli, Commands, PaymentAction, PluginAction, parse_key, read_json_arg};
use clap::Parser;
use skiff_plugins::Category;

#[test]
fn keys_default_to_the_default_instance() {
    let key = parse_key("payment:ezpay").unwrap();
    assert_eq!(key.category, Category::Payment);
    assert_eq!(key.plugin_id, "ezpay");
    assert_eq!(key.instance_id, "default");

    let key = parse_key("automation:lxd:payment-lxd-abcd2345").unwrap();
    assert_eq!(key.instance_id, "payment-lxd-abcd2345");

    assert!(parse_key("ezpay").is_err());
    assert!(parse_key("mail:ezpay").is_err());
    assert!(parse_key("payment:../x").is_err());
}

#[test]
fn parses_plugin_commands() {
    let cli = Cli::try_parse_from(["skiff", "plugins", "import", "payment", "ezpay", "--allow-unofficial"]).unwrap();
    match cli.command {
        Commands::Plugins {
            action: PluginAction::Import { category, plugin_id, allow_unofficial },
        } => {
            assert_eq!(category, "payment");
            assert_eq!(plugin_id, "ezpay");
            assert!(allow_unofficial);
        }
        _ => panic!("wrong command"),
    }
}

#[test]
fn method_switch_requires_one_direction() {
    let cli = Cli::try_parse_from(["skiff", "payments", "method", "ezpay", "alipay", "--disable"]).unwrap();
    match cli.command {
        Commands::Payments {
            action: PaymentAction::Method { instance, enable, disable, .. },
        } => {
            assert_eq!(instance, "default");
            assert!(!enable);
            assert!(disable);
        }
        _ => panic!("wrong command"),
    }
    assert!(
        Cli::try_parse_from(["skiff", "payments", "method", "ezpay", "alipay", "--enable", "--disable"]).is_err()
    );
}

#[test]
fn refund_quote_takes_rfc3339_times() {
    assert!(Cli::try_parse_from([
        "skiff", "refund", "quote",
        "--created-at", "2026-01-01T00:00:00Z",
        "--expire-at", "2026-02-01T00:00:00Z",
        "--monthly-price", "3000",
    ])
    .is_ok());
    assert!(Cli::try_parse_from(["skiff", "refund", "quote", "--created-at", "yesterday"]).is_err());
}

#[test]
fn json_argument_may_come_from_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cfg.json");
    std::fs::write(&path, r#"{"base_url":"https://x"}"#).unwrap();
    let text = read_json_arg(&format!("@{}", path.display())).unwrap();
    assert!(text.contains("base_url"));
    assert!(read_json_arg("{not json").is_err());
}

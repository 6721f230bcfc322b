//! Tests for connection argument parsing and merging

use proptest::prelude::*;
use rivven_dbplugin::descriptor::{merge_arguments, parse_arguments};
use rivven_dbplugin::prelude::*;
use std::collections::BTreeMap;

fn key() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_.]{0,15}"
}

fn value() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_./:=-]{0,20}"
}

proptest! {
    #[test]
    fn parse_recovers_every_pair(pairs in prop::collection::btree_map(key(), value(), 0..8)) {
        let text = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";");

        let parsed = parse_arguments(&text).unwrap();
        prop_assert_eq!(parsed.len(), pairs.len());
        for (k, v) in &pairs {
            prop_assert_eq!(parsed.get(k), Some(v.as_str()));
        }
    }

    #[test]
    fn argument_string_parses_back(pairs in prop::collection::btree_map(key(), value(), 0..8)) {
        let mut props = Properties::new();
        for (k, v) in &pairs {
            props.insert(k.clone(), v.clone());
        }
        let reparsed = parse_arguments(&props.to_argument_string()).unwrap();
        prop_assert_eq!(reparsed, props);
    }

    #[test]
    fn explicit_credentials_win(user in key(), password in value(), stale in value()) {
        let args = format!("user={};password={};ssl=true", stale, stale);
        let secret = SensitiveString::new(password.clone());
        let merged =
            merge_arguments(Some(&args), Some(&user), Some(&secret), &Properties::new()).unwrap();

        prop_assert_eq!(merged.get("user"), Some(user.as_str()));
        prop_assert_eq!(merged.get("password"), Some(password.as_str()));
        prop_assert_eq!(merged.get("ssl"), Some("true"));
    }
}

#[test]
fn test_whitespace_and_empty_segments() {
    let props = parse_arguments(" a = 1 ;; b=2; ").unwrap();
    assert_eq!(props.get("a"), Some("1"));
    assert_eq!(props.get("b"), Some("2"));
    assert_eq!(props.len(), 2);
}

#[test]
fn test_malformed_segments_are_rejected() {
    for bad in ["novalue", "=1", "a=1;broken"] {
        let err = parse_arguments(bad).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration, "{}", bad);
    }
}

#[test]
fn test_no_user_keeps_argument_credentials() {
    let merged = merge_arguments(
        Some("user=fromargs;password=x"),
        None,
        None,
        &Properties::new().with("queryTimeout", "-1"),
    )
    .unwrap();
    assert_eq!(merged.get("user"), Some("fromargs"));
    assert_eq!(merged.get("queryTimeout"), Some("-1"));
}

#[test]
fn test_missing_password_becomes_empty() {
    let merged = merge_arguments(None, Some("app"), None, &Properties::new()).unwrap();
    assert_eq!(merged.get("password"), Some(""));
}

#[test]
fn test_config_properties_include_provider_extras() {
    let mut props = BTreeMap::new();
    for (k, v) in [
        ("provider", "sqlserver"),
        ("host", "sql.local"),
        ("database", "sales"),
        ("user", "sa"),
        ("password", "pw"),
        ("connectionArguments", "encrypt=false;user=ignored"),
        ("instanceName", "REPORTING"),
    ] {
        props.insert(k.to_string(), v.to_string());
    }

    let config: DatabaseConfig = from_properties(&props).unwrap();
    let merged = config.connection_properties().unwrap();
    assert_eq!(merged.get("user"), Some("sa"));
    assert_eq!(merged.get("encrypt"), Some("false"));
    assert_eq!(merged.get("instanceName"), Some("REPORTING"));
    assert_eq!(merged.get("queryTimeout"), Some("-1"));
}

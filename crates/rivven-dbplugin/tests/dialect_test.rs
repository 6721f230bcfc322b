//! Tests for provider dialects

use rivven_dbplugin::dialect::keys;
use rivven_dbplugin::prelude::*;

fn descriptor(provider: Provider) -> ConnectionDescriptor {
    let mut d = ConnectionDescriptor::new("db.local", provider.default_port().unwrap_or(0), "app")
        .with_credentials("app", "pw");
    if provider == Provider::Generic {
        d = d.with_extra(keys::CONNECTION_STRING, "jdbc:h2:mem:app");
    }
    d
}

#[test]
fn test_connection_strings_are_deterministic() {
    for provider in Provider::ALL {
        let dialect = dialect_for(provider);
        let d = descriptor(provider);
        let first = dialect.build_connection_string(&d).unwrap();
        let second = dialect.build_connection_string(&d.clone()).unwrap();
        assert_eq!(first, second, "{}", provider);
        assert!(first.starts_with("jdbc:"), "{}", first);
    }
}

#[test]
fn test_connection_string_per_provider() {
    let expected = [
        (Provider::Mysql, "jdbc:mysql://db.local:3306/app"),
        (Provider::Postgres, "jdbc:postgresql://db.local:5432/app"),
        (Provider::Oracle, "jdbc:oracle:thin:@db.local:1521:app"),
        (Provider::Sqlserver, "jdbc:sqlserver://db.local:1433;databaseName=app"),
        (Provider::Generic, "jdbc:h2:mem:app"),
    ];
    for (provider, url) in expected {
        let built = dialect_for(provider)
            .build_connection_string(&descriptor(provider))
            .unwrap();
        assert_eq!(built, url);
    }
}

#[test]
fn test_oracle_service_name() {
    let d = descriptor(Provider::Oracle).with_extra(keys::CONNECTION_TYPE, "service");
    assert_eq!(
        dialect_for(Provider::Oracle).build_connection_string(&d).unwrap(),
        "jdbc:oracle:thin:@//db.local:1521/app"
    );

    let bad = descriptor(Provider::Oracle).with_extra(keys::CONNECTION_TYPE, "tns");
    assert!(dialect_for(Provider::Oracle).build_connection_string(&bad).is_err());
}

#[test]
fn test_generic_requires_connection_string() {
    let d = ConnectionDescriptor::new("db.local", 0, "app");
    let err = dialect_for(Provider::Generic)
        .build_connection_string(&d)
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn test_driver_registration_keys() {
    for provider in Provider::ALL {
        let key = dialect_for(provider).provider_key();
        assert_eq!(key, ProviderKey::new("jdbc", provider.name()));
    }
}

#[test]
fn test_table_exists_queries() {
    let mysql = dialect_for(Provider::Mysql).table_exists_query("orders");
    assert!(mysql.contains("information_schema.tables"));
    assert!(mysql.contains("'orders'"));

    let oracle = dialect_for(Provider::Oracle).table_exists_query("hr.emp");
    assert!(oracle.contains("all_tables"));
    assert!(oracle.contains("'HR'"));
    assert!(oracle.contains("'EMP'"));

    let escaped = dialect_for(Provider::Postgres).table_exists_query("o'brien");
    assert!(escaped.contains("'o''brien'"));
}

#[test]
fn test_sqlserver_auth_mode_selection() {
    let dialect = dialect_for(Provider::Sqlserver);

    let plain = descriptor(Provider::Sqlserver);
    assert_eq!(dialect.auth_mode(&plain).unwrap(), None);

    let ad = plain
        .clone()
        .with_extra(keys::CONNECTION_TYPE, "Azure Active Directory")
        .with_extra(keys::AZURE_AUTH_TYPE, "ActiveDirectoryPassword");
    assert_eq!(
        dialect.auth_mode(&ad).unwrap(),
        Some(AuthMode::ActiveDirectoryPassword)
    );

    let unknown = plain
        .with_extra(keys::CONNECTION_TYPE, "Azure Active Directory")
        .with_extra(keys::AZURE_AUTH_TYPE, "Kerberos");
    assert!(matches!(
        dialect.auth_mode(&unknown),
        Err(Error::UnsupportedAuthMode { .. })
    ));
}

#[test]
fn test_other_providers_have_no_auth_modes() {
    for provider in [Provider::Mysql, Provider::Postgres, Provider::Oracle] {
        let d = descriptor(provider)
            .with_extra(keys::CONNECTION_TYPE, "Azure Active Directory")
            .with_extra(keys::AZURE_AUTH_TYPE, "ActiveDirectoryPassword");
        assert!(AuthMode::parse_for(provider, "SqlPassword").is_err());
        assert_eq!(dialect_for(provider).auth_mode(&d).unwrap(), None);
    }
}

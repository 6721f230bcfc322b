//! End-to-end tests for the table sink over the in-memory driver

use rivven_dbplugin::prelude::*;
use rivven_dbplugin::registry::DriverKey;
use rivven_dbplugin::sink::output_keys;
use rivven_dbplugin::testing::{MemoryDatabase, MemoryDriver, MemoryDriverClass};
use std::sync::Arc;

fn setup() -> (MemoryDatabase, StageContext) {
    let db = MemoryDatabase::new();
    db.create_table(
        "users",
        vec![
            ColumnDescriptor::new("id", SqlType::INTEGER),
            ColumnDescriptor::new("name", SqlType::VARCHAR),
            ColumnDescriptor::new("joined", SqlType::DATE),
        ],
    );

    let driver = MemoryDriver::with_database(db.clone()).with_url_prefix("jdbc:mysql:");
    let class = MemoryDriverClass::new(driver).with_class_name("com.mysql.cj.jdbc.Driver");
    let provider = StaticDriverProvider::new().with_driver("jdbc", "mysql", Arc::new(class));
    let ctx = StageContext::new(
        DriverRegistry::new(Arc::new(DriverManager::new())),
        Arc::new(provider),
    );
    (db, ctx)
}

fn sink_config(table: &str) -> DatabaseSinkConfig {
    let connection = DatabaseConfig::new(Provider::Mysql, "db.local", "shop")
        .with_credentials("writer", "s3cret")
        .with_arguments("useSSL=false;user=ignored")
        .with_extra("autoReconnect", "true");
    DatabaseSinkConfig::new(connection, table)
}

fn input_schema() -> Arc<Schema> {
    Arc::new(Schema::new(
        "input",
        vec![
            Field::nullable("name", FieldType::String),
            Field::required("id", FieldType::Long),
        ],
    ))
}

fn key() -> DriverKey {
    DriverKey::new("jdbc", "mysql")
}

#[tokio::test]
async fn test_prepare_run_publishes_writer_config() {
    let (db, ctx) = setup();
    let sink = DatabaseSink::new(sink_config("users"));

    let out = sink.prepare_run(&ctx, &input_schema()).await.unwrap();
    assert_eq!(out.get(output_keys::DRIVER_CLASS), Some("com.mysql.cj.jdbc.Driver"));
    assert_eq!(out.get(output_keys::URL), Some("jdbc:mysql://db.local:3306/shop"));
    assert_eq!(out.get(output_keys::USERNAME), Some("writer"));
    assert_eq!(out.get(output_keys::PASSWORD), Some("s3cret"));
    assert_eq!(out.get(output_keys::TABLE_NAME), Some("users"));
    assert_eq!(out.get(output_keys::FIELD_NAMES), Some("name,id"));
    assert_eq!(
        out.get(output_keys::ISOLATION_LEVEL),
        Some("TRANSACTION_SERIALIZABLE")
    );

    let arguments = out.get(output_keys::CONNECTION_ARGUMENTS).unwrap();
    assert!(arguments.contains("useSSL=false"));
    assert!(arguments.contains("autoReconnect=true"));
    assert!(!arguments.contains("user="));
    assert!(!arguments.contains("s3cret"));
    assert!(!format!("{:?}", out).contains("s3cret"));

    assert_eq!(db.open_connections(), 0);
    assert!(!ctx.registry().is_registered(&key()));
}

#[tokio::test]
async fn test_prepare_run_missing_table() {
    let (db, ctx) = setup();
    let sink = DatabaseSink::new(sink_config("accounts"));

    let err = sink.prepare_run(&ctx, &input_schema()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Schema);
    assert!(err.to_string().contains("Table 'accounts' does not exist"));
    assert_eq!(db.open_connections(), 0);
    assert!(ctx.registry().manager().is_empty());
}

#[tokio::test]
async fn test_initialize_transform_destroy() {
    let (db, ctx) = setup();
    let mut sink = DatabaseSink::new(sink_config("users"));

    sink.initialize(&ctx, &input_schema()).await.unwrap();
    assert_eq!(ctx.registry().active_references(&key()), 1);
    assert_eq!(db.open_connections(), 0);

    let resolved = sink.resolved_columns().unwrap();
    assert_eq!(resolved.types, vec![SqlType::VARCHAR, SqlType::INTEGER]);

    let record = StructuredRecord::builder(input_schema())
        .set("id", 7i64)
        .set("name", "ada")
        .build()
        .unwrap();
    let row = sink.transform(&record).unwrap();
    assert_eq!(row.columns().to_vec(), vec!["name".to_string(), "id".to_string()]);
    assert_eq!(row.types(), vec![SqlType::VARCHAR, SqlType::INTEGER]);
    assert_eq!(
        row.bind_values().unwrap(),
        vec![Value::String("ada".into()), Value::Int32(7)]
    );

    sink.destroy();
    assert!(sink.resolved_columns().is_none());
    assert!(!ctx.registry().is_registered(&key()));
    assert!(ctx.registry().manager().is_empty());
}

#[tokio::test]
async fn test_sinks_share_one_registration() {
    let (_db, ctx) = setup();
    let mut first = DatabaseSink::new(sink_config("users"));
    let mut second = DatabaseSink::new(sink_config("users"));

    first.initialize(&ctx, &input_schema()).await.unwrap();
    second.initialize(&ctx, &input_schema()).await.unwrap();
    assert_eq!(ctx.registry().active_references(&key()), 2);
    assert_eq!(ctx.registry().manager().len(), 1);

    first.destroy();
    assert!(ctx.registry().is_registered(&key()));
    second.destroy();
    assert!(!ctx.registry().is_registered(&key()));
}

#[tokio::test]
async fn test_initialize_unknown_column_releases_driver() {
    let (_db, ctx) = setup();
    let mut sink = DatabaseSink::new(sink_config("users"));
    let schema = Schema::new("input", vec![Field::nullable("email", FieldType::String)]);

    assert!(sink.initialize(&ctx, &schema).await.is_err());
    assert!(sink.resolved_columns().is_none());
    assert!(!ctx.registry().is_registered(&key()));
}

#[tokio::test]
async fn test_transform_rejects_unparseable_date() {
    let (_db, ctx) = setup();
    let mut sink = DatabaseSink::new(sink_config("users"));
    let schema = Arc::new(Schema::new(
        "input",
        vec![
            Field::nullable("id", FieldType::Long),
            Field::nullable("joined", FieldType::String),
        ],
    ));
    sink.initialize(&ctx, &schema).await.unwrap();

    let record = StructuredRecord::builder(Arc::clone(&schema))
        .set("id", 1i64)
        .set("joined", "not a date")
        .build()
        .unwrap();
    let err = sink.transform(&record).and_then(|row| row.bind_values()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::TypeConversion);
    sink.destroy();
}

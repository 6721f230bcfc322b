//! End-to-end tests for actions and post-actions over the in-memory driver

use rivven_dbplugin::action::ActionRunner;
use rivven_dbplugin::prelude::*;
use rivven_dbplugin::registry::DriverKey;
use rivven_dbplugin::testing::{MemoryDatabase, MemoryDriver, MemoryDriverClass};
use std::sync::Arc;

struct Fixture {
    db: MemoryDatabase,
    ctx: StageContext,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        let db = MemoryDatabase::new();
        db.create_table(
            "audit",
            vec![
                ColumnDescriptor::new("id", SqlType::INTEGER),
                ColumnDescriptor::new("note", SqlType::VARCHAR),
            ],
        );
        for (id, note) in [(1, "a"), (2, "b"), (3, "c")] {
            db.insert("audit", vec![Value::Int32(id), Value::from(note)])
                .unwrap();
        }

        let provider = StaticDriverProvider::new()
            .with_driver(
                "jdbc",
                "mysql",
                Arc::new(MemoryDriverClass::new(
                    MemoryDriver::with_database(db.clone()).with_url_prefix("jdbc:mysql:"),
                )),
            )
            .with_driver(
                "jdbc",
                "postgres",
                Arc::new(MemoryDriverClass::new(
                    MemoryDriver::with_database(db.clone()).with_url_prefix("jdbc:postgresql:"),
                )),
            );
        let ctx = StageContext::new(
            DriverRegistry::new(Arc::new(DriverManager::new())),
            Arc::new(provider),
        );
        Self { db, ctx }
    }

    fn assert_released(&self) {
        assert_eq!(self.db.open_connections(), 0);
        for name in ["mysql", "postgres"] {
            assert!(!self.ctx.registry().is_registered(&DriverKey::new("jdbc", name)));
        }
        assert!(self.ctx.registry().manager().is_empty());
    }
}

fn action(yaml: &str) -> DatabaseAction {
    DatabaseAction::new(from_yaml(yaml).unwrap())
}

#[tokio::test]
async fn test_delete_empties_table() {
    let f = Fixture::new();
    let report = action(
        r#"
provider: mysql
host: localhost
database: shop
user: root
password: pw
query: DELETE FROM audit
"#,
    )
    .run(&f.ctx)
    .await;

    assert!(report.is_completed());
    assert_eq!(report.into_result().unwrap(), Some(3));
    assert_eq!(f.db.row_count("audit"), 0);
    f.assert_released();
}

#[tokio::test]
async fn test_statement_failure_goes_through_cleanup() {
    let f = Fixture::new();
    f.db.fail_statements_containing("audit", "permission denied");

    let report = action(
        r#"
provider: postgres
host: localhost
database: shop
query: DELETE FROM audit WHERE id = 1
"#,
    )
    .run(&f.ctx)
    .await;

    assert_eq!(
        report.trace,
        vec![
            ActionState::Idle,
            ActionState::DriverLoading,
            ActionState::Connected,
            ActionState::Executing,
            ActionState::Failed,
            ActionState::Cleanup,
            ActionState::Terminal,
        ]
    );
    match report.outcome {
        ActionOutcome::Failed(e) => {
            assert_eq!(e.category(), ErrorCategory::Statement);
            assert!(e.to_string().contains("permission denied"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(f.db.row_count("audit"), 3);
    f.assert_released();
}

#[tokio::test]
async fn test_connection_failure_releases_driver() {
    let f = Fixture::new();
    f.db.fail_on_connect("connection refused");

    let report = ActionRunner::new()
        .run(
            &f.ctx,
            &DatabaseConfig::new(Provider::Mysql, "localhost", "shop"),
            "DELETE FROM audit",
            &Properties::new(),
        )
        .await;

    assert_eq!(
        report.trace,
        vec![
            ActionState::Idle,
            ActionState::DriverLoading,
            ActionState::Failed,
            ActionState::Cleanup,
            ActionState::Terminal,
        ]
    );
    let err = report.into_result().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Connection);
    f.assert_released();
}

#[tokio::test]
async fn test_unknown_plugin_fails_in_driver_loading() {
    let f = Fixture::new();
    let config =
        DatabaseConfig::new(Provider::Mysql, "localhost", "shop").with_plugin_name("mariadb-3");

    let report = ActionRunner::new()
        .run(&f.ctx, &config, "DELETE FROM audit", &Properties::new())
        .await;

    assert_eq!(report.trace[1], ActionState::DriverLoading);
    assert_eq!(report.trace.last(), Some(&ActionState::Terminal));
    let err = report.into_result().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::DriverLoad);
    assert_eq!(f.db.connections_opened(), 0);
}

#[tokio::test]
async fn test_invalid_config_never_connects() {
    let f = Fixture::new();
    let report = action(
        r#"
provider: mysql
host: localhost
database: shop
user: root
query: DELETE FROM audit
"#,
    )
    .run(&f.ctx)
    .await;

    let err = report.into_result().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert_eq!(f.db.connections_opened(), 0);
}

#[tokio::test]
async fn test_post_action_run_conditions() {
    let f = Fixture::new();
    let post = |condition: &str| {
        let config: PostActionConfig = from_yaml(&format!(
            r#"
provider: postgres
host: localhost
database: shop
query: DELETE FROM audit WHERE id = 1
runCondition: {}
"#,
            condition
        ))
        .unwrap();
        DatabasePostAction::new(config)
    };

    let skipped = post("failure").run(&f.ctx, PipelineRunStatus::Completed).await;
    assert!(skipped.is_skipped());
    assert_eq!(skipped.trace, vec![ActionState::Idle, ActionState::Terminal]);
    assert_eq!(f.db.connections_opened(), 0);

    let ran = post("success").run(&f.ctx, PipelineRunStatus::Completed).await;
    assert_eq!(ran.into_result().unwrap(), Some(1));
    assert_eq!(f.db.row_count("audit"), 2);

    let skipped = post("success").run(&f.ctx, PipelineRunStatus::Killed).await;
    assert!(skipped.is_skipped());
    f.assert_released();
}

#[tokio::test]
async fn test_mysql_post_action_allows_multiple_statements() {
    let f = Fixture::new();
    let config: PostActionConfig = from_yaml(
        r#"
provider: mysql
host: localhost
database: shop
user: root
password: pw
query: "DELETE FROM audit WHERE id = 1; DELETE FROM audit WHERE id = 2"
"#,
    )
    .unwrap();
    assert_eq!(config.run_condition, RunCondition::Completion);

    let report = DatabasePostAction::new(config)
        .run(&f.ctx, PipelineRunStatus::Failed)
        .await;
    assert_eq!(report.into_result().unwrap(), Some(2));
    assert_eq!(f.db.row_count("audit"), 1);

    let props = f.db.last_properties().unwrap();
    assert_eq!(props.get("allowMultiQueries"), Some("true"));
    assert_eq!(props.get("user"), Some("root"));
    f.assert_released();
}

#[tokio::test]
async fn test_delete_by_date_empties_table() {
    let f = Fixture::new();
    f.db.create_table(
        "t",
        vec![
            ColumnDescriptor::new("id", SqlType::INTEGER),
            ColumnDescriptor::new("day", SqlType::DATE),
        ],
    );
    f.db.insert("t", vec![Value::Int32(1), Value::from("1970-01-01")])
        .unwrap();

    let report = action(
        r#"
provider: postgres
host: localhost
database: app
query: "DELETE FROM t WHERE day = '1970-01-01'"
"#,
    )
    .run(&f.ctx)
    .await;

    assert_eq!(report.into_result().unwrap(), Some(1));
    assert_eq!(f.db.row_count("t"), 0);
    f.assert_released();
}

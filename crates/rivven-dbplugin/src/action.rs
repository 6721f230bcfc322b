//! Database actions: one statement run outside the record stream.
//!
//! An action loads the driver, opens a connection, executes its statement
//! and always cleans up, whatever step failed:
//!
//! ```text
//! Idle -> DriverLoading -> Connected -> Executing -> Completed -> Cleanup -> Terminal
//!              |               |            |
//!              +---------------+------------+--> Failed -> Cleanup -> Terminal
//! ```
//!
//! Post-actions run after a pipeline finishes and are gated on the run
//! status by their [`RunCondition`]; a gated-out post-action goes straight
//! from `Idle` to `Terminal` without touching the driver.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::config::DatabaseConfig;
use crate::connection::Connection;
use crate::context::{PipelineRunStatus, RunCondition, StageContext};
use crate::descriptor::Properties;
use crate::dialect::{keys, Provider};
use crate::error::{Error, Result};

/// Action lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionState {
    /// Not started
    Idle,
    /// Loading and registering the driver
    DriverLoading,
    /// Connection open
    Connected,
    /// Statement running
    Executing,
    /// Statement succeeded
    Completed,
    /// A step failed
    Failed,
    /// Releasing connection and driver
    Cleanup,
    /// Done
    Terminal,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How an action ended
#[derive(Debug)]
pub enum ActionOutcome {
    /// The run condition did not match; nothing was executed
    Skipped,
    /// The statement ran
    Completed {
        /// Rows affected as reported by the driver
        rows_affected: u64,
    },
    /// A step failed
    Failed(Error),
}

/// Result of running an action, with its state trace
#[derive(Debug)]
pub struct ActionReport {
    /// States visited, in order
    pub trace: Vec<ActionState>,
    /// Final outcome
    pub outcome: ActionOutcome,
}

impl ActionReport {
    /// Whether the statement ran successfully
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Completed { .. })
    }

    /// Whether the action was gated out
    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Skipped)
    }

    /// Rows affected, `None` when skipped; the failure as an error
    pub fn into_result(self) -> Result<Option<u64>> {
        match self.outcome {
            ActionOutcome::Skipped => Ok(None),
            ActionOutcome::Completed { rows_affected } => Ok(Some(rows_affected)),
            ActionOutcome::Failed(e) => Err(e),
        }
    }
}

/// Drives one statement through the action state machine
#[derive(Debug)]
pub struct ActionRunner {
    trace: Vec<ActionState>,
}

impl Default for ActionRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRunner {
    /// Fresh runner in `Idle`
    pub fn new() -> Self {
        Self {
            trace: vec![ActionState::Idle],
        }
    }

    fn enter(&mut self, state: ActionState) {
        debug!(from = ?self.trace.last(), to = %state, "Action state transition");
        self.trace.push(state);
    }

    /// Short-circuit `Idle -> Terminal`
    pub fn skip(mut self) -> ActionReport {
        self.enter(ActionState::Terminal);
        ActionReport {
            trace: self.trace,
            outcome: ActionOutcome::Skipped,
        }
    }

    /// Run `statement` against the database described by `config`.
    ///
    /// `extra` is merged over the configured connection properties.
    pub async fn run(
        mut self,
        ctx: &StageContext,
        config: &DatabaseConfig,
        statement: &str,
        extra: &Properties,
    ) -> ActionReport {
        self.enter(ActionState::DriverLoading);
        let handle = match ctx.acquire_driver(config) {
            Ok(handle) => handle,
            Err(e) => return self.fail(e),
        };

        let connection = match ctx.open(&handle, config, extra).await {
            Ok(c) => c,
            Err(e) => {
                drop(handle);
                return self.fail(e);
            }
        };
        self.enter(ActionState::Connected);

        self.enter(ActionState::Executing);
        info!(provider = %config.provider, database = %config.database, "Executing action statement");
        let result = connection.execute(statement).await.map_err(|e| match e {
            Error::StatementExecution { .. } => e,
            other => Error::statement_with_source(other.to_string(), statement, other),
        });

        let outcome = match result {
            Ok(rows_affected) => {
                self.enter(ActionState::Completed);
                info!(rows_affected, "Action statement completed");
                ActionOutcome::Completed { rows_affected }
            }
            Err(e) => {
                self.enter(ActionState::Failed);
                error!(error = %e, "Action statement failed");
                ActionOutcome::Failed(e)
            }
        };

        self.enter(ActionState::Cleanup);
        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close action connection");
        }
        drop(connection);
        ctx.registry().release(handle);
        self.enter(ActionState::Terminal);

        ActionReport {
            trace: self.trace,
            outcome,
        }
    }

    /// Fail before a connection was opened
    fn fail(mut self, e: Error) -> ActionReport {
        self.enter(ActionState::Failed);
        error!(error = %e, "Action failed");
        self.enter(ActionState::Cleanup);
        self.enter(ActionState::Terminal);
        ActionReport {
            trace: self.trace,
            outcome: ActionOutcome::Failed(e),
        }
    }
}

/// Configuration of a database action
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryActionConfig {
    /// Connection settings
    #[serde(flatten)]
    #[validate(nested)]
    pub connection: DatabaseConfig,

    /// Statement to execute
    #[validate(length(min = 1))]
    pub query: String,
}

impl QueryActionConfig {
    /// Check the statement and connection settings
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("Validation failed: {}", e)))?;
        if self.query.trim().is_empty() {
            return Err(Error::config("'query' must not be empty"));
        }
        self.connection.validate_config()
    }
}

/// Runs a statement once, e.g. as a pipeline stage action
#[derive(Debug, Clone)]
pub struct DatabaseAction {
    config: QueryActionConfig,
}

impl DatabaseAction {
    /// Create an action
    pub fn new(config: QueryActionConfig) -> Self {
        Self { config }
    }

    /// The action's configuration
    pub fn config(&self) -> &QueryActionConfig {
        &self.config
    }

    /// Validate and run the statement
    pub async fn run(&self, ctx: &StageContext) -> ActionReport {
        let runner = ActionRunner::new();
        if let Err(e) = self.config.validate_config() {
            return runner.fail(e);
        }
        runner
            .run(ctx, &self.config.connection, &self.config.query, &Properties::new())
            .await
    }
}

/// Configuration of a post-run action
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostActionConfig {
    /// Connection settings
    #[serde(flatten)]
    #[validate(nested)]
    pub connection: DatabaseConfig,

    /// Statement to execute
    #[validate(length(min = 1))]
    pub query: String,

    /// When to run (default: completion)
    #[serde(default)]
    pub run_condition: RunCondition,
}

impl PostActionConfig {
    /// Check the statement and connection settings
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("Validation failed: {}", e)))?;
        if self.query.trim().is_empty() {
            return Err(Error::config("'query' must not be empty"));
        }
        self.connection.validate_config()
    }
}

/// Runs a statement after a pipeline finishes, gated on the run status
#[derive(Debug, Clone)]
pub struct DatabasePostAction {
    config: PostActionConfig,
}

impl DatabasePostAction {
    /// Create a post-action
    pub fn new(config: PostActionConfig) -> Self {
        Self { config }
    }

    /// The post-action's configuration
    pub fn config(&self) -> &PostActionConfig {
        &self.config
    }

    /// Run the statement if the run condition matches `status`
    pub async fn run(&self, ctx: &StageContext, status: PipelineRunStatus) -> ActionReport {
        let runner = ActionRunner::new();
        if !self.config.run_condition.should_run(status) {
            info!(
                condition = %self.config.run_condition,
                status = ?status,
                "Skipping post-action"
            );
            return runner.skip();
        }
        if let Err(e) = self.config.validate_config() {
            return runner.fail(e);
        }

        let mut extra = Properties::new();
        if self.config.connection.provider == Provider::Mysql {
            extra.insert(keys::ALLOW_MULTI_QUERIES, "true");
        }
        runner
            .run(ctx, &self.config.connection, &self.config.query, &extra)
            .await
    }
}

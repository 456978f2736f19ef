//! Analytical database access over the Snowflake SQL API
//!
//! Each [`Warehouse::execute`] call is one `POST /api/v2/statements` request
//! carrying its own database/schema/warehouse context. A `202` means the
//! statement is still running; the handle is polled until it settles.

use async_trait::async_trait;
use docrelay_common::{RelayError, Result};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::WarehouseConfig;
use crate::secrets::WarehouseCredentials;

// ============================================================================
// SQL API Constants
// ============================================================================

/// Server-side statement timeout sent with every request.
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 3600;

/// Delay between status checks of a running statement.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";

/// A connection able to run one SQL statement at a time
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Run `sql` to completion; statements are independent, no transaction
    async fn execute(&self, sql: &str) -> Result<()>;
}

/// Opens [`Warehouse`] connections from credentials and target settings
#[async_trait]
pub trait WarehouseConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &WarehouseCredentials,
        config: &WarehouseConfig,
    ) -> Result<Box<dyn Warehouse>>;
}

/// Connector for the Snowflake SQL API
#[derive(Debug, Clone)]
pub struct SnowflakeConnector {
    http_timeout: Duration,
    poll_interval: Duration,
}

impl SnowflakeConnector {
    pub fn new(http_timeout: Duration) -> Self {
        Self {
            http_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl WarehouseConnector for SnowflakeConnector {
    async fn connect(
        &self,
        credentials: &WarehouseCredentials,
        config: &WarehouseConfig,
    ) -> Result<Box<dyn Warehouse>> {
        let http = Client::builder()
            .timeout(self.http_timeout)
            .build()
            .map_err(|e| RelayError::config(format!("cannot build HTTP client: {}", e)))?;

        let base_url = match &config.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => account_url(&credentials.account),
        };
        debug!(%base_url, account = %credentials.account, "Connecting to Snowflake");

        Ok(Box::new(SnowflakeSqlApi {
            http,
            base_url,
            token: credentials.token.clone(),
            token_type: credentials.token_type.clone(),
            context: StatementContext {
                database: config.database.clone(),
                schema: config.schema.clone(),
                warehouse: config.warehouse.clone(),
                role: credentials.role.clone(),
            },
            poll_interval: self.poll_interval,
        }))
    }
}

/// SQL API endpoint of an account identifier
pub fn account_url(account: &str) -> String {
    format!("https://{}.snowflakecomputing.com", account.to_lowercase())
}

#[derive(Debug, Clone)]
struct StatementContext {
    database: String,
    schema: String,
    warehouse: String,
    role: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    schema: &'a str,
    warehouse: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

/// Body of every SQL API status response (success, pending or failure)
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementStatus {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sql_state: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
}

/// Snowflake SQL API session
pub struct SnowflakeSqlApi {
    http: Client,
    base_url: String,
    token: String,
    token_type: String,
    context: StatementContext,
    poll_interval: Duration,
}

impl SnowflakeSqlApi {
    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header(TOKEN_TYPE_HEADER, &self.token_type)
            .header(header::ACCEPT, "application/json")
    }

    async fn submit(&self, sql: &str) -> Result<(StatusCode, StatementStatus)> {
        let url = format!("{}/api/v2/statements", self.base_url);
        let request_id = Uuid::new_v4();

        let body = StatementRequest {
            statement: sql,
            timeout: DEFAULT_STATEMENT_TIMEOUT_SECS,
            database: &self.context.database,
            schema: &self.context.schema,
            warehouse: &self.context.warehouse,
            role: self.context.role.as_deref(),
        };

        let response = self
            .authorized(self.http.post(&url))
            .query(&[("requestId", request_id.to_string())])
            .json(&body)
            .send()
            .await
            .map_err(network)?;

        read_status(response).await
    }

    async fn poll(&self, handle: &str) -> Result<(StatusCode, StatementStatus)> {
        let url = format!("{}/api/v2/statements/{}", self.base_url, handle);
        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(network)?;

        read_status(response).await
    }
}

#[async_trait]
impl Warehouse for SnowflakeSqlApi {
    #[instrument(skip(self, sql))]
    async fn execute(&self, sql: &str) -> Result<()> {
        let (mut status, mut body) = self.submit(sql).await?;

        while status == StatusCode::ACCEPTED {
            let handle = body.statement_handle.clone().ok_or_else(|| {
                RelayError::statement("statement accepted without a statement handle")
            })?;
            debug!(%handle, "Statement still running");
            tokio::time::sleep(self.poll_interval).await;
            (status, body) = self.poll(&handle).await?;
        }

        if status == StatusCode::OK {
            debug!(
                handle = body.statement_handle.as_deref().unwrap_or_default(),
                "Statement executed"
            );
            return Ok(());
        }

        Err(statement_error(status, body))
    }
}

async fn read_status(response: reqwest::Response) -> Result<(StatusCode, StatementStatus)> {
    let status = response.status();
    let text = response.text().await.map_err(network)?;
    let body = serde_json::from_str(&text).unwrap_or_else(|_| StatementStatus {
        message: (!text.is_empty()).then(|| text.clone()),
        ..StatementStatus::default()
    });
    Ok((status, body))
}

fn statement_error(status: StatusCode, body: StatementStatus) -> RelayError {
    let mut message = body
        .message
        .unwrap_or_else(|| format!("SQL API returned {}", status));
    if let Some(code) = body.code {
        message = format!("{} (code {})", message, code);
    }
    RelayError::Statement {
        message,
        sql_state: body.sql_state,
    }
}

fn network(err: reqwest::Error) -> RelayError {
    RelayError::Network(err.to_string())
}

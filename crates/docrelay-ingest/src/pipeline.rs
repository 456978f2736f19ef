//! Orchestrator
//!
//! One run walks `Fetch -> Stage -> Load -> Done`. Any stage error moves the
//! run to `Failed` and is returned to the caller as-is. Under
//! [`SchemaCheck::Enforce`] a mismatched load plan fails the run before
//! anything is fetched.

use docrelay_common::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

use crate::config::JobConfig;
use crate::loader::{self, LoadPlan, SchemaCheck};
use crate::secrets::{AwsSecretStore, SecretStore, SharePointCredentials, WarehouseCredentials};
use crate::sharepoint::{self, DocumentRepository, SharePointClient};
use crate::stager;
use crate::storage::{ObjectStore, S3ObjectStore};
use crate::warehouse::{SnowflakeConnector, WarehouseConnector};

/// Returned by a run that reached `Done`.
pub const COMPLETION_MESSAGE: &str = "Data ingestion completed.";

/// Position of a run in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Fetch,
    Stage,
    Load,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Fetch => "FETCH",
            RunState::Stage => "STAGE",
            RunState::Load => "LOAD",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// The external capabilities a run needs
#[derive(Clone)]
pub struct Pipeline {
    secrets: Arc<dyn SecretStore>,
    repository: Arc<dyn DocumentRepository>,
    store: Arc<dyn ObjectStore>,
    connector: Arc<dyn WarehouseConnector>,
}

impl Pipeline {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        repository: Arc<dyn DocumentRepository>,
        store: Arc<dyn ObjectStore>,
        connector: Arc<dyn WarehouseConnector>,
    ) -> Self {
        Self {
            secrets,
            repository,
            store,
            connector,
        }
    }

    /// Build the production clients for `config`
    pub async fn from_config(config: &JobConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);

        Ok(Self::new(
            Arc::new(AwsSecretStore::from_env().await),
            Arc::new(SharePointClient::new(timeout)?),
            Arc::new(S3ObjectStore::new(&config.storage).await?),
            Arc::new(SnowflakeConnector::new(timeout)),
        ))
    }

    /// Run the pipeline once
    #[instrument(skip(self, config), fields(file = %config.file_name))]
    pub async fn run(&self, config: &JobConfig) -> Result<&'static str> {
        info!("Loading data from SharePoint to Snowflake");
        let mut stage = RunState::Fetch;

        let result = self.advance(config, &mut stage).await;
        if let Err(ref e) = result {
            error!(failed_in = %stage, error = %e, "Data ingestion failed");
            stage = RunState::Failed;
        }
        info!(%stage, "Run finished");

        result.map(|()| COMPLETION_MESSAGE)
    }

    async fn advance(&self, config: &JobConfig, stage: &mut RunState) -> Result<()> {
        // nothing is fetched or overwritten for a load that would be refused
        if config.warehouse.schema_check == SchemaCheck::Enforce {
            plan(config).check_schema()?;
        }

        let job = config.transfer_job();

        let fields = self.secrets.get(&config.sharepoint.secret_name).await?;
        let credentials = SharePointCredentials::from_fields(&config.sharepoint.secret_name, fields)?;
        let local_path = sharepoint::fetch_file(self.repository.as_ref(), &job, &credentials).await?;

        *stage = RunState::Stage;
        let artifact =
            stager::stage(self.store.as_ref(), &local_path, &job.bucket, &job.object_path).await?;

        *stage = RunState::Load;
        let fields = self.secrets.get(&config.warehouse.secret_name).await?;
        let credentials = WarehouseCredentials::from_fields(&config.warehouse.secret_name, fields)?;
        let plan = LoadPlan::new(&config.warehouse, &artifact.bucket, &artifact.object_path);
        let warehouse = self.connector.connect(&credentials, &config.warehouse).await?;
        loader::load(warehouse.as_ref(), &plan, config.warehouse.schema_check).await?;

        *stage = RunState::Done;
        Ok(())
    }
}

/// Load statements `run` would issue for `config`, without contacting anything
pub fn plan(config: &JobConfig) -> LoadPlan {
    let job = config.transfer_job();
    let object_path = if stager::is_spreadsheet(&job.object_path) {
        stager::delimited_name(&job.object_path)
    } else {
        job.object_path
    };
    LoadPlan::new(&config.warehouse, &job.bucket, &object_path)
}

//! Job configuration
//!
//! Everything a relay run needs from the environment is read here, once, and
//! handed to the stages as plain values. No other module calls `std::env`.

use docrelay_common::{RelayError, Result};
use std::path::PathBuf;

use crate::loader::SchemaCheck;
use crate::storage::StorageConfig;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Secret holding the SharePoint app registration.
pub const DEFAULT_SHAREPOINT_SECRET_NAME: &str = "MKT-sharepoint-client-SECRET";

/// Secret holding the Snowflake account and token.
pub const DEFAULT_SNOWFLAKE_SECRET_NAME: &str = "snowflake-credentials";

pub const DEFAULT_SNOWFLAKE_SCHEMA: &str = "SCHEMA";

/// Named Snowflake file format used by the bulk copy.
pub const DEFAULT_FILE_FORMAT: &str = "SHAREPOINT_CSV";

/// Key prefix under which fetched files are staged.
pub const DEFAULT_S3_PREFIX: &str = "sharepoint";

/// Ephemeral storage on the host runtime.
pub const DEFAULT_WORK_DIR: &str = "/tmp";

/// Timeout for every HTTP call made by the relay.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// SharePoint site settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePointConfig {
    /// Absolute site URL, e.g. `https://contoso.sharepoint.com/sites/marketing`
    pub site_url: String,
    /// Server-relative folder holding the file, e.g. `/sites/marketing/Shared Documents`
    pub folder: String,
    pub secret_name: String,
}

/// Snowflake target settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseConfig {
    pub database: String,
    pub schema: String,
    pub warehouse: String,
    pub stage: String,
    pub file_format: String,
    pub secret_name: String,
    /// Overrides the account-derived SQL API base URL
    pub api_url: Option<String>,
    pub schema_check: SchemaCheck,
}

/// Configuration for one relay run
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Name of the file in SharePoint, also used locally and in S3
    pub file_name: String,
    pub work_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub sharepoint: SharePointConfig,
    pub storage: StorageConfig,
    pub warehouse: WarehouseConfig,
}

/// One file's journey from SharePoint to S3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub file_name: String,
    pub local_path: PathBuf,
    pub site_url: String,
    /// Server-relative path of the file in SharePoint
    pub remote_path: String,
    pub bucket: String,
    pub object_path: String,
}

impl JobConfig {
    /// Load configuration from the process environment (and `.env`, if present)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            lookup(key).ok_or_else(|| {
                RelayError::config(format!("environment variable {} is not set", key))
            })
        };
        let or_default =
            |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let schema_check = match lookup("SNOWFLAKE_SCHEMA_CHECK") {
            Some(value) => value.parse()?,
            None => SchemaCheck::default(),
        };

        let http_timeout_secs = match lookup("HTTP_TIMEOUT_SECS") {
            Some(value) => value.parse().map_err(|_| {
                RelayError::config(format!("HTTP_TIMEOUT_SECS must be a number, got '{}'", value))
            })?,
            None => DEFAULT_HTTP_TIMEOUT_SECS,
        };

        let config = JobConfig {
            file_name: required("SHAREPOINT_FILE_NAME")?,
            work_dir: PathBuf::from(or_default("WORK_DIR", DEFAULT_WORK_DIR)),
            http_timeout_secs,
            sharepoint: SharePointConfig {
                site_url: required("SHAREPOINT_SITE_URL")?,
                folder: required("SHAREPOINT_FOLDER")?,
                secret_name: or_default("SHAREPOINT_SECRET_NAME", DEFAULT_SHAREPOINT_SECRET_NAME),
            },
            storage: StorageConfig::from_lookup(&lookup)?,
            warehouse: WarehouseConfig {
                database: required("SNOWFLAKE_DATABASE")?,
                schema: or_default("SNOWFLAKE_SCHEMA", DEFAULT_SNOWFLAKE_SCHEMA),
                warehouse: required("SNOWFLAKE_WAREHOUSE")?,
                stage: required("SNOWFLAKE_STAGE")?,
                file_format: or_default("SNOWFLAKE_FILE_FORMAT", DEFAULT_FILE_FORMAT),
                secret_name: or_default("SNOWFLAKE_SECRET_NAME", DEFAULT_SNOWFLAKE_SECRET_NAME),
                api_url: lookup("SNOWFLAKE_API_URL"),
                schema_check,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate values that parsed but cannot work
    pub fn validate(&self) -> Result<()> {
        if self.file_name.contains(['/', '\\']) || self.file_name == "." || self.file_name == ".." {
            return Err(RelayError::config(format!(
                "SHAREPOINT_FILE_NAME must be a bare file name, got '{}'",
                self.file_name
            )));
        }

        if !self.sharepoint.site_url.starts_with("http://")
            && !self.sharepoint.site_url.starts_with("https://")
        {
            return Err(RelayError::config(format!(
                "SHAREPOINT_SITE_URL must be an http(s) URL, got '{}'",
                self.sharepoint.site_url
            )));
        }

        if !self.sharepoint.folder.starts_with('/') {
            return Err(RelayError::config(format!(
                "SHAREPOINT_FOLDER must be server-relative (start with '/'), got '{}'",
                self.sharepoint.folder
            )));
        }

        if self.http_timeout_secs == 0 {
            return Err(RelayError::config("HTTP_TIMEOUT_SECS must be greater than 0"));
        }

        Ok(())
    }

    /// Derive the transfer job for this run
    pub fn transfer_job(&self) -> TransferJob {
        let folder = self.sharepoint.folder.trim_end_matches('/');
        let prefix = self.storage.prefix.trim_matches('/');
        let object_path = if prefix.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}/{}", prefix, self.file_name)
        };

        TransferJob {
            file_name: self.file_name.clone(),
            local_path: self.work_dir.join(&self.file_name),
            site_url: self.sharepoint.site_url.trim_end_matches('/').to_string(),
            remote_path: format!("{}/{}", folder, self.file_name),
            bucket: self.storage.bucket.clone(),
            object_path,
        }
    }
}

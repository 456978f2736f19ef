//! Object store access
//!
//! [`ObjectStore`] is the narrow upload capability the stager needs.
//! [`S3ObjectStore`] implements it on the AWS SDK; tests swap in doubles.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client};
use docrelay_common::{RelayError, Result};
use std::path::Path;
use tracing::{debug, info, instrument};

use crate::config::DEFAULT_S3_PREFIX;

/// S3 connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub bucket: String,
    /// Key prefix for staged files
    pub prefix: String,
    /// Custom endpoint (MinIO, LocalStack); `None` means AWS
    pub endpoint: Option<String>,
    /// Region override; `None` defers to the AWS provider chain
    pub region: Option<String>,
    pub path_style: bool,
    /// Static keys; when absent the AWS default credential chain is used
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl StorageConfig {
    /// Read `S3_*` variables from the given source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bucket = lookup("S3_BUCKET")
            .ok_or_else(|| RelayError::config("environment variable S3_BUCKET is not set"))?;

        let access_key = lookup("S3_ACCESS_KEY");
        let secret_key = lookup("S3_SECRET_KEY");
        if access_key.is_some() != secret_key.is_some() {
            return Err(RelayError::config(
                "S3_ACCESS_KEY and S3_SECRET_KEY must be set together",
            ));
        }

        Ok(Self {
            bucket,
            prefix: lookup("S3_PREFIX").unwrap_or_else(|| DEFAULT_S3_PREFIX.to_string()),
            endpoint: lookup("S3_ENDPOINT"),
            region: lookup("S3_REGION"),
            path_style: lookup("S3_PATH_STYLE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            access_key,
            secret_key,
        })
    }
}

/// Upload capability of an object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write the local file to `bucket/key`, replacing any existing object
    async fn upload_file(&self, local_path: &Path, bucket: &str, key: &str) -> Result<()>;
}

/// [`ObjectStore`] backed by Amazon S3 (or an S3-compatible endpoint)
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Build a client from the AWS provider chain plus any overrides in `config`
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        debug!(
            endpoint = ?config.endpoint,
            region = ?config.region,
            path_style = config.path_style,
            "Initializing S3 client"
        );

        let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.path_style);

        if let Some(region) = &config.region {
            builder = builder.region(Region::new(region.clone()));
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            builder = builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "docrelay-static",
            ));
        }

        Ok(Self::from_client(Client::from_conf(builder.build())))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(local_path = %local_path.display()))]
    async fn upload_file(&self, local_path: &Path, bucket: &str, key: &str) -> Result<()> {
        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            RelayError::Upload(format!("cannot read {}: {}", local_path.display(), e))
        })?;

        debug!("Uploading to s3://{}/{}", bucket, key);

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type_for(key))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                RelayError::Upload(format!(
                    "put s3://{}/{}: {}",
                    bucket,
                    key,
                    aws_sdk_s3::error::DisplayErrorContext(&e)
                ))
            })?;

        info!("Successfully uploaded to s3://{}/{}", bucket, key);
        Ok(())
    }
}

fn content_type_for(key: &str) -> &'static str {
    match Path::new(key).extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => "text/csv",
        Some(ext) if ext.eq_ignore_ascii_case("xlsx") => {
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        },
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_minio_style_config() {
        let config = StorageConfig::from_lookup(lookup(&[
            ("S3_BUCKET", "landing"),
            ("S3_ENDPOINT", "http://localhost:9000"),
            ("S3_PATH_STYLE", "true"),
            ("S3_ACCESS_KEY", "minioadmin"),
            ("S3_SECRET_KEY", "minioadmin"),
        ]))
        .unwrap();

        assert_eq!(config.bucket, "landing");
        assert_eq!(config.prefix, "sharepoint");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.path_style);
        assert_eq!(config.region, None);
    }

    #[test]
    fn test_aws_defaults() {
        let config = StorageConfig::from_lookup(lookup(&[("S3_BUCKET", "landing")])).unwrap();
        assert_eq!(config.endpoint, None);
        assert!(!config.path_style);
        assert_eq!(config.access_key, None);
    }

    #[test]
    fn test_half_static_credentials_rejected() {
        let err = StorageConfig::from_lookup(lookup(&[
            ("S3_BUCKET", "landing"),
            ("S3_ACCESS_KEY", "key-only"),
        ]))
        .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("sharepoint/report.csv"), "text/csv");
        assert_eq!(
            content_type_for("sharepoint/report.XLSX"),
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        );
        assert_eq!(content_type_for("sharepoint/report"), "application/octet-stream");
    }
}

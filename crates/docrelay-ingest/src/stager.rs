//! Stage: normalize the fetched file to CSV and put it in the object store

use docrelay_common::{checksum, RelayError, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info, instrument};

use crate::convert::{self, DELIMITED_EXTENSION, SPREADSHEET_EXTENSION};
use crate::storage::ObjectStore;

/// A file ready for loading, addressed by its object-store path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub local_path: PathBuf,
    pub bucket: String,
    pub object_path: String,
}

/// True when `name` has the spreadsheet container extension
pub fn is_spreadsheet(name: &str) -> bool {
    name.ends_with(&format!(".{}", SPREADSHEET_EXTENSION))
}

/// Replace the spreadsheet extension of `name` with `.csv`
pub fn delimited_name(name: &str) -> String {
    let stem = name
        .strip_suffix(&format!(".{}", SPREADSHEET_EXTENSION))
        .unwrap_or(name);
    format!("{}.{}", stem, DELIMITED_EXTENSION)
}

/// Convert (when needed) and upload `local_path` to `bucket/object_path`
///
/// Returns the artifact actually uploaded. Failures are logged and returned
/// unchanged.
#[instrument(skip(store, local_path), fields(local_path = %local_path.display()))]
pub async fn stage(
    store: &dyn ObjectStore,
    local_path: &Path,
    bucket: &str,
    object_path: &str,
) -> Result<StagedArtifact> {
    let result = async {
        let artifact = prepare(local_path, bucket, object_path).await?;

        let digest = checksum::sha256_file(&artifact.local_path)?;
        info!(sha256 = %digest, "Staging {}", artifact.local_path.display());

        store
            .upload_file(&artifact.local_path, &artifact.bucket, &artifact.object_path)
            .await?;

        info!(
            "Uploaded {} to bucket {} at path: {}",
            artifact.local_path.display(),
            artifact.bucket,
            artifact.object_path
        );
        Ok::<_, RelayError>(artifact)
    }
    .await;

    if let Err(ref e) = result {
        error!(error = %e, "Error uploading file to S3");
    }
    result
}

async fn prepare(local_path: &Path, bucket: &str, object_path: &str) -> Result<StagedArtifact> {
    let file_name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            RelayError::conversion(format!("not a file path: {}", local_path.display()))
        })?;

    if !is_spreadsheet(file_name) {
        return Ok(StagedArtifact {
            local_path: local_path.to_path_buf(),
            bucket: bucket.to_string(),
            object_path: object_path.to_string(),
        });
    }

    let csv_path = local_path.with_file_name(delimited_name(file_name));
    let source = local_path.to_path_buf();
    let target = csv_path.clone();

    let records = tokio::task::spawn_blocking(move || convert::xlsx_to_csv(&source, &target))
        .await
        .map_err(|e| RelayError::conversion(format!("conversion task failed: {}", e)))??;

    info!(records, "Converted to {}", csv_path.display());

    let object_path = if is_spreadsheet(object_path) {
        delimited_name(object_path)
    } else {
        object_path.to_string()
    };

    Ok(StagedArtifact {
        local_path: csv_path,
        bucket: bucket.to_string(),
        object_path,
    })
}

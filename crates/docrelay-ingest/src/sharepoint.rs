//! SharePoint document repository and the fetch stage
//!
//! Authentication uses the app-only (ACS) client-credential flow:
//!
//! 1. an anonymous bearer challenge against `/_vti_bin/client.svc` reveals the
//!    tenant realm in `WWW-Authenticate`
//! 2. the ACS token endpoint exchanges `client_id@realm` + secret for a token
//!    scoped to the SharePoint principal on the site's host
//! 3. the site's web properties are loaded to confirm the token works
//!
//! Files are then read with `GetFileByServerRelativeUrl(...)/$value`.

use async_trait::async_trait;
use docrelay_common::{RelayError, Result};
use reqwest::{header, Client, StatusCode, Url};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use crate::config::TransferJob;
use crate::secrets::SharePointCredentials;

/// Azure ACS endpoint issuing SharePoint app-only tokens.
pub const DEFAULT_ACS_URL: &str = "https://accounts.accesscontrol.windows.net";

/// Well-known principal id of SharePoint Online.
pub const SHAREPOINT_PRINCIPAL: &str = "00000003-0000-0ff1-ce00-000000000000";

/// Client-credential authentication against a document repository
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn authenticate(
        &self,
        site_url: &str,
        credentials: &SharePointCredentials,
    ) -> Result<Box<dyn DocumentSession>>;
}

/// An authenticated repository session
#[async_trait]
pub trait DocumentSession: Send + Sync {
    /// Full content of the file at a server-relative path
    async fn download(&self, remote_path: &str) -> Result<Vec<u8>>;
}

/// SharePoint Online over its REST API
pub struct SharePointClient {
    http: Client,
    acs_url: String,
}

impl SharePointClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_acs_url(timeout, DEFAULT_ACS_URL)
    }

    /// Point token requests at another ACS host (used by tests)
    pub fn with_acs_url(timeout: Duration, acs_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            acs_url: acs_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn discover_realm(&self, site_url: &str) -> Result<String> {
        let url = format!("{}/_vti_bin/client.svc", site_url);
        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, "Bearer")
            .send()
            .await
            .map_err(network)?;

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        parse_realm(challenge).ok_or_else(|| {
            RelayError::Authentication(format!(
                "no realm in authentication challenge from {} (status {})",
                url,
                response.status()
            ))
        })
    }

    async fn request_token(
        &self,
        site_url: &str,
        realm: &str,
        credentials: &SharePointCredentials,
    ) -> Result<AccessToken> {
        let host = Url::parse(site_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| RelayError::config(format!("site URL has no host: {}", site_url)))?;

        let url = format!("{}/{}/tokens/OAuth/2", self.acs_url, realm);
        let client_id = format!("{}@{}", credentials.client_id, realm);
        let resource = format!("{}/{}@{}", SHAREPOINT_PRINCIPAL, host, realm);

        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("resource", resource.as_str()),
            ])
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Authentication(format!(
                "token request rejected ({}): {}",
                status, body
            )));
        }

        let token: AccessToken = response
            .json()
            .await
            .map_err(|e| RelayError::Authentication(format!("malformed token response: {}", e)))?;

        if let Some(expires_at) = token.expires_at() {
            debug!(%expires_at, "Acquired app-only token");
        }

        Ok(token)
    }
}

#[async_trait]
impl DocumentRepository for SharePointClient {
    #[instrument(skip(self, credentials), fields(client_id = %credentials.client_id))]
    async fn authenticate(
        &self,
        site_url: &str,
        credentials: &SharePointCredentials,
    ) -> Result<Box<dyn DocumentSession>> {
        let site_url = site_url.trim_end_matches('/').to_string();

        let realm = self.discover_realm(&site_url).await?;
        debug!(%realm, "Discovered tenant realm");

        let token = self.request_token(&site_url, &realm, credentials).await?;

        let session = SharePointSession {
            http: self.http.clone(),
            site_url,
            access_token: token.access_token,
        };

        let web = session.load_web().await?;
        info!("Site title: {}", web.title);

        Ok(Box::new(session))
    }
}

struct SharePointSession {
    http: Client,
    site_url: String,
    access_token: String,
}

impl SharePointSession {
    async fn load_web(&self) -> Result<WebProperties> {
        let url = format!("{}/_api/web?$select=Title", self.site_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .header(header::ACCEPT, "application/json;odata=nometadata")
            .send()
            .await
            .map_err(network)?;

        let response = check_status(response, &url).await?;
        response
            .json()
            .await
            .map_err(|e| RelayError::Network(format!("malformed web properties: {}", e)))
    }
}

#[async_trait]
impl DocumentSession for SharePointSession {
    async fn download(&self, remote_path: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/_api/web/GetFileByServerRelativeUrl('{}')/$value",
            self.site_url,
            odata_path_literal(remote_path)
        );
        debug!(%url, "Downloading file");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(network)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RelayError::RemoteFileNotFound(remote_path.to_string()));
        }

        let response = check_status(response, &url).await?;
        let bytes = response.bytes().await.map_err(network)?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
    /// ACS sends this as a string, Entra ID as a number
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl AccessToken {
    fn expires_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let seconds = match self.expires_in.as_ref()? {
            serde_json::Value::Number(n) => n.as_i64()?,
            serde_json::Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(chrono::Utc::now() + chrono::Duration::try_seconds(seconds)?)
    }
}

#[derive(Debug, Deserialize)]
struct WebProperties {
    #[serde(rename = "Title")]
    title: String,
}

async fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RelayError::Authentication(
            format!("{} returned {}: {}", url, status, body),
        )),
        _ => Err(RelayError::Network(format!("{} returned {}: {}", url, status, body))),
    }
}

fn network(err: reqwest::Error) -> RelayError {
    RelayError::Network(err.to_string())
}

/// Extract `realm="..."` from a bearer challenge
fn parse_realm(challenge: &str) -> Option<String> {
    let start = challenge.find("realm=\"")? + "realm=\"".len();
    let rest = &challenge[start..];
    let end = rest.find('"')?;
    let realm = &rest[..end];
    (!realm.is_empty()).then(|| realm.to_string())
}

/// Quote a server-relative path for use inside an OData string literal
fn odata_path_literal(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '\'' => out.push_str("''"),
            '%' => out.push_str("%25"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            _ => out.push(c),
        }
    }
    out
}

/// Fetch stage: download `job.remote_path` into `job.local_path`
///
/// Returns the local path. Failures are logged and returned unchanged.
#[instrument(
    skip(repository, credentials, job),
    fields(site = %job.site_url, remote_path = %job.remote_path)
)]
pub async fn fetch_file(
    repository: &dyn DocumentRepository,
    job: &TransferJob,
    credentials: &SharePointCredentials,
) -> Result<PathBuf> {
    let result = async {
        let session = repository.authenticate(&job.site_url, credentials).await?;
        let content = session.download(&job.remote_path).await?;

        if let Some(parent) = job.local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&job.local_path, &content).await?;

        info!(
            bytes = content.len(),
            "Your file is downloaded to: {}",
            job.local_path.display()
        );
        Ok::<_, RelayError>(job.local_path.clone())
    }
    .await;

    if let Err(ref e) = result {
        error!(error = %e, "Failed to fetch file from SharePoint");
    }
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_realm() {
        let challenge = r#"Bearer realm="a1b2c3d4-0000-1111-2222-333344445555",client_id="00000003-0000-0ff1-ce00-000000000000",trusted_issuers="00000001-0000-0000-c000-000000000000@*""#;
        assert_eq!(
            parse_realm(challenge).as_deref(),
            Some("a1b2c3d4-0000-1111-2222-333344445555")
        );
    }

    #[test]
    fn test_parse_realm_missing() {
        assert_eq!(parse_realm(""), None);
        assert_eq!(parse_realm("Bearer realm=\"\""), None);
        assert_eq!(parse_realm("NTLM"), None);
    }

    #[test]
    fn test_odata_path_literal() {
        assert_eq!(
            odata_path_literal("/sites/mkt/Shared Documents/Q1 O'Brien #2.xlsx"),
            "/sites/mkt/Shared Documents/Q1 O''Brien %232.xlsx"
        );
    }

    #[test]
    fn test_token_expiry_forms() {
        let as_string: AccessToken =
            serde_json::from_str(r#"{"access_token": "t", "expires_in": "3600"}"#).unwrap();
        let as_number: AccessToken =
            serde_json::from_str(r#"{"access_token": "t", "expires_in": 3600}"#).unwrap();
        let absent: AccessToken = serde_json::from_str(r#"{"access_token": "t"}"#).unwrap();

        assert!(as_string.expires_at().is_some());
        assert!(as_number.expires_at().is_some());
        assert!(absent.expires_at().is_none());
    }
}

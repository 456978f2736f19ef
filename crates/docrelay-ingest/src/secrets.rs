//! Secret lookup
//!
//! A [`SecretStore`] turns a secret name into a field map. Typed credential
//! records are parsed from that map at the boundary so a missing field fails
//! the run before any remote call is made.

use async_trait::async_trait;
use aws_sdk_secretsmanager::Client;
use docrelay_common::{RelayError, Result};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, instrument};

/// Flat field map stored under one secret name
pub type SecretFields = HashMap<String, String>;

/// Named secret lookup
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fails when the name is unknown or inaccessible
    async fn get(&self, name: &str) -> Result<SecretFields>;
}

/// [`SecretStore`] backed by AWS Secrets Manager JSON secrets
#[derive(Clone)]
pub struct AwsSecretStore {
    client: Client,
}

impl AwsSecretStore {
    pub async fn from_env() -> Self {
        let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::from_client(Client::new(&shared))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for AwsSecretStore {
    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<SecretFields> {
        let response = self
            .client
            .get_secret_value()
            .secret_id(name)
            .send()
            .await
            .map_err(|e| {
                RelayError::Secret(format!(
                    "cannot read secret '{}': {}",
                    name,
                    aws_sdk_secretsmanager::error::DisplayErrorContext(&e)
                ))
            })?;

        let payload = response
            .secret_string()
            .ok_or_else(|| RelayError::Secret(format!("secret '{}' has no string value", name)))?;

        let fields = parse_secret_string(name, payload)?;
        debug!(field_count = fields.len(), "Resolved secret");
        Ok(fields)
    }
}

/// Parse a JSON object secret into string fields
///
/// Non-string scalars are kept in their JSON text form so numeric account
/// ids and booleans survive.
pub fn parse_secret_string(name: &str, payload: &str) -> Result<SecretFields> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| RelayError::Secret(format!("secret '{}' is not valid JSON: {}", name, e)))?;

    let serde_json::Value::Object(map) = value else {
        return Err(RelayError::Secret(format!("secret '{}' is not a JSON object", name)));
    };

    Ok(map
        .into_iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(s) => Some((key, s)),
            serde_json::Value::Null => None,
            other => Some((key, other.to_string())),
        })
        .collect())
}

fn take_field(fields: &mut SecretFields, secret: &str, key: &str) -> Result<String> {
    fields
        .remove(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RelayError::Secret(format!("secret '{}' is missing field '{}'", secret, key)))
}

/// SharePoint app registration (client-credential grant)
#[derive(Clone, PartialEq, Eq)]
pub struct SharePointCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl SharePointCredentials {
    pub fn from_fields(secret: &str, mut fields: SecretFields) -> Result<Self> {
        Ok(Self {
            client_id: take_field(&mut fields, secret, "client_id")?,
            client_secret: take_field(&mut fields, secret, "client_secret")?,
        })
    }
}

impl fmt::Debug for SharePointCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharePointCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Default token type sent with Snowflake SQL API requests.
pub const DEFAULT_SNOWFLAKE_TOKEN_TYPE: &str = "PROGRAMMATIC_ACCESS_TOKEN";

/// Snowflake SQL API access
#[derive(Clone, PartialEq, Eq)]
pub struct WarehouseCredentials {
    /// Account identifier, e.g. `myorg-myaccount`
    pub account: String,
    pub token: String,
    /// Value of `X-Snowflake-Authorization-Token-Type`
    pub token_type: String,
    pub role: Option<String>,
}

impl WarehouseCredentials {
    pub fn from_fields(secret: &str, mut fields: SecretFields) -> Result<Self> {
        Ok(Self {
            account: take_field(&mut fields, secret, "account")?,
            token: take_field(&mut fields, secret, "token")?,
            token_type: fields
                .remove("token_type")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_SNOWFLAKE_TOKEN_TYPE.to_string()),
            role: fields.remove("role").filter(|v| !v.is_empty()),
        })
    }
}

impl fmt::Debug for WarehouseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseCredentials")
            .field("account", &self.account)
            .field("token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("role", &self.role)
            .finish()
    }
}

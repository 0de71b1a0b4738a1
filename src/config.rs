//! Credentials loading and validation.
//!
//! One `Credentials` value is built at startup and passed by reference into
//! every client and the notifier; nothing here is process-global. A missing
//! or empty required field fails the run before any network call.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

/// All secrets and endpoints for one run.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub clf: ClfCredentials,
    pub shopify: ShopifyCredentials,
    pub sendgrid: SendGridCredentials,
}

/// CLF WebOrdering SOAP endpoint and account.
#[derive(Debug, Clone, Deserialize)]
pub struct ClfCredentials {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

/// Shopify Admin API access for one store and location.
#[derive(Debug, Clone, Deserialize)]
pub struct ShopifyCredentials {
    /// Store hostname, e.g. `example.myshopify.com`.
    pub shop_url: String,
    pub access_token: String,
    pub location_id: u64,
}

/// SendGrid key and notification addresses.
#[derive(Debug, Clone, Deserialize)]
pub struct SendGridCredentials {
    pub api_key: String,
    pub from_email: String,
    pub to_emails: Vec<String>,
}

impl Credentials {
    /// Load and validate the credentials file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let credentials: Credentials =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
                path: path.display().to_string(),
                source,
            })?;
        credentials.validate()?;
        Ok(credentials)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require(&self.clf.base_url, "clf.base_url")?;
        require(&self.clf.username, "clf.username")?;
        require(&self.clf.password, "clf.password")?;
        require(&self.shopify.shop_url, "shopify.shop_url")?;
        require(&self.shopify.access_token, "shopify.access_token")?;
        require(&self.sendgrid.api_key, "sendgrid.api_key")?;
        require(&self.sendgrid.from_email, "sendgrid.from_email")?;
        if self
            .sendgrid
            .to_emails
            .iter()
            .all(|addr| addr.trim().is_empty())
        {
            return Err(ConfigError::MissingField("sendgrid.to_emails"));
        }
        Ok(())
    }
}

fn require(value: &str, field: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(field));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample(clf_username: &str, to_emails: &str) -> String {
        format!(
            r#"{{
                "clf": {{
                    "base_url": "https://services.example.com/ordering.asmx",
                    "username": "{clf_username}",
                    "password": "secret"
                }},
                "shopify": {{
                    "shop_url": "example.myshopify.com",
                    "access_token": "shpat_test",
                    "location_id": 123456
                }},
                "sendgrid": {{
                    "api_key": "SG.test",
                    "from_email": "sync@example.com",
                    "to_emails": [{to_emails}]
                }}
            }}"#
        )
    }

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write temp file");
        file
    }

    #[test]
    fn loads_a_complete_credentials_file() {
        let file = write_temp(&sample("clf-user", "\"ops@example.com\""));
        let credentials = Credentials::load(file.path()).expect("load credentials");
        assert_eq!(credentials.clf.username, "clf-user");
        assert_eq!(credentials.shopify.location_id, 123456);
        assert_eq!(credentials.sendgrid.to_emails.len(), 1);
    }

    #[test]
    fn empty_required_field_is_named_in_the_error() {
        let file = write_temp(&sample("", "\"ops@example.com\""));
        let err = Credentials::load(file.path()).expect_err("empty username");
        assert!(err.to_string().contains("clf.username"));
    }

    #[test]
    fn no_notification_addresses_is_rejected() {
        let file = write_temp(&sample("clf-user", ""));
        let err = Credentials::load(file.path()).expect_err("no recipients");
        assert!(err.to_string().contains("sendgrid.to_emails"));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let file = write_temp("{ not json");
        let err = Credentials::load(file.path()).expect_err("malformed json");
        assert!(err.to_string().contains("parse credentials file"));
    }
}

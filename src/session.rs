//! Long-lived session shared by every component of a run.

use anyhow::{Context, Result};
use aws_sdk_s3 as s3;
use s3::config::Region;
use std::env;
use std::time::Duration;
use tracing::info;

use crate::config::AppConfig;

/// HTTP client for the source API. `request_timeout` bounds the whole
/// exchange, body included, so a stalled transfer surfaces as a network error.
pub fn build_http_client(connect_timeout: Duration, request_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("drivemirror/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Built once at startup and handed out by reference; nothing re-authenticates
/// mid-run.
pub struct Session {
    pub http: reqwest::Client,
    access_token: String,
    pub aws: aws_config::SdkConfig,
}

impl Session {
    pub async fn establish(app_config: &AppConfig) -> Result<Self> {
        let token_env = &app_config.source.access_token_env;
        let access_token = env::var(token_env)
            .with_context(|| format!("{} must be set to a source API access token", token_env))?;
        if access_token.trim().is_empty() {
            anyhow::bail!("{} is set but empty", token_env);
        }

        let source = &app_config.source;
        let http = build_http_client(source.connect_timeout, source.request_timeout)?;

        let spaces = &app_config.spaces_config;
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
        if let Some(region) = &spaces.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some((key_id, secret)) = &spaces.static_credentials {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id, secret, None, // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let aws = loader.load().await;

        info!(
            region = ?aws.region().map(|r| r.as_ref().to_string()),
            static_credentials = spaces.static_credentials.is_some(),
            "Session established"
        );

        Ok(Session {
            http,
            access_token: access_token.trim().to_string(),
            aws,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

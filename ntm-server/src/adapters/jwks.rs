use crate::ports::jwks::JwksSource;
use crate::ports::AdapterError;
use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use std::time::Duration;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpJwksSource {
    url: String,
    client: reqwest::Client,
}

impl HttpJwksSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<JwkSet, AdapterError> {
        let response = self.client.get(&self.url).send().await.map_err(|err| {
            if err.is_timeout() {
                AdapterError::Timeout(format!("fetching JWKS from {}", self.url))
            } else {
                AdapterError::Unavailable(format!("fetching JWKS from {}: {err}", self.url))
            }
        })?;
        if !response.status().is_success() {
            return Err(AdapterError::Unavailable(format!(
                "JWKS endpoint {} returned {}",
                self.url,
                response.status()
            )));
        }
        response
            .json::<JwkSet>()
            .await
            .map_err(|err| AdapterError::Failed(format!("invalid JWKS document: {err}")))
    }
}

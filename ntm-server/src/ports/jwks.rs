use super::AdapterError;
use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;

#[async_trait]
pub trait JwksSource: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, AdapterError>;
}

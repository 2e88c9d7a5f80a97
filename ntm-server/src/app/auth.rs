use crate::config::{ApiKeyBinding, AuthSettings, OidcSettings};
use crate::domain::rbac::{AuthMode, Identity, Role};
use crate::ports::jwks::JwksSource;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication required")]
    Missing,
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("no signing key matches the token")]
    KidNotFound,
    #[error("identity provider unavailable: {0}")]
    Jwks(String),
}

impl AuthError {
    /// Whether the failure is on our side rather than the caller's.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, AuthError::Jwks(_))
    }
}

/// What a request presented.
#[derive(Clone, Copy, Debug, Default)]
pub struct Credentials<'a> {
    pub peer: Option<IpAddr>,
    pub api_key: Option<&'a str>,
    pub bearer: Option<&'a str>,
}

pub struct Authenticator {
    settings: AuthSettings,
    oidc: Option<OidcVerifier>,
}

impl Authenticator {
    pub fn new(settings: AuthSettings, jwks: Option<Arc<dyn JwksSource>>) -> Self {
        let oidc = match (settings.oidc.clone(), jwks) {
            (Some(config), Some(source)) => Some(OidcVerifier::new(config, source)),
            _ => None,
        };
        Self { settings, oidc }
    }

    pub fn mode(&self) -> AuthMode {
        self.settings.mode
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    pub async fn authenticate(&self, creds: Credentials<'_>) -> Result<Identity, AuthError> {
        if self.settings.mode == AuthMode::Local {
            if let Some(peer) = creds.peer {
                if self.settings.is_loopback(peer) {
                    return Ok(Identity::local_admin());
                }
            }
        }

        if let Some(key) = creds.api_key.filter(|key| !key.is_empty()) {
            return match match_api_key(&self.settings.api_keys, key) {
                Some(binding) => Ok(Identity::new(
                    binding.user.clone(),
                    binding.role.clone(),
                    AuthMode::ApiKey,
                )),
                None => Err(AuthError::InvalidApiKey),
            };
        }

        if let (Some(token), Some(oidc)) = (creds.bearer, &self.oidc) {
            return oidc.verify(token).await;
        }

        Err(AuthError::Missing)
    }
}

/// Compares against every binding so timing does not reveal which one matched.
fn match_api_key<'a>(bindings: &'a [ApiKeyBinding], presented: &str) -> Option<&'a ApiKeyBinding> {
    let mut found = None;
    for binding in bindings {
        let equal: bool = binding.key.as_bytes().ct_eq(presented.as_bytes()).into();
        if equal && found.is_none() {
            found = Some(binding);
        }
    }
    found
}

struct CachedKeys {
    fetched_at: Instant,
    keys: Arc<JwkSet>,
}

/// JWKS documents fetched on demand and kept for `ttl`; an unknown `kid`
/// forces one refetch.
pub struct JwksCache {
    source: Arc<dyn JwksSource>,
    ttl: Duration,
    cached: RwLock<Option<CachedKeys>>,
}

impl JwksCache {
    pub fn new(source: Arc<dyn JwksSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cached: RwLock::new(None),
        }
    }

    fn fresh(&self) -> Option<Arc<JwkSet>> {
        let guard = self.cached.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.keys.clone())
    }

    async fn refresh(&self) -> Result<Arc<JwkSet>, AuthError> {
        let keys = Arc::new(
            self.source
                .fetch()
                .await
                .map_err(|err| AuthError::Jwks(err.to_string()))?,
        );
        debug!(keys = keys.keys.len(), "refreshed JWKS");
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(CachedKeys {
            fetched_at: Instant::now(),
            keys: keys.clone(),
        });
        Ok(keys)
    }

    pub async fn key(&self, kid: Option<&str>) -> Result<Jwk, AuthError> {
        if let Some(keys) = self.fresh() {
            if let Some(jwk) = select_key(&keys, kid) {
                return Ok(jwk);
            }
        }
        let keys = self.refresh().await?;
        select_key(&keys, kid).ok_or(AuthError::KidNotFound)
    }
}

fn select_key(keys: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid.filter(|kid| !kid.is_empty()) {
        Some(kid) => keys.find(kid).cloned(),
        None if keys.keys.len() == 1 => keys.keys.first().cloned(),
        None => None,
    }
}

struct OidcVerifier {
    config: OidcSettings,
    keys: JwksCache,
}

impl OidcVerifier {
    fn new(config: OidcSettings, source: Arc<dyn JwksSource>) -> Self {
        let keys = JwksCache::new(source, config.jwks_ttl);
        Self { config, keys }
    }

    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.split('.').count() != 3 || token.split('.').any(str::is_empty) {
            return Err(AuthError::InvalidToken("malformed token".into()));
        }
        let header = decode_header(token).map_err(|err| AuthError::InvalidToken(err.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidToken(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }

        let jwk = self.keys.key(header.kid.as_deref()).await?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|err| AuthError::InvalidToken(err.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        match &self.config.audience {
            Some(audience) => validation.set_audience(&[audience.as_str()]),
            None => validation.validate_aud = false,
        }
        validation.validate_nbf = true;
        validation.leeway = 0;

        let data = decode::<Map<String, Value>>(token, &key, &validation).map_err(|err| {
            warn!(error = %err, "rejected bearer token");
            AuthError::InvalidToken(err.to_string())
        })?;
        let claims = data.claims;

        let now = chrono::Utc::now().timestamp();
        match claims.get("exp").and_then(Value::as_i64) {
            Some(exp) if exp > now => {}
            _ => return Err(AuthError::InvalidToken("token expired".into())),
        }

        let user = claims
            .get(&self.config.user_claim)
            .and_then(Value::as_str)
            .filter(|user| !user.is_empty())
            .ok_or_else(|| {
                AuthError::InvalidToken(format!("missing '{}' claim", self.config.user_claim))
            })?
            .to_string();
        let role = role_from_claim(claims.get(&self.config.role_claim), &self.config.default_role);
        Ok(Identity::new(user, role, AuthMode::Oidc).with_claims(claims))
    }
}

/// A string names one role; an array grants the highest role it lists.
fn role_from_claim(claim: Option<&Value>, default: &Role) -> Role {
    match claim {
        Some(Value::String(name)) if !name.trim().is_empty() => Role::parse(name),
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(Value::as_str)
            .map(Role::parse)
            .max_by_key(Role::rank)
            .unwrap_or_else(|| default.clone()),
        _ => default.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::AdapterError;
    use async_trait::async_trait;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ISSUER: &str = "https://id.example.test";
    const KID: &str = "test-key";
    const MODULUS: &str = "8LvsM4cgcZCmm0VXiNFs2KH1zv5ylMqf42C7CNqrEl4WlsUW7Qr5yBBzuzEU7IuxiJlpprGypQO2TWF8BDNuIqjEJ_kS0G3gPNmJsApYQyx1SN8sZj-JqRrytQK-Cp3UaIECoD8cL-71ZWwBPi2twmT-NbKULMimYo_b_G3FPZ-3SiAL5hOgS3-lWurmVjdoDpg0bysFpo43XjaEU5DSNB8oJcHbOuEue-f9MG1-7saSYrjq4gll5NZax6gbqM8KiknW8gsTXjUwtuCV3bAIzCXZoMVEhwo5ARkzNDJTzIZch71_GtEeo7WyZo155mUt9LgevH271QFau_RVH9IF3Q";

    struct StaticJwks {
        fetches: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JwksSource for StaticJwks {
        async fn fetch(&self) -> Result<JwkSet, AdapterError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AdapterError::Unavailable("idp down".into()));
            }
            Ok(serde_json::from_value(json!({
                "keys": [{"kty": "RSA", "kid": KID, "alg": "RS256", "use": "sig", "n": MODULUS, "e": "AQAB"}]
            }))
            .unwrap())
        }
    }

    fn signing_key() -> EncodingKey {
        EncodingKey::from_rsa_pem(include_bytes!("../../tests/fixtures/oidc_rsa.pem")).unwrap()
    }

    fn token(claims: Value, kid: Option<&str>) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_string);
        encode(&header, &claims, &signing_key()).unwrap()
    }

    fn oidc_auth(fail: bool) -> (Authenticator, Arc<StaticJwks>) {
        let source = Arc::new(StaticJwks {
            fetches: AtomicUsize::new(0),
            fail,
        });
        let settings = AuthSettings {
            mode: AuthMode::Oidc,
            oidc: Some(OidcSettings {
                issuer: ISSUER.into(),
                audience: Some("ntm".into()),
                jwks_url: "https://id.example.test/jwks".into(),
                ..OidcSettings::default()
            }),
            ..AuthSettings::default()
        };
        (Authenticator::new(settings, Some(source.clone())), source)
    }

    fn bearer(token: &str) -> Credentials<'_> {
        Credentials {
            peer: Some("10.1.2.3".parse().unwrap()),
            api_key: None,
            bearer: Some(token),
        }
    }

    fn claims(extra: Value) -> Value {
        let now = chrono::Utc::now().timestamp();
        let mut base = json!({"sub": "carol", "iss": ISSUER, "aud": "ntm", "iat": now, "exp": now + 300});
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        base
    }

    #[tokio::test]
    async fn local_mode_trusts_loopback_only() {
        let auth = Authenticator::new(AuthSettings::default(), None);
        let local = auth
            .authenticate(Credentials {
                peer: Some("127.0.0.1".parse().unwrap()),
                ..Credentials::default()
            })
            .await
            .unwrap();
        assert_eq!(local.role, Role::Admin);

        let remote = auth
            .authenticate(Credentials {
                peer: Some("192.168.1.9".parse().unwrap()),
                ..Credentials::default()
            })
            .await;
        assert_eq!(remote.unwrap_err(), AuthError::Missing);
    }

    #[tokio::test]
    async fn api_keys_resolve_bound_identity() {
        let settings = AuthSettings {
            mode: AuthMode::ApiKey,
            api_keys: vec![
                "alice-key=alice:operator".parse().unwrap(),
                "bob-key=bob:admin".parse().unwrap(),
            ],
            ..AuthSettings::default()
        };
        let auth = Authenticator::new(settings, None);
        let creds = |key| Credentials {
            peer: Some("127.0.0.1".parse().unwrap()),
            api_key: Some(key),
            bearer: None,
        };

        let bob = auth.authenticate(creds("bob-key")).await.unwrap();
        assert_eq!((bob.user_id.as_str(), bob.role), ("bob", Role::Admin));
        assert_eq!(bob.auth_mode, AuthMode::ApiKey);
        assert_eq!(
            auth.authenticate(creds("bob-kex")).await.unwrap_err(),
            AuthError::InvalidApiKey
        );
        assert_eq!(
            auth.authenticate(Credentials::default()).await.unwrap_err(),
            AuthError::Missing
        );
    }

    #[tokio::test]
    async fn valid_token_maps_claims() {
        let (auth, source) = oidc_auth(false);
        let jwt = token(claims(json!({"role": ["viewer", "operator"]})), Some(KID));
        let identity = auth.authenticate(bearer(&jwt)).await.unwrap();
        assert_eq!(identity.user_id, "carol");
        assert_eq!(identity.role, Role::Operator);
        assert_eq!(identity.auth_mode, AuthMode::Oidc);
        assert!(identity.claims.is_some());

        auth.authenticate(bearer(&jwt)).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_role_claim_falls_back_to_default() {
        let (auth, _) = oidc_auth(false);
        let jwt = token(claims(json!({})), None);
        let identity = auth.authenticate(bearer(&jwt)).await.unwrap();
        assert_eq!(identity.role, Role::Viewer);
    }

    #[tokio::test]
    async fn rejects_bad_tokens() {
        let (auth, _) = oidc_auth(false);
        let now = chrono::Utc::now().timestamp();

        let expired = token(claims(json!({"exp": now - 1})), Some(KID));
        let wrong_issuer = token(claims(json!({"iss": "https://evil.test"})), Some(KID));
        let wrong_audience = token(claims(json!({"aud": "other"})), Some(KID));
        let not_yet = token(claims(json!({"nbf": now + 600})), Some(KID));
        for jwt in [expired, wrong_issuer, wrong_audience, not_yet] {
            assert!(matches!(
                auth.authenticate(bearer(&jwt)).await,
                Err(AuthError::InvalidToken(_))
            ));
        }

        assert!(matches!(
            auth.authenticate(bearer("not-a-token")).await,
            Err(AuthError::InvalidToken(_))
        ));
        let unknown_kid = token(claims(json!({})), Some("rotated"));
        assert_eq!(
            auth.authenticate(bearer(&unknown_kid)).await.unwrap_err(),
            AuthError::KidNotFound
        );
    }

    #[tokio::test]
    async fn unreachable_idp_is_unavailable() {
        let (auth, _) = oidc_auth(true);
        let jwt = token(claims(json!({})), Some(KID));
        let err = auth.authenticate(bearer(&jwt)).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn role_claim_shapes() {
        let default = Role::Viewer;
        assert_eq!(role_from_claim(Some(&json!("admin")), &default), Role::Admin);
        assert_eq!(role_from_claim(Some(&json!([])), &default), Role::Viewer);
        assert_eq!(role_from_claim(Some(&json!("")), &default), Role::Viewer);
        assert_eq!(role_from_claim(None, &default), Role::Viewer);
        assert!(!role_from_claim(Some(&json!("root")), &default).is_known());
    }
}

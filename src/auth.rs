//! Principal resolution: bearer JWTs and opaque API keys.
//!
//! Every context is namespaced by the resolved user id, so this is the only
//! trust boundary in the service. Two credential forms are accepted on the
//! `Authorization` header: an HS256 JWT carrying the user id in `sub`, or an
//! opaque API key looked up in the metadata store under the `apikey:` prefix.

use std::sync::Arc;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ContextError, Result};
use crate::keys;
use crate::metadata::MetadataIndex;

/// JWT claims carried by bearer tokens. `exp` is optional but enforced when
/// present.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id the token authenticates
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

/// Resolves an inbound credential to a user id.
pub struct PrincipalResolver {
    index: Arc<dyn MetadataIndex>,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl PrincipalResolver {
    pub fn new(index: Arc<dyn MetadataIndex>, jwt_secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens without `exp` are accepted; expired ones are not
        validation.required_spec_claims.clear();
        Self {
            index,
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            validation,
        }
    }

    /// Resolve the `Authorization` header value to a user id.
    ///
    /// No header fails with `Missing authorization`; a present but
    /// unverifiable credential fails with `Invalid token`. Metadata-store
    /// failures during API key lookup surface as storage errors rather than
    /// auth failures.
    pub async fn resolve(&self, authorization: Option<&str>) -> Result<String> {
        let header = authorization
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ContextError::Auth("Missing authorization".to_string()))?;

        let token = extract_token(header);

        // Three dot-separated parts means a JWT; anything else is an API key
        if token.split('.').count() == 3 {
            self.resolve_jwt(token)
        } else {
            self.resolve_api_key(token).await
        }
    }

    fn resolve_jwt(&self, token: &str) -> Result<String> {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) if !data.claims.sub.is_empty() => Ok(data.claims.sub),
            Ok(_) => Err(ContextError::Auth("Invalid token".to_string())),
            Err(e) => {
                debug!(error = %e, "JWT validation failed");
                Err(ContextError::Auth("Invalid token".to_string()))
            }
        }
    }

    async fn resolve_api_key(&self, token: &str) -> Result<String> {
        let lookup = keys::api_key_lookup(token);
        match self.index.get(&lookup).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|_| ContextError::Auth("Invalid token".to_string())),
            None => Err(ContextError::Auth("Invalid token".to_string())),
        }
    }
}

/// Strip an optional `Bearer ` scheme prefix.
fn extract_token(header: &str) -> &str {
    header.strip_prefix("Bearer ").unwrap_or(header).trim()
}

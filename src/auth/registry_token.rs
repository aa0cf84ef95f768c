//! Bearer tokens for the container registry protocol
//!
//! Tokens are compact JWTs signed with HMAC-SHA256 using this server's own
//! key. The listener issues them from `/v2/token` after deciding which of
//! the requested scopes the caller is entitled to.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::ContainerConfig;
use crate::error::AuthError;

use super::token::random_b64;

type HmacSha256 = Hmac<Sha256>;

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Requested access, e.g. `repository:library/alpine:pull,push`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub actions: Vec<String>,
}

impl Scope {
    /// Parse the `type:name:actions` form; the name may itself contain `:`
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let (resource_type, rest) = raw.split_once(':').ok_or(AuthError::InvalidToken)?;
        let (name, actions) = rest.rsplit_once(':').ok_or(AuthError::InvalidToken)?;
        if resource_type.is_empty() || name.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            actions: actions
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect(),
        })
    }

    /// Repository scope for an image name
    pub fn repository(name: impl Into<String>, actions: &[&str]) -> Self {
        Self {
            resource_type: "repository".to_string(),
            name: name.into(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Same scope narrowed to the given actions
    pub fn restrict(&self, allowed: impl Fn(&str) -> bool) -> Self {
        Self {
            actions: self.actions.iter().filter(|a| allowed(a)).cloned().collect(),
            ..self.clone()
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.resource_type, self.name, self.actions.join(","))
    }
}

/// Signed claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(default)]
    pub access: Vec<Scope>,
}

impl RegistryClaims {
    /// Whether the token grants `action` on repository `name`
    pub fn allows(&self, name: &str, action: &str) -> bool {
        self.access.iter().any(|scope| {
            scope.resource_type == "repository"
                && (scope.name == name || scope.name == "*")
                && scope.actions.iter().any(|a| a == action || a == "*")
        })
    }
}

/// Token response body of `/v2/token`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    pub access_token: String,
    pub expires_in: u64,
    pub issued_at: String,
}

/// Signs and verifies registry bearer tokens
pub struct RegistryTokenIssuer {
    key: Vec<u8>,
    issuer: String,
    ttl_secs: u64,
}

impl RegistryTokenIssuer {
    pub fn new(key: impl Into<Vec<u8>>, issuer: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            key: key.into(),
            issuer: issuer.into(),
            ttl_secs,
        }
    }

    /// Build from configuration, generating a process-local key when none is set
    pub fn from_config(config: &ContainerConfig) -> Self {
        let key = match &config.signing_key {
            Some(key) if !key.is_empty() => key.clone().into_bytes(),
            _ => {
                tracing::warn!(
                    "No container signing key configured; tokens will not survive a restart"
                );
                random_b64(32).into_bytes()
            }
        };
        Self::new(key, config.service_name.clone(), config.token_ttl_secs)
    }

    /// Issue a token for `principal` carrying the granted scopes
    pub fn issue(
        &self,
        principal: &str,
        audience: &str,
        scopes: Vec<Scope>,
    ) -> Result<IssuedToken, AuthError> {
        let now = Utc::now();
        let claims = RegistryClaims {
            iss: self.issuer.clone(),
            sub: principal.to_string(),
            aud: audience.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + self.ttl_secs as i64,
            jti: uuid::Uuid::new_v4().to_string(),
            access: scopes,
        };

        let payload =
            serde_json::to_vec(&claims).map_err(|e| AuthError::Signing(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes())?);
        let token = format!("{}.{}", signing_input, signature);

        Ok(IssuedToken {
            access_token: token.clone(),
            token,
            expires_in: self.ttl_secs,
            issued_at: now.to_rfc3339(),
        })
    }

    /// Verify signature, audience and expiry
    pub fn verify(&self, token: &str, audience: &str) -> Result<RegistryClaims, AuthError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::InvalidToken);
        };

        let expected = self.sign(format!("{}.{}", header, payload).as_bytes())?;
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::InvalidToken)?;
        if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(AuthError::InvalidToken);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::InvalidToken)?;
        let claims: RegistryClaims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::InvalidToken)?;

        if claims.aud != audience || claims.exp < Utc::now().timestamp() {
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    /// Whether a bearer value is shaped like one of our JWTs
    pub fn looks_like_jwt(token: &str) -> bool {
        token.matches('.').count() == 2
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|e| AuthError::Signing(e.to_string()))?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> RegistryTokenIssuer {
        RegistryTokenIssuer::new(b"test-key".to_vec(), "artifact-depot", 300)
    }

    // Test 1: scope parsing handles names with colons
    #[test]
    fn test_scope_parse() {
        let scope = Scope::parse("repository:library/alpine:pull,push").unwrap();
        assert_eq!(scope.resource_type, "repository");
        assert_eq!(scope.name, "library/alpine");
        assert_eq!(scope.actions, vec!["pull", "push"]);

        let ported = Scope::parse("repository:host:5000/app:pull").unwrap();
        assert_eq!(ported.name, "host:5000/app");

        assert!(Scope::parse("repository").is_err());
        assert_eq!(scope.to_string(), "repository:library/alpine:pull,push");
    }

    // Test 2: issued tokens verify and carry access
    #[test]
    fn test_issue_and_verify() {
        let issuer = issuer();
        let issued = issuer
            .issue("dev", "registry", vec![Scope::repository("app", &["pull"])])
            .unwrap();
        assert_eq!(issued.expires_in, 300);
        assert!(RegistryTokenIssuer::looks_like_jwt(&issued.token));

        let claims = issuer.verify(&issued.token, "registry").unwrap();
        assert_eq!(claims.sub, "dev");
        assert!(claims.allows("app", "pull"));
        assert!(!claims.allows("app", "push"));
        assert!(!claims.allows("other", "pull"));
    }

    // Test 3: wrong audience, wrong key and tampering are rejected
    #[test]
    fn test_verify_rejects() {
        let issued = issuer().issue("dev", "registry", vec![]).unwrap();

        assert!(issuer().verify(&issued.token, "elsewhere").is_err());

        let other = RegistryTokenIssuer::new(b"other-key".to_vec(), "artifact-depot", 300);
        assert!(other.verify(&issued.token, "registry").is_err());

        let mut tampered = issued.token.clone();
        tampered.insert(tampered.find('.').unwrap() + 1, 'x');
        assert!(issuer().verify(&tampered, "registry").is_err());

        assert!(issuer().verify("not-a-jwt", "registry").is_err());
    }

    // Test 4: expired tokens are rejected
    #[test]
    fn test_expired() {
        let short = RegistryTokenIssuer::new(b"k".to_vec(), "i", 0);
        let past = RegistryClaims {
            iss: "i".to_string(),
            sub: "dev".to_string(),
            aud: "registry".to_string(),
            iat: 0,
            exp: 1,
            jti: "j".to_string(),
            access: vec![],
        };
        let input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&past).unwrap())
        );
        let sig = URL_SAFE_NO_PAD.encode(short.sign(input.as_bytes()).unwrap());
        let claims_token = format!("{}.{}", input, sig);

        assert!(short.verify(&claims_token, "registry").is_err());
    }

    // Test 5: restrict drops actions that were not granted
    #[test]
    fn test_restrict() {
        let scope = Scope::repository("app", &["pull", "push"]);
        let narrowed = scope.restrict(|a| a == "pull");
        assert_eq!(narrowed.actions, vec!["pull"]);
    }
}

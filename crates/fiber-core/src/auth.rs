//! Bearer-token verification for the ingest tier.
//!
//! Two credential kinds are accepted on every write endpoint:
//!
//! * an HS256 JWT issued by the central authority: subject becomes the
//!   actor identity, an optional `region` claim scopes the token to one
//!   ingest region;
//! * the federation shared secret carried verbatim as the bearer token;
//!   this is how relays (and probes during a regional outage) authenticate
//!   against central without a per-identity token.
//!
//! Token material never reaches a log line; errors carry only the failure
//! class.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("token rejected")]
    Invalid,

    #[error("token region {token} does not match declared region {declared}")]
    RegionMismatch { token: String, declared: String },

    #[error("no credential backend configured")]
    Unconfigured,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub subject: String,
    pub region: Option<String>,
    /// True when authenticated via the federation shared secret.
    pub federation: bool,
}

/// Verifies bearer credentials against the JWT secret and/or the
/// federation shared secret.
pub struct TokenVerifier {
    jwt_key: Option<DecodingKey>,
    federation_digest: Option<[u8; 32]>,
}

fn digest(value: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(value.as_bytes()));
    out
}

impl TokenVerifier {
    pub fn new(jwt_secret: Option<&str>, federation_secret: Option<&str>) -> Self {
        TokenVerifier {
            jwt_key: jwt_secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            federation_digest: federation_secret.map(digest),
        }
    }

    /// Verifies a bearer token, optionally checking its region claim
    /// against the region the request declared (`X-Region-ID`).
    pub fn verify(&self, token: &str, declared_region: Option<&str>) -> Result<Actor, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        if self.jwt_key.is_none() && self.federation_digest.is_none() {
            return Err(AuthError::Unconfigured);
        }

        // Digest comparison keeps the check constant-time in token length.
        if let Some(expected) = &self.federation_digest {
            if &digest(token) == expected {
                return Ok(Actor {
                    subject: "federation".to_string(),
                    region: None,
                    federation: true,
                });
            }
        }

        let Some(key) = &self.jwt_key else {
            return Err(AuthError::Invalid);
        };
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        let data = decode::<Claims>(token, key, &validation).map_err(|_| AuthError::Invalid)?;

        if let (Some(token_region), Some(declared)) = (&data.claims.region, declared_region) {
            if !token_region.eq_ignore_ascii_case(declared) {
                return Err(AuthError::RegionMismatch {
                    token: token_region.clone(),
                    declared: declared.to_string(),
                });
            }
        }

        Ok(Actor {
            subject: data.claims.sub,
            region: data.claims.region,
            federation: false,
        })
    }

    /// Strips the `Bearer ` scheme from an `Authorization` header value.
    pub fn bearer(header: &str) -> Option<&str> {
        header.strip_prefix("Bearer ").map(str::trim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "unit-test-secret";

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn issue(sub: &str, region: Option<&str>, exp_offset: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (now() as i64 + exp_offset) as u64,
            iat: now(),
            region: region.map(str::to_string),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(Some(SECRET), Some("fed-secret"))
    }

    #[test]
    fn test_valid_jwt() {
        let actor = verifier().verify(&issue("probe-1", None, 3600), None).unwrap();
        assert_eq!(actor.subject, "probe-1");
        assert!(!actor.federation);
    }

    #[test]
    fn test_expired_jwt_rejected() {
        let err = verifier().verify(&issue("probe-1", None, -3600), None).unwrap_err();
        assert_eq!(err, AuthError::Invalid);
    }

    #[test]
    fn test_tampered_jwt_rejected() {
        let mut token = issue("probe-1", None, 3600);
        token.push('x');
        assert_eq!(verifier().verify(&token, None), Err(AuthError::Invalid));
    }

    #[test]
    fn test_wrong_signing_key_rejected() {
        let claims = Claims {
            sub: "probe-1".to_string(),
            exp: now() + 3600,
            iat: now(),
            region: None,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();
        assert_eq!(verifier().verify(&token, None), Err(AuthError::Invalid));
    }

    #[test]
    fn test_federation_secret_accepted() {
        let actor = verifier().verify("fed-secret", Some("gh-accra")).unwrap();
        assert!(actor.federation);
        assert_eq!(actor.subject, "federation");
    }

    #[test]
    fn test_region_claim_must_match_declared() {
        let token = issue("relay-gh", Some("gh-accra"), 3600);
        assert!(verifier().verify(&token, Some("gh-accra")).is_ok());
        assert!(verifier().verify(&token, Some("GH-ACCRA")).is_ok());
        let err = verifier().verify(&token, Some("ng-lagos")).unwrap_err();
        assert!(matches!(err, AuthError::RegionMismatch { .. }));
    }

    #[test]
    fn test_region_claim_without_declaration_passes() {
        let token = issue("relay-gh", Some("gh-accra"), 3600);
        let actor = verifier().verify(&token, None).unwrap();
        assert_eq!(actor.region.as_deref(), Some("gh-accra"));
    }

    #[test]
    fn test_empty_token() {
        assert_eq!(verifier().verify("", None), Err(AuthError::Missing));
    }

    #[test]
    fn test_unconfigured_fails_closed() {
        let v = TokenVerifier::new(None, None);
        assert_eq!(v.verify("anything", None), Err(AuthError::Unconfigured));
    }

    #[test]
    fn test_bearer_scheme_stripping() {
        assert_eq!(TokenVerifier::bearer("Bearer abc"), Some("abc"));
        assert_eq!(TokenVerifier::bearer("Basic abc"), None);
    }
}

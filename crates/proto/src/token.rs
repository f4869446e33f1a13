use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client role levels, totally ordered. Routing visibility and rate limits
/// key off this ordering.
///
/// ```
/// use bcon_hub_proto::Role;
///
/// assert!(Role::Guest < Role::Player);
/// assert!(Role::Admin < Role::System);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Player,
    Admin,
    System,
}

impl Role {
    pub const COUNT: usize = 4;
    pub const ALL: [Role; Role::COUNT] = [Role::Guest, Role::Player, Role::Admin, Role::System];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Player => "player",
            Self::Admin => "admin",
            Self::System => "system",
        }
    }
}

/// Validated identity attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Adapter {
        server_id: String,
        server_name: Option<String>,
    },
    Client {
        user_id: String,
        display_name: Option<String>,
        role: Role,
    },
}

impl Principal {
    /// The rate-limiter key for this identity.
    pub fn rate_key(&self) -> String {
        match self {
            Self::Adapter { server_id, .. } => format!("adapter:{server_id}"),
            Self::Client { user_id, .. } => format!("client:{user_id}"),
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Adapter { .. } => None,
            Self::Client { role, .. } => Some(*role),
        }
    }

    pub fn is_adapter(&self) -> bool {
        matches!(self, Self::Adapter { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("bad signature")]
    BadSignature,
    #[error("malformed token")]
    Malformed,
    #[error("missing claim: {0}")]
    MissingClaim(&'static str),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Claims {
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

/// Verifies bearer credentials against one listener's signing secret.
///
/// The hub is not the issuer: `exp` is required and checked with zero
/// leeway, and `iss` is only enforced when an issuer is configured.
pub struct TokenValidator {
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }

        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate an adapter token: `server_id` required, `server_name`
    /// optional.
    pub fn validate_adapter(&self, token: &str) -> Result<Principal, TokenError> {
        let claims = self.decode(token)?;
        let server_id = claims
            .server_id
            .filter(|id| !id.is_empty())
            .ok_or(TokenError::MissingClaim("server_id"))?;

        Ok(Principal::Adapter {
            server_id,
            server_name: claims.server_name,
        })
    }

    /// Validate a client token: `user_id` and `role` required, `name`
    /// optional.
    pub fn validate_client(&self, token: &str) -> Result<Principal, TokenError> {
        let claims = self.decode(token)?;
        let user_id = claims
            .user_id
            .filter(|id| !id.is_empty())
            .ok_or(TokenError::MissingClaim("user_id"))?;
        let role = claims.role.ok_or(TokenError::MissingClaim("role"))?;

        Ok(Principal::Client {
            user_id,
            display_name: claims.name,
            role,
        })
    }

    fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        match decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => Err(match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                ErrorKind::MissingRequiredClaim(_) => TokenError::MissingClaim("exp"),
                _ => TokenError::Malformed,
            }),
        }
    }
}

/// Sign an adapter token. The hub only validates, but the wire contract the
/// adapter plugin and the test harness consume lives here.
pub fn mint_adapter(
    secret: &str,
    issuer: Option<&str>,
    server_id: &str,
    server_name: Option<&str>,
    exp: u64,
) -> Result<String, TokenError> {
    sign(
        secret,
        Claims {
            exp: Some(exp),
            iss: issuer.map(str::to_string),
            server_id: Some(server_id.to_string()),
            server_name: server_name.map(str::to_string),
            ..Claims::default()
        },
    )
}

/// Sign a client token.
pub fn mint_client(
    secret: &str,
    issuer: Option<&str>,
    user_id: &str,
    role: Role,
    name: Option<&str>,
    exp: u64,
) -> Result<String, TokenError> {
    sign(
        secret,
        Claims {
            exp: Some(exp),
            iss: issuer.map(str::to_string),
            user_id: Some(user_id.to_string()),
            role: Some(role),
            name: name.map(str::to_string),
            ..Claims::default()
        },
    )
}

fn sign(secret: &str, claims: Claims) -> Result<String, TokenError> {
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| TokenError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    #[test]
    fn adapter_token_round_trip() {
        let token = mint_adapter(SECRET, None, "s1", Some("Survival"), now() + 60).unwrap();
        let principal = TokenValidator::new(SECRET, None)
            .validate_adapter(&token)
            .unwrap();

        assert_eq!(
            principal,
            Principal::Adapter {
                server_id: "s1".to_string(),
                server_name: Some("Survival".to_string()),
            }
        );
    }

    #[test]
    fn client_token_round_trip() {
        let token = mint_client(SECRET, None, "u1", Role::Admin, None, now() + 60).unwrap();
        let principal = TokenValidator::new(SECRET, None)
            .validate_client(&token)
            .unwrap();

        assert_eq!(principal.role(), Some(Role::Admin));
        assert_eq!(principal.rate_key(), "client:u1");
    }

    #[test]
    fn wrong_secret_is_bad_signature() {
        let token = mint_adapter(SECRET, None, "s1", None, now() + 60).unwrap();
        let validator = TokenValidator::new("another-secret-another-secret-xx", None);

        assert_eq!(
            validator.validate_adapter(&token),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn expired_token_has_no_grace() {
        let token = mint_adapter(SECRET, None, "s1", None, now() - 1).unwrap();

        assert_eq!(
            TokenValidator::new(SECRET, None).validate_adapter(&token),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn issuer_mismatch_rejected() {
        let token = mint_client(SECRET, Some("other"), "u1", Role::Guest, None, now() + 60).unwrap();

        assert!(
            TokenValidator::new(SECRET, Some("bcon"))
                .validate_client(&token)
                .is_err()
        );
    }

    #[test]
    fn issuer_ignored_when_unconfigured() {
        let token = mint_client(SECRET, Some("other"), "u1", Role::Guest, None, now() + 60).unwrap();

        assert!(
            TokenValidator::new(SECRET, None)
                .validate_client(&token)
                .is_ok()
        );
    }

    #[test]
    fn missing_claims_classified() {
        // An adapter token passed to the client validator has no user_id.
        let token = mint_adapter(SECRET, None, "s1", None, now() + 60).unwrap();
        assert_eq!(
            TokenValidator::new(SECRET, None).validate_client(&token),
            Err(TokenError::MissingClaim("user_id"))
        );

        assert_eq!(
            TokenValidator::new(SECRET, None).validate_adapter("not-a-token"),
            Err(TokenError::Malformed)
        );
    }
}

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CallError;

/// Content type the video service expects on access tokens.
pub const ACCESS_TOKEN_CONTENT_TYPE: &str = "twilio-fpa;v=1";

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// The service refuses tokens that live longer than a day.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(86_400);

/// Account credentials used to sign access tokens.
///
/// Supplied out of band (environment). The key secret is redacted in Debug
/// output.
#[derive(Clone, Default)]
pub struct ApiCredentials {
    pub account_sid: String,
    pub api_key_sid: String,
    pub api_key_secret: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("account_sid", &self.account_sid)
            .field("api_key_sid", &self.api_key_sid)
            .field("api_key_secret", &"[REDACTED]")
            .finish()
    }
}

impl ApiCredentials {
    fn validate(&self) -> Result<(), CallError> {
        let missing: Vec<&str> = [
            ("account sid", &self.account_sid),
            ("api key sid", &self.api_key_sid),
            ("api key secret", &self.api_key_secret),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CallError::Token(format!(
                "missing credentials: {}",
                missing.join(", ")
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoGrant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grants {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoGrant>,
}

/// JWT claims of an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub jti: String,
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub grants: Grants,
}

/// A signed, short-lived capability to join one room as one identity.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    identity: String,
    room: String,
    jwt: String,
    expires_at: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("identity", &self.identity)
            .field("room", &self.room)
            .field("jwt", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// The encoded JWT handed to the video service.
    pub fn jwt(&self) -> &str {
        &self.jwt
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Mints access tokens for room joins.
///
/// Holds only immutable configuration; every call to [`TokenProvider::mint`]
/// builds its grants from scratch so nothing leaks between sessions.
#[derive(Debug, Clone)]
pub struct TokenProvider {
    credentials: ApiCredentials,
    ttl: Duration,
}

impl TokenProvider {
    pub fn new(credentials: ApiCredentials, ttl: Duration) -> Self {
        Self { credentials, ttl }
    }

    /// Mint a token for a freshly generated identity.
    pub fn mint(&self, room: &str) -> Result<AccessToken, CallError> {
        self.mint_for(&Uuid::new_v4().to_string(), room)
    }

    /// Mint a token for a caller-chosen identity.
    pub fn mint_for(&self, identity: &str, room: &str) -> Result<AccessToken, CallError> {
        mint_token(&self.credentials, identity, room, self.ttl, Utc::now().timestamp())
    }
}

/// Sign an access token granting `identity` entry to `room`.
///
/// `now` is a unix timestamp in seconds.
pub fn mint_token(
    credentials: &ApiCredentials,
    identity: &str,
    room: &str,
    ttl: Duration,
    now: i64,
) -> Result<AccessToken, CallError> {
    credentials.validate()?;
    if identity.trim().is_empty() {
        return Err(CallError::Token("identity must not be empty".into()));
    }
    if room.trim().is_empty() {
        return Err(CallError::Token("room name must not be empty".into()));
    }
    if ttl.is_zero() || ttl > MAX_TOKEN_TTL {
        return Err(CallError::Token(format!(
            "token ttl must be between 1 and {} seconds, got {}",
            MAX_TOKEN_TTL.as_secs(),
            ttl.as_secs()
        )));
    }

    let exp = now + ttl.as_secs() as i64;
    let claims = AccessTokenClaims {
        jti: format!("{}-{}", credentials.api_key_sid, now),
        iss: credentials.api_key_sid.clone(),
        sub: credentials.account_sid.clone(),
        iat: now,
        nbf: now,
        exp,
        grants: Grants {
            identity: identity.to_string(),
            video: Some(VideoGrant {
                room: Some(room.to_string()),
            }),
        },
    };

    let mut header = Header::new(Algorithm::HS256);
    header.typ = Some("JWT".to_string());
    header.cty = Some(ACCESS_TOKEN_CONTENT_TYPE.to_string());

    let key = EncodingKey::from_secret(credentials.api_key_secret.as_bytes());
    let jwt = encode(&header, &claims, &key).map_err(|e| {
        tracing::error!("access token signing failed: {e}");
        CallError::Token(format!("signing failed: {e}"))
    })?;

    let expires_at = Utc
        .timestamp_opt(exp, 0)
        .single()
        .ok_or_else(|| CallError::Token(format!("expiry out of range: {exp}")))?;

    tracing::debug!(identity, room, "access token minted");

    Ok(AccessToken {
        identity: identity.to_string(),
        room: room.to_string(),
        jwt,
        expires_at,
    })
}

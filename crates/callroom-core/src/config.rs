//! Call configuration.
//!
//! Loaded from environment variables at deploy time. There is no runtime
//! configuration file. The API key secret is redacted in Debug output.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::media::CaptureOptions;
use crate::token::{ApiCredentials, DEFAULT_TOKEN_TTL, TokenProvider};

/// Room joined when none is configured.
pub const DEFAULT_ROOM_NAME: &str = "6tnQ74hU58";

pub const ENV_ACCOUNT_SID: &str = "CALLROOM_ACCOUNT_SID";
pub const ENV_API_KEY_SID: &str = "CALLROOM_API_KEY_SID";
pub const ENV_API_KEY_SECRET: &str = "CALLROOM_API_KEY_SECRET";
pub const ENV_ROOM_NAME: &str = "CALLROOM_ROOM_NAME";
pub const ENV_TOKEN_TTL_SECONDS: &str = "CALLROOM_TOKEN_TTL_SECONDS";
pub const ENV_CAPTURE_AUDIO: &str = "CALLROOM_CAPTURE_AUDIO";
pub const ENV_CAPTURE_VIDEO: &str = "CALLROOM_CAPTURE_VIDEO";
pub const ENV_JOIN_WITHOUT_LOCAL_MEDIA: &str = "CALLROOM_JOIN_WITHOUT_LOCAL_MEDIA";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Behaviour of the call view that is not tied to credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSettings {
    pub room_name: String,
    pub capture: CaptureOptions,
    /// Attempt the join even when local capture failed.
    pub join_without_local_media: bool,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            room_name: DEFAULT_ROOM_NAME.to_string(),
            capture: CaptureOptions::default(),
            join_without_local_media: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Missing credentials are not rejected here; they surface as a token
    /// error when the join is attempted.
    pub credentials: ApiCredentials,
    pub token_ttl: Duration,
    pub settings: CallSettings,
}

impl CallConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let text = |name: &str| vars.get(name).cloned().unwrap_or_default();

        let credentials = ApiCredentials {
            account_sid: text(ENV_ACCOUNT_SID),
            api_key_sid: text(ENV_API_KEY_SID),
            api_key_secret: text(ENV_API_KEY_SECRET),
        };

        let room_name = vars
            .get(ENV_ROOM_NAME)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_ROOM_NAME.to_string());

        let token_ttl = match vars.get(ENV_TOKEN_TTL_SECONDS) {
            Some(value) => {
                let secs: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    name: ENV_TOKEN_TTL_SECONDS,
                    value: value.clone(),
                    reason: "expected a whole number of seconds",
                })?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        name: ENV_TOKEN_TTL_SECONDS,
                        value: value.clone(),
                        reason: "must be greater than zero",
                    });
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_TOKEN_TTL,
        };

        let capture = CaptureOptions {
            audio: parse_flag(vars, ENV_CAPTURE_AUDIO, true)?,
            video: parse_flag(vars, ENV_CAPTURE_VIDEO, true)?,
        };
        let join_without_local_media = parse_flag(vars, ENV_JOIN_WITHOUT_LOCAL_MEDIA, false)?;

        Ok(Self {
            credentials,
            token_ttl,
            settings: CallSettings {
                room_name,
                capture,
                join_without_local_media,
            },
        })
    }

    pub fn token_provider(&self) -> TokenProvider {
        TokenProvider::new(self.credentials.clone(), self.token_ttl)
    }
}

fn parse_flag(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(value) = vars.get(name) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.clone(),
            reason: "expected true or false",
        }),
    }
}

use std::fmt;

use thiserror::Error;

/// Configuration fields that feed the key material loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    Endpoint,
    Identity,
    PrivateKey,
    ProviderPublicKey,
    ProviderPrivateKey,   // development provider only
    ApplicationPublicKey, // development provider only
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigField::Endpoint => write!(f, "provider endpoint"),
            ConfigField::Identity => write!(f, "application identity"),
            ConfigField::PrivateKey => write!(f, "application private key"),
            ConfigField::ProviderPublicKey => write!(f, "provider public key"),
            ConfigField::ProviderPrivateKey => write!(f, "provider private key"),
            ConfigField::ApplicationPublicKey => write!(f, "application public key"),
        }
    }
}

/// Why the provider configuration could not be turned into usable key material.
///
/// The hex variants never echo the offending input, so the message is safe to show on the
/// setup page.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(ConfigField),

    #[error("{field} is not valid hex")]
    BadHex {
        field: ConfigField,
        #[source]
        source: hex::FromHexError,
    },

    #[error("{field} decodes to {actual} bytes, expected {expected}")]
    WrongLength {
        field: ConfigField,
        expected: usize,
        actual: usize,
    },

    #[error("{field} is not a valid P-256 key")]
    InvalidKey { field: ConfigField },

    #[error("provider endpoint is not an absolute http(s) URL")]
    BadEndpoint,
}

impl ConfigError {
    pub fn field(&self) -> ConfigField {
        match self {
            ConfigError::Missing(field)
            | ConfigError::BadHex { field, .. }
            | ConfigError::WrongLength { field, .. }
            | ConfigError::InvalidKey { field } => *field,
            ConfigError::BadEndpoint => ConfigField::Endpoint,
        }
    }
}

/// Failures of the signed API client.
///
/// Everything except `Encoding` is an authorization failure from the browser's point of view;
/// the variants exist so logs can tell a dead provider from a refused credential.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authorization token missing")]
    MissingToken,

    #[error("provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("provider rejected the authorization token")]
    InvalidToken,

    #[error("provider reply failed verification: {0}")]
    VerificationFailed(&'static str),

    #[error("failed to encode request: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ClientError {
    pub fn status_code(&self) -> u16 {
        match self {
            ClientError::Encoding(_) => 500,
            _ => 401,
        }
    }

    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::MissingToken => "missing_token",
            ClientError::ProviderUnreachable(_) => "provider_unreachable",
            ClientError::ProviderRejected(_) => "provider_rejected",
            ClientError::InvalidToken => "invalid_token",
            ClientError::VerificationFailed(_) => "verification_failed",
            ClientError::Encoding(_) => "encoding",
        }
    }

    /// Log the error with appropriate security context
    pub fn log_security_event(&self) {
        match self {
            ClientError::VerificationFailed(reason) => {
                tracing::warn!("⚠️  SECURITY: provider reply failed verification ({}) - possible MITM or wrong provider key!", reason);
            }
            ClientError::ProviderUnreachable(detail) => {
                tracing::error!("Provider unreachable: {}", detail);
            }
            ClientError::InvalidToken => {
                tracing::warn!("Provider rejected authorization token");
            }
            ClientError::ProviderRejected(detail) => {
                tracing::warn!("Provider rejected request: {}", detail);
            }
            ClientError::MissingToken => {
                tracing::debug!("Callback arrived without a token");
            }
            ClientError::Encoding(e) => {
                tracing::error!("Failed to encode provider request: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_hex_message_does_not_echo_input() {
        let source = hex::decode("zz").unwrap_err();
        let err = ConfigError::BadHex { field: ConfigField::PrivateKey, source };
        assert_eq!(err.to_string(), "application private key is not valid hex");
        assert_eq!(err.field(), ConfigField::PrivateKey);
    }

    #[test]
    fn client_failures_map_to_unauthorized() {
        assert_eq!(ClientError::MissingToken.status_code(), 401);
        assert_eq!(ClientError::InvalidToken.status_code(), 401);
        assert_eq!(ClientError::VerificationFailed("signature").status_code(), 401);
        assert_eq!(ClientError::ProviderUnreachable("timeout".into()).status_code(), 401);
        assert_eq!(ClientError::ProviderRejected("status 403".into()).kind(), "provider_rejected");
    }
}

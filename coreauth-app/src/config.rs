use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use coreauth::client::transport::DEFAULT_TIMEOUT;
use coreauth::keys::ProviderSettings;
use zeroize::Zeroizing;

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1:8080";

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: ProviderSettings,      // raw key material, validated later by keys::load
    pub bind: SocketAddr,
    pub public_url: String,              // base for the /authorized and /fail callbacks
    pub setup_mode: bool,                // reveal generated key pairs on /
    pub provider_timeout: Duration,
    pub provider_cert: Option<PathBuf>,  // pin the provider's TLS certificate
    pub use_tls: bool,
    pub server_log: bool,
}

impl AppConfig {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Only the listener and timeout settings can fail;
    /// bad key material is left for the loader to diagnose.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let var = |name: &str| lookup(name).unwrap_or_default();
        let flag = |name: &str| var(name) == "true";

        let provider = ProviderSettings {
            endpoint: var("COREAUTH_ENDPOINT"),
            identity: var("COREAUTH_IDENTITY"),
            private_key: Zeroizing::new(var("COREAUTH_PRIVATE_KEY")),
            provider_public_key: var("COREAUTH_PROVIDER_PUBLIC_KEY"),
        };

        let bind = lookup("COREAUTH_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind
            .parse()
            .map_err(|_| invalid_input(format!("COREAUTH_BIND is not a socket address: {}", bind)))?;

        let provider_timeout = match lookup("COREAUTH_PROVIDER_TIMEOUT_SECS") {
            Some(secs) => match secs.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(invalid_input(format!(
                        "COREAUTH_PROVIDER_TIMEOUT_SECS must be a positive number of seconds: {}",
                        secs
                    )))
                }
            },
            None => DEFAULT_TIMEOUT,
        };

        let public_url = lookup("COREAUTH_PUBLIC_URL")
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PUBLIC_URL.to_string());

        Ok(Self {
            provider,
            bind,
            public_url: public_url.trim_end_matches('/').to_string(),
            setup_mode: flag("COREAUTH_SETUP_MODE"),
            provider_timeout,
            provider_cert: lookup("COREAUTH_PROVIDER_CERT")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            use_tls: flag("USE_TLS"),
            server_log: flag("SERVER_LOG"),
        })
    }
}

fn invalid_input(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> io::Result<AppConfig> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.public_url, "http://127.0.0.1:8080");
        assert_eq!(config.provider_timeout, Duration::from_secs(10));
        assert!(!config.setup_mode);
        assert!(!config.use_tls);
        assert!(config.provider_cert.is_none());
        assert!(config.provider.endpoint.is_empty());
    }

    #[test]
    fn reads_provider_settings_and_flags() {
        let config = config_from(&[
            ("COREAUTH_ENDPOINT", "https://core.example/api"),
            ("COREAUTH_IDENTITY", "app-1"),
            ("COREAUTH_PRIVATE_KEY", "ab"),
            ("COREAUTH_PROVIDER_PUBLIC_KEY", "cd"),
            ("COREAUTH_PUBLIC_URL", "https://app.example/"),
            ("COREAUTH_SETUP_MODE", "true"),
            ("COREAUTH_PROVIDER_TIMEOUT_SECS", "3"),
            ("COREAUTH_PROVIDER_CERT", "/etc/core.pem"),
        ])
        .unwrap();

        assert_eq!(config.provider.identity, "app-1");
        assert_eq!(config.provider.private_key.as_str(), "ab");
        assert_eq!(config.public_url, "https://app.example");
        assert!(config.setup_mode);
        assert_eq!(config.provider_timeout, Duration::from_secs(3));
        assert_eq!(config.provider_cert, Some(PathBuf::from("/etc/core.pem")));
    }

    #[test]
    fn bad_bind_or_timeout_is_invalid_input() {
        let err = config_from(&[("COREAUTH_BIND", "localhost")]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        for timeout in ["0", "ten"] {
            let err = config_from(&[("COREAUTH_PROVIDER_TIMEOUT_SECS", timeout)]).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
    }
}

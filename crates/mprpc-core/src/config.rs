//! Session configuration.

use crate::ClientInfo;

/// Pending calls allowed before `call` refuses new work.
pub const DEFAULT_MAX_PENDING: usize = 8192;

/// Bootstrap call whose result starts with this connection's channel id.
pub const DEFAULT_API_INFO_METHOD: &str = "nvim_get_api_info";

/// Call used to announce [`ClientInfo`] to the peer.
pub const DEFAULT_CLIENT_INFO_METHOD: &str = "nvim_set_client_info";

/// Environment variable overriding [`SessionConfig::max_pending`].
pub const MAX_PENDING_ENV: &str = "MPRPC_MAX_PENDING";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_pending: usize,
    pub api_info_method: String,
    pub client_info_method: String,
    /// Announced once when the session starts, if set.
    pub client_info: Option<ClientInfo>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            api_info_method: DEFAULT_API_INFO_METHOD.to_owned(),
            client_info_method: DEFAULT_CLIENT_INFO_METHOD.to_owned(),
            client_info: None,
        }
    }
}

impl SessionConfig {
    /// Defaults with overrides from the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Values that are not positive integers
    /// are ignored.
    pub fn with_env_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(max) = parse_positive(lookup(MAX_PENDING_ENV)) {
            self.max_pending = max;
        }
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn with_client_info(mut self, info: ClientInfo) -> Self {
        self.client_info = Some(info);
        self
    }

    pub fn with_api_info_method(mut self, method: impl Into<String>) -> Self {
        self.api_info_method = method.into();
        self
    }

    pub fn with_client_info_method(mut self, method: impl Into<String>) -> Self {
        self.client_info_method = method.into();
        self
    }
}

fn parse_positive(value: Option<String>) -> Option<usize> {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_max_pending() {
        let config = SessionConfig::default().with_env_lookup(|key| {
            (key == MAX_PENDING_ENV).then(|| "16".to_owned())
        });
        assert_eq!(config.max_pending, 16);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        for raw in ["0", "-3", "lots", ""] {
            let config = SessionConfig::default().with_env_lookup(|_| Some(raw.to_owned()));
            assert_eq!(config.max_pending, DEFAULT_MAX_PENDING, "{raw:?}");
        }
    }

    #[test]
    fn defaults_name_the_bootstrap_calls() {
        let config = SessionConfig::default();
        assert_eq!(config.api_info_method, "nvim_get_api_info");
        assert_eq!(config.client_info_method, "nvim_set_client_info");
        assert!(config.client_info.is_none());
    }
}

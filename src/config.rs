use serde::Deserialize;
use std::time::Duration;

use crate::adapter::AdapterSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub store_url: String,
    pub store_auth: Option<String>,
    pub port: u16,
    pub write_timeout_secs: u64,
    pub reconnect_initial_secs: u64,
    pub reconnect_max_secs: u64,
}

fn secs_var(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be a whole number of seconds", name))?;
            if secs == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
            Ok(secs)
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            store_url: std::env::var("LEADS_STORE_URL")
                .or_else(|_| std::env::var("FIREBASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("LEADS_STORE_URL or FIREBASE_URL environment variable required")
                })
                .and_then(|url| {
                    let url = url.trim().trim_end_matches('/').to_string();
                    if url.is_empty() {
                        anyhow::bail!("LEADS_STORE_URL cannot be empty");
                    }
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        anyhow::bail!("LEADS_STORE_URL must start with http:// or https://");
                    }
                    Ok(url)
                })?,
            store_auth: std::env::var("LEADS_STORE_AUTH")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            write_timeout_secs: secs_var("WRITE_TIMEOUT_SECS", 10)?,
            reconnect_initial_secs: secs_var("RECONNECT_INITIAL_SECS", 1)?,
            reconnect_max_secs: secs_var("RECONNECT_MAX_SECS", 30)?,
        };

        if config.reconnect_max_secs < config.reconnect_initial_secs {
            anyhow::bail!("RECONNECT_MAX_SECS must not be below RECONNECT_INITIAL_SECS");
        }

        // Never log the auth token itself
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Store URL: {}", config.store_url);
        tracing::debug!(
            "Store auth: {}",
            if config.store_auth.is_some() { "set" } else { "none" }
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            reconnect_initial: Duration::from_secs(self.reconnect_initial_secs),
            reconnect_max: Duration::from_secs(self.reconnect_max_secs),
        }
    }

    /// Host of the lead store, safe to expose (no path, query or credentials).
    pub fn store_host(&self) -> Option<String> {
        url::Url::parse(&self.store_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_settings_from_config() {
        let config = Config {
            store_url: "https://leads.example.firebaseio.com".into(),
            store_auth: None,
            port: 3001,
            write_timeout_secs: 7,
            reconnect_initial_secs: 2,
            reconnect_max_secs: 20,
        };

        let settings = config.adapter_settings();
        assert_eq!(settings.write_timeout, Duration::from_secs(7));
        assert_eq!(settings.reconnect_initial, Duration::from_secs(2));
        assert_eq!(settings.reconnect_max, Duration::from_secs(20));
    }

    #[test]
    fn test_store_host_hides_credentials() {
        let config = Config {
            store_url: "https://user:pw@leads.example.firebaseio.com/phoneLeads".into(),
            store_auth: Some("secret".into()),
            port: 3001,
            write_timeout_secs: 10,
            reconnect_initial_secs: 1,
            reconnect_max_secs: 30,
        };

        assert_eq!(
            config.store_host().as_deref(),
            Some("leads.example.firebaseio.com")
        );
    }

    #[test]
    fn test_secs_var_default_when_unset() {
        assert_eq!(secs_var("RUST_PHONE_LEADS_TEST_UNSET_SECS", 4).unwrap(), 4);
    }
}

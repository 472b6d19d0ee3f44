use crate::config::Config;
use crate::utils::{atomic_write, get_meao_home};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Secret values stored separately from config.json, written 0600 and never
/// logged. Environment variables win over the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Credentials {
    pub anthropic_api_key: String,
}

pub fn credentials_path() -> Result<PathBuf> {
    Ok(get_meao_home()?.join("credentials.json"))
}

pub fn load_credentials() -> Result<Credentials> {
    let path = credentials_path()?;
    if !path.exists() {
        return Ok(Credentials::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read credentials from {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| "Failed to parse credentials.json")
}

pub fn save_credentials(creds: &Credentials) -> Result<()> {
    let path = credentials_path()?;
    let content = serde_json::to_string_pretty(creds)?;
    atomic_write(&path, &content)
}

/// Fill provider credentials into the config.
/// Precedence: environment > credentials.json > config.json value.
pub fn apply(config: &mut Config) -> Result<()> {
    let creds = load_credentials().unwrap_or_default();
    if !creds.anthropic_api_key.is_empty() {
        config.provider.api_key = creds.anthropic_api_key;
    }
    if let Ok(key) = std::env::var("MEAO_ANTHROPIC_API_KEY") {
        if !key.is_empty() {
            config.provider.api_key = key;
        }
    }
    Ok(())
}

/// (name, value) pairs for registering known secrets with the detector so the
/// exact values are redacted from any outbound text, in any encoding.
pub fn known_secret_pairs(config: &Config) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if !config.provider.api_key.is_empty() {
        pairs.push((
            "anthropic_api_key".to_string(),
            config.provider.api_key.clone(),
        ));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_credentials_empty() {
        let creds = Credentials::default();
        assert!(creds.anthropic_api_key.is_empty());
    }

    #[test]
    fn known_pairs_skip_empty() {
        let config = Config::default();
        assert!(known_secret_pairs(&config).is_empty());

        let mut config = Config::default();
        config.provider.api_key = "sk-ant-REDACTED".to_string();
        let pairs = known_secret_pairs(&config);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "anthropic_api_key");
    }

    #[test]
    fn credentials_parse_camel_case() {
        let creds: Credentials =
            serde_json::from_str(r#"{"anthropicApiKey": "sk-ant-x"}"#).unwrap();
        assert_eq!(creds.anthropic_api_key, "sk-ant-x");
    }
}

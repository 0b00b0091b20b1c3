use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use murmur_llm::{DEFAULT_OPENAI_MODEL, ProviderConfig};
use murmur_store::UserId;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_CONFIG_FILE: &str = "murmur.toml";
/// Environment override prefix; nested keys split on `__`, e.g.
/// `MURMUR_PROVIDER__API_KEY`.
pub const ENV_PREFIX: &str = "MURMUR_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Sqlite database location; empty means an in-memory store that lives
    /// for the process only.
    #[serde(default)]
    pub database_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Identity owning persisted sessions; empty runs anonymous/local-only.
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Settings {
    /// Loads defaults, then the config file, then `MURMUR_` env overrides.
    ///
    /// A missing file is fine; the defaults and environment carry a usable
    /// configuration on their own.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let settings: Settings = figment.extract().context(ExtractConfigSnafu {
            stage: "extract-settings",
        })?;
        Ok(settings.normalized())
    }

    pub fn identity(&self) -> Option<UserId> {
        let trimmed = self.user_id.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(UserId::new(trimmed))
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(
            &self.provider.provider_id,
            &self.provider.api_key,
            &self.provider.endpoint,
            Some(self.provider.model.clone()),
        )
    }

    pub fn normalized(mut self) -> Self {
        self.user_id = self.user_id.trim().to_string();
        self.provider.provider_id = non_empty_or(self.provider.provider_id, default_provider_id);
        self.provider.api_key = self.provider.api_key.trim().to_string();
        self.provider.endpoint = non_empty_or(self.provider.endpoint, default_endpoint);
        self.provider.model = non_empty_or(self.provider.model, default_model);
        self.storage.database_path = self.storage.database_path.trim().to_string();

        // Keep a plain `OPENAI_API_KEY` working the way shell users expect.
        if self.provider.api_key.is_empty()
            && let Ok(key) = std::env::var("OPENAI_API_KEY")
        {
            self.provider.api_key = key.trim().to_string();
        }

        self
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to read configuration on `{stage}`: {source}"))]
    ExtractConfig {
        stage: &'static str,
        source: figment::Error,
    },
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn non_empty_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_anonymous_and_in_memory() {
        let settings = Settings::default().normalized();
        assert_eq!(settings.identity(), None);
        assert!(settings.storage.database_path.is_empty());
        assert_eq!(settings.provider.provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(settings.provider.model, DEFAULT_OPENAI_MODEL);
    }

    #[test]
    fn toml_values_override_defaults() {
        let figment = Figment::from(Serialized::defaults(Settings::default())).merge(
            Toml::string(
                r#"
                user_id = "user-42"

                [provider]
                api_key = "sk-test"
                model = "gpt-4o"

                [storage]
                database_path = "murmur.db"
                "#,
            ),
        );

        let settings: Settings = figment.extract().unwrap();
        let settings = settings.normalized();
        assert_eq!(settings.identity(), Some(UserId::new("user-42")));
        assert_eq!(settings.provider.model, "gpt-4o");
        assert_eq!(settings.storage.database_path, "murmur.db");
        // Untouched sections keep their defaults.
        assert_eq!(settings.provider.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn blank_fields_normalize_back_to_defaults() {
        let settings = Settings {
            user_id: "   ".to_string(),
            provider: ProviderSettings {
                provider_id: "".to_string(),
                api_key: "  key  ".to_string(),
                endpoint: " ".to_string(),
                model: String::new(),
            },
            storage: StorageSettings::default(),
        }
        .normalized();

        assert_eq!(settings.identity(), None);
        assert_eq!(settings.provider.provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(settings.provider.api_key, "key");
        assert_eq!(settings.provider.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.provider.model, DEFAULT_OPENAI_MODEL);
    }
}

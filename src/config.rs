//! Service configuration.
//!
//! Static configuration is loaded once through figment (YAML file plus
//! `TOLLGATE_`-prefixed environment variables). Live limiter settings are
//! different: they come from the settings store and may change at any time,
//! so the rate-limit manager reads them through a [`SettingsProvider`]
//! closure re-evaluated on every call — updates take effect without a
//! restart.

use std::path::Path;
use std::sync::Arc;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

/// Key prefix used for limiter counters when none is configured.
pub const DEFAULT_REDIS_PREFIX: &str = "ratelimit";

/// Snapshot of the live rate-limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Global default calls-per-second limit; zero means no default.
    pub default_limit: i32,
    pub redis_enabled: bool,
    pub redis_addr: String,
    pub redis_password: String,
    pub redis_db: i64,
    pub redis_prefix: String,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            default_limit: 0,
            redis_enabled: false,
            redis_addr: String::new(),
            redis_password: String::new(),
            redis_db: 0,
            redis_prefix: DEFAULT_REDIS_PREFIX.to_string(),
        }
    }
}

impl LimiterSettings {
    /// Trims strings and clamps negative values, mirroring how the settings
    /// store tolerates sloppy input.
    pub fn normalized(mut self) -> Self {
        self.redis_addr = self.redis_addr.trim().to_string();
        self.redis_password = self.redis_password.trim().to_string();
        self.redis_prefix = self.redis_prefix.trim().to_string();
        if self.redis_prefix.is_empty() {
            self.redis_prefix = DEFAULT_REDIS_PREFIX.to_string();
        }
        if self.redis_db < 0 {
            self.redis_db = 0;
        }
        if self.default_limit < 0 {
            self.default_limit = 0;
        }
        self
    }
}

/// Provider of the current limiter settings, re-evaluated on every call.
pub type SettingsProvider = Arc<dyn Fn() -> LimiterSettings + Send + Sync>;

/// Fixed settings provider, mainly for tests and simple deployments.
pub fn fixed_settings(settings: LimiterSettings) -> SettingsProvider {
    let settings = settings.normalized();
    Arc::new(move || settings.clone())
}

/// Static service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// Initial limiter settings, used until the settings store supplies live
    /// values.
    pub limiter: LimiterSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/tollgate".to_string(),
            limiter: LimiterSettings::default(),
        }
    }
}

impl Config {
    /// Figment for a config file plus environment overrides
    /// (`TOLLGATE_DATABASE_URL`, `TOLLGATE_LIMITER__REDIS_ADDR`, ...).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("TOLLGATE_").split("__"))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: Config = Self::figment(path).extract()?;
        Ok(Config {
            limiter: config.limiter.normalized(),
            ..config
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_fills_prefix_and_clamps_negatives() {
        let settings = LimiterSettings {
            default_limit: -3,
            redis_db: -1,
            redis_addr: "  localhost:6379  ".into(),
            redis_prefix: "   ".into(),
            ..LimiterSettings::default()
        }
        .normalized();
        assert_eq!(settings.default_limit, 0);
        assert_eq!(settings.redis_db, 0);
        assert_eq!(settings.redis_addr, "localhost:6379");
        assert_eq!(settings.redis_prefix, DEFAULT_REDIS_PREFIX);
    }

    #[test]
    fn env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "tollgate.yaml",
                r#"
                database_url: postgres://db/tollgate
                limiter:
                  default_limit: 10
                "#,
            )?;
            jail.set_env("TOLLGATE_LIMITER__REDIS_ENABLED", "true");
            jail.set_env("TOLLGATE_LIMITER__REDIS_ADDR", "redis:6379");

            let config = Config::load(Path::new("tollgate.yaml")).expect("config loads");
            assert_eq!(config.database_url, "postgres://db/tollgate");
            assert_eq!(config.limiter.default_limit, 10);
            assert!(config.limiter.redis_enabled);
            assert_eq!(config.limiter.redis_addr, "redis:6379");
            Ok(())
        });
    }
}

use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    /// Ephemeral session keys expire on their own if reconciliation never
    /// gets to them.
    pub session_ttl_secs: u64,
    pub sync_lock_ttl_secs: u64,
    pub sync_lock_renew_secs: u64,
    /// Cadence of the periodic sweep in the sync worker binary.
    pub sync_interval_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let config_builder = config::Config::builder()
            .add_source(
                config::File::with_name(&format!("config/{}", env)).required(false), // Allow missing config file, fallback to ENV
            )
            // Override with environment variables (prefix: APP_)
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings = config_builder.build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017/livequiz".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "livequiz".to_string());

        let session_ttl_secs = Self::u64_setting(&settings, "sync.session_ttl_secs", 86_400);
        let sync_lock_ttl_secs = Self::u64_setting(&settings, "sync.lock_ttl_secs", 120);
        let sync_lock_renew_secs = Self::u64_setting(&settings, "sync.lock_renew_secs", 45);
        let sync_interval_secs = Self::u64_setting(&settings, "sync.interval_secs", 60);

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            session_ttl_secs,
            sync_lock_ttl_secs,
            sync_lock_renew_secs,
            sync_interval_secs,
        })
    }

    fn u64_setting(settings: &config::Config, key: &str, default: u64) -> u64 {
        settings
            .get_int(key)
            .ok()
            .and_then(|value| u64::try_from(value).ok())
            .or_else(|| {
                let env_key = format!(
                    "APP__{}",
                    key.replace('.', "__").to_ascii_uppercase()
                );
                env::var(env_key).ok().and_then(|raw| raw.parse().ok())
            })
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "APP_ENV",
            "MONGO_URI",
            "REDIS_URI",
            "MONGO_DATABASE",
            "APP__SYNC__LOCK_TTL_SECS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_without_env() {
        clear_env();
        let config = Config::load().unwrap();
        assert_eq!(config.mongo_database, "livequiz");
        assert_eq!(config.sync_lock_ttl_secs, 120);
        assert_eq!(config.sync_lock_renew_secs, 45);
        assert_eq!(config.session_ttl_secs, 86_400);
    }

    #[test]
    #[serial]
    fn env_overrides_take_precedence() {
        clear_env();
        env::set_var("REDIS_URI", "redis://cache.internal:6380/1");
        env::set_var("APP__SYNC__LOCK_TTL_SECS", "300");
        let config = Config::load().unwrap();
        assert_eq!(config.redis_uri, "redis://cache.internal:6380/1");
        assert_eq!(config.sync_lock_ttl_secs, 300);
        clear_env();
    }
}

use ::config::{Config, Environment, File};
use serde::Deserialize;

/// Runtime configuration, layered: built-in defaults, then an optional
/// `paperbot.toml`, then `PAPERBOT_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub redis_url: String,
    /// File the discovery collaborator keeps the resolved asset in.
    pub asset_file: String,
    /// Session starting balance, in SOL.
    pub starting_balance: f64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<AppConfig> {
        let config = Config::builder()
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("asset_file", "active_asset.json")?
            .set_default("starting_balance", 10.0)?
            .add_source(File::with_name("paperbot").required(false))
            .add_source(Environment::with_prefix("PAPERBOT"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load() {
        let config = AppConfig::load().unwrap();
        assert_eq!(config.starting_balance, 10.0);
        assert!(config.redis_url.starts_with("redis://"));
    }
}

//! Server configuration

use anyhow::Context;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct Config {
    /// Pooled connection string used for queries
    pub database_url: String,
    /// Direct connection for migrations (bypasses transaction poolers)
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    /// Bearer token for the internal subscriber routes; unset disables them
    pub internal_api_token: Option<String>,
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = non_empty("DATABASE_URL").context("DATABASE_URL must be set")?;

        let run_migrations = match non_empty("RUN_MIGRATIONS") {
            None => false,
            Some(v) => v
                .parse::<bool>()
                .with_context(|| format!("RUN_MIGRATIONS must be true or false, got '{}'", v))?,
        };

        Ok(Self {
            database_url,
            database_direct_url: non_empty("DATABASE_DIRECT_URL"),
            bind_address: non_empty("BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            internal_api_token: non_empty("INTERNAL_API_TOKEN"),
            run_migrations,
        })
    }

    /// URL to run migrations against
    pub fn migration_url(&self) -> &str {
        self.database_direct_url
            .as_deref()
            .unwrap_or(&self.database_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/resumely")]).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(!config.run_migrations);
        assert!(config.internal_api_token.is_none());
        assert_eq!(config.migration_url(), "postgres://localhost/resumely");
    }

    #[test]
    fn test_database_url_required() {
        assert!(config(&[]).is_err());
        assert!(config(&[("DATABASE_URL", "  ")]).is_err());
    }

    #[test]
    fn test_direct_url_used_for_migrations() {
        let config = config(&[
            ("DATABASE_URL", "postgres://pooler/resumely"),
            ("DATABASE_DIRECT_URL", "postgres://direct/resumely"),
            ("RUN_MIGRATIONS", "true"),
        ])
        .unwrap();
        assert!(config.run_migrations);
        assert_eq!(config.migration_url(), "postgres://direct/resumely");
    }

    #[test]
    fn test_invalid_migration_flag() {
        let err = config(&[
            ("DATABASE_URL", "postgres://localhost/resumely"),
            ("RUN_MIGRATIONS", "yes"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("RUN_MIGRATIONS"));
    }
}

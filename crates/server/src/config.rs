use std::{collections::HashMap, fs};

use serde::Deserialize;
use shared::domain::CapacityPolicy;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub session_secret: String,
    pub session_ttl_seconds: i64,
    pub capacity_policy: CapacityPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/mentorship.db".into(),
            session_secret: "devsecret".into(),
            session_ttl_seconds: 8 * 3600,
            capacity_policy: CapacityPolicy::Advisory,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file_settings(&mut settings, &raw);
    }

    let env: HashMap<String, String> = std::env::vars().collect();
    apply_env_settings(&mut settings, &env);

    settings
}

fn apply_file_settings(settings: &mut Settings, raw: &str) {
    let file_cfg = match toml::from_str::<HashMap<String, toml::Value>>(raw) {
        Ok(cfg) => cfg,
        Err(error) => {
            warn!(%error, "ignoring unreadable server.toml");
            return;
        }
    };

    let text = |key: &str| file_cfg.get(key).and_then(|v| v.as_str()).map(str::to_string);

    if let Some(v) = text("bind_addr") {
        settings.server_bind = v;
    }
    if let Some(v) = text("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = text("session_secret") {
        settings.session_secret = v;
    }
    if let Some(v) = file_cfg.get("session_ttl_seconds").and_then(|v| v.as_integer()) {
        settings.session_ttl_seconds = v;
    }
    if let Some(v) = text("capacity_policy") {
        set_capacity_policy(settings, &v);
    }
}

fn apply_env_settings(settings: &mut Settings, env: &HashMap<String, String>) {
    if let Some(v) = env.get("SERVER_BIND") {
        settings.server_bind = v.clone();
    }
    if let Some(v) = env.get("APP__BIND_ADDR") {
        settings.server_bind = v.clone();
    }

    if let Some(v) = env.get("DATABASE_URL") {
        settings.database_url = v.clone();
    }
    if let Some(v) = env.get("APP__DATABASE_URL") {
        settings.database_url = v.clone();
    }

    if let Some(v) = env.get("APP__SESSION_SECRET") {
        settings.session_secret = v.clone();
    }

    if let Some(v) = env.get("APP__SESSION_TTL_SECONDS") {
        match v.parse::<i64>() {
            Ok(parsed) => settings.session_ttl_seconds = parsed,
            Err(error) => warn!(value = %v, %error, "ignoring APP__SESSION_TTL_SECONDS"),
        }
    }

    if let Some(v) = env.get("APP__CAPACITY_POLICY") {
        set_capacity_policy(settings, v);
    }
}

fn set_capacity_policy(settings: &mut Settings, raw: &str) {
    match raw.parse::<CapacityPolicy>() {
        Ok(policy) => settings.capacity_policy = policy,
        Err(error) => warn!(%error, "unknown capacity policy, keeping {:?}", settings.capacity_policy),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_database_dir(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

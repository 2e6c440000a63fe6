use std::{env, net::SocketAddr};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,
    #[serde(default = "default_plc_upstream")]
    pub plc_upstream: String,
    #[serde(default = "default_plc_lock_id")]
    pub plc_lock_id: i64,
    /// Keep the head timestamp up to date with a database trigger instead of
    /// from business logic. Switching this off while running multiple
    /// replicas may let a few log entries get duplicated.
    #[serde(default = "default_plc_head_trigger")]
    pub plc_head_trigger: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            database_url: None,
            database_max_connections: default_database_max_connections(),
            plc_upstream: default_plc_upstream(),
            plc_lock_id: default_plc_lock_id(),
            plc_head_trigger: default_plc_head_trigger(),
        }
    }
}

impl AppConfig {
    const BIND_ADDRESS_ENV: &'static str = "SKYMIRROR_BIND_ADDRESS";
    const DATABASE_URL_ENV: &'static str = "SKYMIRROR_DATABASE_URL";
    const DATABASE_MAX_CONNECTIONS_ENV: &'static str = "SKYMIRROR_DATABASE_MAX_CONNECTIONS";
    const PLC_UPSTREAM_ENV: &'static str = "SKYMIRROR_PLC_UPSTREAM";
    const PLC_LOCK_ID_ENV: &'static str = "SKYMIRROR_PLC_LOCK_ID";
    const PLC_HEAD_TRIGGER_ENV: &'static str = "SKYMIRROR_PLC_HEAD_TRIGGER";

    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = env::var(Self::BIND_ADDRESS_ENV) {
            config.bind_address = addr
                .parse()
                .with_context(|| format!("invalid {name}", name = Self::BIND_ADDRESS_ENV))?;
        }

        if let Ok(url) = env::var(Self::DATABASE_URL_ENV) {
            let trimmed = url.trim().to_owned();
            if !trimmed.is_empty() {
                config.database_url = Some(trimmed);
            }
        }

        if let Ok(value) = env::var(Self::DATABASE_MAX_CONNECTIONS_ENV) {
            config.database_max_connections = value.parse().with_context(|| {
                format!(
                    "invalid {} (expected positive integer)",
                    Self::DATABASE_MAX_CONNECTIONS_ENV
                )
            })?;
        }

        if let Ok(upstream) = env::var(Self::PLC_UPSTREAM_ENV) {
            let trimmed = upstream.trim().to_owned();
            if !trimmed.is_empty() {
                config.plc_upstream = trimmed;
            }
        }

        if let Ok(value) = env::var(Self::PLC_LOCK_ID_ENV) {
            config.plc_lock_id = value
                .parse()
                .with_context(|| format!("invalid {} (expected integer)", Self::PLC_LOCK_ID_ENV))?;
        }

        if let Ok(value) = env::var(Self::PLC_HEAD_TRIGGER_ENV) {
            config.plc_head_trigger = parse_bool(&value).with_context(|| {
                format!(
                    "invalid {} (expected true/false)",
                    Self::PLC_HEAD_TRIGGER_ENV
                )
            })?;
        }

        Ok(config)
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("SKYMIRROR_DATABASE_URL must be set")
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => anyhow::bail!("unrecognized boolean value {other:?}"),
    }
}

fn default_bind_address() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("static bind address")
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_plc_upstream() -> String {
    "https://plc.directory".to_string()
}

fn default_plc_lock_id() -> i64 {
    // Arbitrary but stable; all replicas must agree on it.
    0x736b_796d
}

fn default_plc_head_trigger() -> bool {
    true
}

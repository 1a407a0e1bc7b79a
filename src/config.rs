/*
 * Copyright (c) 2025 MirageDB contributors. All rights reserved.
 *
 * MirageDB - MongoDB-compatible database facade
 *
 * @file config.rs
 * @brief MirageDB configuration management
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub tls: TlsConfig,
    pub authentication: AuthenticationConfig,
    pub router: RouterSettings,
    pub cursors: CursorConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: u32,
    pub connection_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// TLS options. Key and certificate are PEM file paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub key: Option<String>,
    pub cert: Option<String>,
    pub ca: Option<String>,
    pub passphrase: Option<String>,
    pub request_cert: bool,
    pub reject_unauthorized: bool,
    pub min_version: String,
    pub max_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    pub enabled: bool,
    pub iteration_count: u32,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub db: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    pub auto_routing: bool,
    pub olap_enabled: bool,
    pub row_threshold: i64,
    pub large_sample_threshold: i64,
    pub prefer_olap_for_aggregations: bool,
    pub timestamp_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    pub sweep_interval_secs: u64,
    pub idle_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 27018,
                max_connections: 1000,
                connection_timeout_ms: 5000,
                idle_timeout_ms: 60000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            tls: TlsConfig {
                enabled: false,
                key: None,
                cert: None,
                ca: None,
                passphrase: None,
                request_cert: false,
                reject_unauthorized: true,
                min_version: "1.2".to_string(),
                max_version: "1.3".to_string(),
            },
            authentication: AuthenticationConfig {
                enabled: false,
                iteration_count: crate::auth::DEFAULT_ITERATIONS,
                users: Vec::new(),
            },
            router: RouterSettings {
                auto_routing: true,
                olap_enabled: false,
                row_threshold: 10_000,
                large_sample_threshold: 1_000,
                prefer_olap_for_aggregations: false,
                timestamp_fields: vec![
                    "created_at".to_string(),
                    "updated_at".to_string(),
                    "timestamp".to_string(),
                    "_cdc_timestamp".to_string(),
                ],
            },
            cursors: CursorConfig {
                sweep_interval_secs: 30,
                idle_ttl_secs: 600,
            },
            health: HealthConfig {
                enabled: true,
                port: 9091,
            },
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path).await?;

        let config: Config = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };

        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn router_config(&self) -> crate::router::RouterConfig {
        crate::router::RouterConfig {
            auto_routing: self.router.auto_routing,
            olap_configured: self.router.olap_enabled,
            row_threshold: self.router.row_threshold,
            large_sample_threshold: self.router.large_sample_threshold,
            prefer_olap_for_aggregations: self.router.prefer_olap_for_aggregations,
            timestamp_fields: self.router.timestamp_fields.clone(),
        }
    }
}

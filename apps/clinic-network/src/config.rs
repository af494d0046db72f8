//! Configuração do serviço.
//!
//! Lida de um arquivo TOML opcional (`CLINIC_NETWORK_CONFIG`), com segredos
//! sobrescritos por variáveis de ambiente.

use std::path::Path;

use anyhow::{bail, Context, Result};
use common_db::DbConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_PATH_ENV: &str = "CLINIC_NETWORK_CONFIG";
pub const JWT_SECRET_ENV: &str = "CLINIC_NETWORK_JWT_SECRET";
pub const KEY_PHRASE_ENV: &str = "CLINIC_NETWORK_KEY_PHRASE";
pub const NOTIFY_URL_ENV: &str = "CLINIC_NETWORK_NOTIFY_URL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DbConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Requisições simultâneas atendidas pelo roteador
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Capacidade do canal de eventos de mudança
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Segredo HS256 compartilhado com o provedor de identidade
    #[serde(default)]
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// URL base do serviço de push; sem ela as notificações só vão para o log
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_notify_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_concurrency_limit() -> usize {
    256
}

fn default_event_capacity() -> usize {
    1024
}

fn default_notify_timeout_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    512
}

pub fn default_log_filter() -> String {
    "info,clinic_network=debug".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            concurrency_limit: default_concurrency_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_notify_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Configuração TOML inválida")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Falha ao ler configuração {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// Carrega arquivo (se houver) e aplica variáveis de ambiente
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(JWT_SECRET_ENV) {
            self.auth.jwt_secret = secret;
        }
        if let Some(phrase) = lookup(KEY_PHRASE_ENV) {
            self.database.key_phrase = phrase;
        }
        if let Some(url) = lookup(NOTIFY_URL_ENV) {
            self.notifications.base_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret não definido (use {})", JWT_SECRET_ENV);
        }
        if self.database.key_phrase.is_empty() {
            bail!("database.key_phrase não definida (use {})", KEY_PHRASE_ENV);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config = AppConfig::from_toml_str(
            r#"
            [server]
            bind_addr = "0.0.0.0:9000"

            [database]
            db_path = "/tmp/net.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.server.concurrency_limit, 256);
        assert_eq!(config.database.db_path, "/tmp/net.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.notifications.queue_capacity, 512);
        assert_eq!(config.log.filter, default_log_filter());
    }

    #[test]
    fn environment_overrides_secrets() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_err());

        config.apply_overrides(|name| match name {
            JWT_SECRET_ENV => Some("segredo".to_string()),
            KEY_PHRASE_ENV => Some("frase".to_string()),
            NOTIFY_URL_ENV => Some("http://push.local".to_string()),
            _ => None,
        });

        assert_eq!(config.auth.jwt_secret, "segredo");
        assert_eq!(config.database.key_phrase, "frase");
        assert_eq!(config.notifications.base_url.as_deref(), Some("http://push.local"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reads_file_and_reports_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("clinic-network.toml");
        std::fs::write(&good, "[log]\njson = true\n").unwrap();
        let config = AppConfig::from_file(&good).unwrap();
        assert!(config.log.json);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[server\n").unwrap();
        assert!(AppConfig::from_file(&bad).is_err());
        assert!(AppConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}

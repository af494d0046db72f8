//! Armazenamento da rede de clínicas: pool SQLite, migrações versionadas,
//! modelos de linha e cifragem dos snapshots de paciente.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use tracing::info;

pub mod crypto;
pub mod error;
pub mod migrations;
pub mod models;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Arquivo SQLite; diretórios ausentes são criados
    pub db_path: String,
    /// Frase-chave da instalação; protege a chave dos snapshots de paciente
    /// via Argon2id
    pub key_phrase: String,
    pub max_connections: u32,
    /// Nível de trace do SQL (0 desliga o log de comandos)
    pub trace_level: u8,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            db_path: "data/clinic-network.db".to_string(),
            // Sem frase padrão; a configuração precisa fornecer uma
            key_phrase: String::new(),
            max_connections: 5,
            trace_level: 0,
        }
    }
}

/// Abre o pool (WAL, chaves estrangeiras) e aplica as migrações pendentes
pub async fn init_db_pool(config: &DbConfig) -> Result<SqlitePool> {
    let db_path = Path::new(&config.db_path);

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .context("Falha ao criar diretório para banco de dados")?;
        }
    }

    let mut connection_options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .pragma("synchronous", "NORMAL");

    if config.trace_level == 0 {
        connection_options = connection_options.disable_statement_logging();
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(connection_options)
        .await
        .context("Falha ao conectar ao banco de dados SQLite")?;

    migrations::run_migrations(&pool)
        .await
        .context("Falha ao aplicar migrações")?;

    info!(db_path = %config.db_path, "Banco de dados pronto");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn creates_parent_dir_and_enables_foreign_keys() -> Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("nested").join("test.db");

        let config = DbConfig {
            db_path: db_path.to_string_lossy().into_owned(),
            key_phrase: "test_password".to_string(),
            max_connections: 2,
            trace_level: 3,
        };

        let pool = init_db_pool(&config).await?;

        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await?;
        assert_eq!(foreign_keys, 1);

        Ok(())
    }

    #[tokio::test]
    async fn master_key_is_stable_and_phrase_checked() -> Result<()> {
        let temp_dir = tempdir()?;
        let config = DbConfig {
            db_path: temp_dir.path().join("keys.db").to_string_lossy().into_owned(),
            key_phrase: "test_password".to_string(),
            ..DbConfig::default()
        };

        let pool = init_db_pool(&config).await?;
        let first = crypto::load_or_create_master_key(&pool, &config.key_phrase).await?;
        let second = crypto::load_or_create_master_key(&pool, &config.key_phrase).await?;
        assert_eq!(first.as_bytes(), second.as_bytes());

        let wrong = crypto::load_or_create_master_key(&pool, "outra-frase").await;
        assert!(matches!(wrong, Err(error::DbError::CryptoError(_))));
        Ok(())
    }
}

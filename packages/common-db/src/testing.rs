//! Utilidades de teste: banco temporário já migrado e com chave de dados

use anyhow::Result;
use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::crypto::{self, EncryptionKey};
use crate::{init_db_pool, DbConfig};

/// Banco SQLite descartável; o diretório é removido no drop
pub struct TestDb {
    pub pool: SqlitePool,
    pub key: EncryptionKey,
    _dir: TempDir,
}

pub async fn temp_db() -> Result<TestDb> {
    let dir = tempfile::tempdir()?;
    let config = DbConfig {
        db_path: dir.path().join("test.db").to_string_lossy().into_owned(),
        key_phrase: "test_password".to_string(),
        max_connections: 4,
        trace_level: 0,
    };

    let pool = init_db_pool(&config).await?;
    let key = crypto::load_or_create_master_key(&pool, &config.key_phrase).await?;
    Ok(TestDb { pool, key, _dir: dir })
}

//! Sistema de migrações para banco de dados
//!
//! Este módulo gerencia as migrações do banco de dados SQLite

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{error, info};

/// Lista de migrações SQL a serem aplicadas
const MIGRATIONS: &[&str] = &[
    // 001_network_schema.sql
    r#"
    -- Clínicas participantes da rede
    CREATE TABLE IF NOT EXISTS clinics (
        id BLOB PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        address TEXT,
        phone TEXT,
        email TEXT,
        owner_id BLOB NOT NULL,
        created_at TEXT NOT NULL
    );

    -- Profissionais aliados independentes
    CREATE TABLE IF NOT EXISTS allies (
        id BLOB PRIMARY KEY NOT NULL,
        full_name TEXT NOT NULL,
        specialty TEXT,
        phone TEXT,
        email TEXT,
        user_id BLOB NOT NULL,
        created_at TEXT NOT NULL
    );

    -- Planos de serviço oferecidos pela clínica
    CREATE TABLE IF NOT EXISTS patient_service_plans (
        id BLOB PRIMARY KEY NOT NULL,
        clinic_id BLOB NOT NULL,
        name TEXT NOT NULL,
        duration_days INTEGER NOT NULL CHECK (duration_days > 0),
        max_consultations INTEGER,
        created_at TEXT NOT NULL,
        FOREIGN KEY (clinic_id) REFERENCES clinics (id) ON DELETE CASCADE
    );

    -- Grupos de pacientes que compartilham uma assinatura
    CREATE TABLE IF NOT EXISTS patient_groups (
        id BLOB PRIMARY KEY NOT NULL,
        clinic_id BLOB NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (clinic_id) REFERENCES clinics (id) ON DELETE CASCADE
    );

    -- Pacientes; user_id nulo significa paciente sem acesso ao portal
    CREATE TABLE IF NOT EXISTS persons (
        id BLOB PRIMARY KEY NOT NULL,
        clinic_id BLOB NOT NULL,
        user_id BLOB,
        full_name TEXT NOT NULL,
        phone TEXT,
        email TEXT,
        group_id BLOB,
        current_plan_id BLOB,
        subscription_start TEXT,
        subscription_end TEXT,
        points INTEGER NOT NULL DEFAULT 0,
        rank TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY (clinic_id) REFERENCES clinics (id) ON DELETE CASCADE,
        FOREIGN KEY (group_id) REFERENCES patient_groups (id) ON DELETE SET NULL,
        FOREIGN KEY (current_plan_id) REFERENCES patient_service_plans (id) ON DELETE SET NULL
    );

    -- Uma única assinatura compartilhada por grupo
    CREATE TABLE IF NOT EXISTS shared_subscriptions (
        id BLOB PRIMARY KEY NOT NULL,
        group_id BLOB NOT NULL UNIQUE,
        plan_id BLOB NOT NULL,
        start_date TEXT NOT NULL,
        end_date TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (group_id) REFERENCES patient_groups (id) ON DELETE CASCADE,
        FOREIGN KEY (plan_id) REFERENCES patient_service_plans (id)
    );

    -- Parcerias entre duas partes (clínica ou aliado)
    CREATE TABLE IF NOT EXISTS partnerships (
        id BLOB PRIMARY KEY NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('clinic_clinic', 'clinic_ally', 'ally_ally')),
        requester_kind TEXT NOT NULL CHECK (requester_kind IN ('clinic', 'ally')),
        requester_id BLOB NOT NULL,
        responder_kind TEXT NOT NULL CHECK (responder_kind IN ('clinic', 'ally')),
        responder_id BLOB NOT NULL,
        pair_key TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('pending', 'active', 'rejected', 'revoked')),
        created_at TEXT NOT NULL,
        responded_at TEXT,
        revoked_at TEXT,
        CHECK (requester_id <> responder_id)
    );

    -- Encaminhamentos; o snapshot do paciente fica criptografado
    CREATE TABLE IF NOT EXISTS referrals (
        id BLOB PRIMARY KEY NOT NULL,
        sender_kind TEXT NOT NULL CHECK (sender_kind IN ('clinic', 'ally')),
        sender_id BLOB NOT NULL,
        receiver_kind TEXT NOT NULL CHECK (receiver_kind IN ('clinic', 'ally')),
        receiver_id BLOB NOT NULL,
        person_id BLOB,
        consent_request_id BLOB UNIQUE,
        patient_info_ciphertext BLOB NOT NULL,
        patient_info_nonce BLOB NOT NULL,
        notes TEXT,
        consent_attested BOOLEAN NOT NULL DEFAULT 0,
        status TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'rejected')),
        created_at TEXT NOT NULL,
        responded_at TEXT,
        FOREIGN KEY (person_id) REFERENCES persons (id) ON DELETE SET NULL
    );

    -- Pedidos de consentimento para pacientes com acesso ao portal
    CREATE TABLE IF NOT EXISTS consent_requests (
        id BLOB PRIMARY KEY NOT NULL,
        clinic_id BLOB NOT NULL,
        person_id BLOB NOT NULL,
        receiver_kind TEXT NOT NULL CHECK (receiver_kind IN ('clinic', 'ally')),
        receiver_id BLOB NOT NULL,
        notes TEXT,
        patient_info_ciphertext BLOB NOT NULL,
        patient_info_nonce BLOB NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'rejected')),
        created_at TEXT NOT NULL,
        responded_at TEXT,
        FOREIGN KEY (clinic_id) REFERENCES clinics (id) ON DELETE CASCADE,
        FOREIGN KEY (person_id) REFERENCES persons (id) ON DELETE CASCADE
    );

    -- Chave de dados embrulhada pela frase-chave da instalação
    CREATE TABLE IF NOT EXISTS master_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT 0,
        kdf_salt BLOB NOT NULL,
        wrapped_key_ciphertext BLOB NOT NULL,
        wrapped_key_nonce BLOB NOT NULL,
        key_version INTEGER NOT NULL
    );

    -- No máximo uma parceria pendente ou ativa por par de partes
    CREATE UNIQUE INDEX IF NOT EXISTS ux_partnerships_open_pair
        ON partnerships (pair_key) WHERE status IN ('pending', 'active');

    -- Índices para otimização
    CREATE INDEX IF NOT EXISTS idx_partnerships_requester ON partnerships (requester_kind, requester_id);
    CREATE INDEX IF NOT EXISTS idx_partnerships_responder ON partnerships (responder_kind, responder_id);
    CREATE INDEX IF NOT EXISTS idx_referrals_sender ON referrals (sender_kind, sender_id);
    CREATE INDEX IF NOT EXISTS idx_referrals_receiver ON referrals (receiver_kind, receiver_id);
    CREATE INDEX IF NOT EXISTS idx_referrals_person_id ON referrals (person_id);
    CREATE INDEX IF NOT EXISTS idx_consent_requests_person_id ON consent_requests (person_id);
    CREATE INDEX IF NOT EXISTS idx_consent_requests_clinic_id ON consent_requests (clinic_id);
    CREATE INDEX IF NOT EXISTS idx_persons_clinic_id ON persons (clinic_id);
    CREATE INDEX IF NOT EXISTS idx_persons_group_id ON persons (group_id);
    "#,
];

/// Número de migrações conhecidas por esta versão da biblioteca
pub fn schema_version() -> i64 {
    MIGRATIONS.len() as i64
}

/// Executa todas as migrações pendentes no banco de dados
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Aplicando migrações de banco de dados...");

    // Obter a versão atual do banco de dados
    let mut version: i64 = 0;
    match sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
    {
        Ok(v) => version = v,
        Err(e) => {
            error!("Erro ao obter versão do banco: {}", e);
            // Continuar mesmo assim, pois pode ser a primeira execução
        }
    }

    info!("Versão atual do banco: {}", version);

    for (i, migration_sql) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as i64;

        if migration_version <= version {
            info!("Migração {} já aplicada", migration_version);
            continue;
        }

        info!("Aplicando migração {}...", migration_version);

        let mut transaction = pool.begin().await.with_context(|| {
            format!("Falha ao iniciar transação para migração {}", migration_version)
        })?;

        sqlx::query(migration_sql)
            .execute(&mut *transaction)
            .await
            .with_context(|| format!("Falha ao executar migração {}", migration_version))?;

        sqlx::query(&format!("PRAGMA user_version = {}", migration_version))
            .execute(&mut *transaction)
            .await
            .with_context(|| format!("Falha ao atualizar versão para {}", migration_version))?;

        transaction.commit().await.with_context(|| {
            format!("Falha ao confirmar transação para migração {}", migration_version)
        })?;

        info!("Migração {} aplicada com sucesso", migration_version);
    }

    info!("Migrações concluídas. Versão atual: {}", schema_version());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::migrate::MigrateDatabase;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::Sqlite;
    use tempfile::tempdir;

    async fn fresh_pool(dir: &std::path::Path) -> Result<SqlitePool> {
        let db_path = dir.join("test_migrations.db");
        let db_url = format!("sqlite:{}", db_path.display());
        Sqlite::create_database(&db_url).await?;

        let conn_options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        Ok(SqlitePool::connect_with(conn_options).await?)
    }

    #[tokio::test]
    async fn test_migrations() -> Result<()> {
        let temp_dir = tempdir()?;
        let pool = fresh_pool(temp_dir.path()).await?;

        run_migrations(&pool).await?;

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&pool)
            .await?;
        assert_eq!(version, schema_version());

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&pool)
        .await?;

        for expected in [
            "clinics",
            "allies",
            "persons",
            "partnerships",
            "referrals",
            "consent_requests",
            "shared_subscriptions",
            "master_keys",
        ] {
            assert!(tables.contains(&expected.to_string()), "faltando {}", expected);
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() -> Result<()> {
        let temp_dir = tempdir()?;
        let pool = fresh_pool(temp_dir.path()).await?;

        run_migrations(&pool).await?;
        run_migrations(&pool).await?;

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&pool)
            .await?;
        assert_eq!(version, schema_version());
        Ok(())
    }

    #[tokio::test]
    async fn test_open_pair_index_rejects_second_pending() -> Result<()> {
        let temp_dir = tempdir()?;
        let pool = fresh_pool(temp_dir.path()).await?;
        run_migrations(&pool).await?;

        let insert = "INSERT INTO partnerships (id, kind, requester_kind, requester_id, \
                      responder_kind, responder_id, pair_key, status, created_at) \
                      VALUES (?, 'clinic_clinic', 'clinic', ?, 'clinic', ?, 'a|b', ?, '2024-01-01T00:00:00Z')";
        let (a, b) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());

        sqlx::query(insert)
            .bind(uuid::Uuid::new_v4())
            .bind(a)
            .bind(b)
            .bind("rejected")
            .execute(&pool)
            .await?;
        sqlx::query(insert)
            .bind(uuid::Uuid::new_v4())
            .bind(a)
            .bind(b)
            .bind("pending")
            .execute(&pool)
            .await?;
        let duplicate = sqlx::query(insert)
            .bind(uuid::Uuid::new_v4())
            .bind(b)
            .bind(a)
            .bind("active")
            .execute(&pool)
            .await;

        let err = crate::error::DbError::from(duplicate.unwrap_err());
        assert!(matches!(err, crate::error::DbError::UniqueViolation(_)));
        Ok(())
    }
}

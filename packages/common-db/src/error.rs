//! Erros da camada de armazenamento da rede

use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Error, Debug)]
pub enum DbError {
    /// Pool fechado, timeout ou falha de E/S
    #[error("Banco de dados indisponível: {0}")]
    ConnectionError(String),

    #[error("Erro de consulta: {0}")]
    QueryError(String),

    #[error("Registro não encontrado: {0}")]
    NotFound(String),

    /// Índice UNIQUE, inclusive os parciais (parceria aberta por par)
    #[error("Registro duplicado: {0}")]
    UniqueViolation(String),

    /// CHECK ou chave estrangeira
    #[error("Violação de restrição: {0}")]
    ConstraintViolation(String),

    #[error("Erro de criptografia: {0}")]
    CryptoError(String),

    #[error("Erro interno: {0}")]
    InternalError(String),
}

impl From<sqlx::Error> for DbError {
    fn from(error: sqlx::Error) -> Self {
        use sqlx::Error as E;

        match error {
            E::RowNotFound => DbError::NotFound("consulta sem resultado".to_string()),
            E::Database(dbe) if dbe.is_unique_violation() => {
                DbError::UniqueViolation(dbe.message().to_string())
            }
            E::Database(dbe) if dbe.is_check_violation() || dbe.is_foreign_key_violation() => {
                DbError::ConstraintViolation(dbe.message().to_string())
            }
            E::Database(dbe) => DbError::QueryError(dbe.message().to_string()),
            E::ColumnNotFound(_) | E::TypeNotFound { .. } | E::ColumnDecode { .. } => {
                DbError::QueryError(error.to_string())
            }
            E::Io(_) | E::Configuration(_) | E::PoolClosed | E::PoolTimedOut => {
                DbError::ConnectionError(error.to_string())
            }
            other => DbError::InternalError(other.to_string()),
        }
    }
}

impl From<CryptoError> for DbError {
    fn from(error: CryptoError) -> Self {
        DbError::CryptoError(error.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(error: serde_json::Error) -> Self {
        DbError::InternalError(format!("Snapshot JSON inválido: {}", error))
    }
}

//! Erros do serviço de rede com mapeamento para respostas HTTP

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_db::error::DbError;
use serde::Serialize;
use thiserror::Error;

/// Corpo JSON de erro devolvido aos clientes
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum NetworkError {
    /// Ator sem permissão para esta transição
    #[error("Operação não permitida: {0}")]
    Forbidden(String),

    /// Transição a partir do status errado
    #[error("Status inválido para esta operação: {0}")]
    InvalidState(String),

    #[error("Já existe uma parceria pendente ou ativa entre estas partes")]
    DuplicateActiveRelationship,

    #[error("Encaminhamento direto exige declaração de consentimento manual")]
    ConsentRequired,

    #[error("Plano não encontrado: {0}")]
    PlanNotFound(uuid::Uuid),

    #[error("{entity} não encontrado(a): {id}")]
    NotFound { entity: &'static str, id: uuid::Uuid },

    #[error("Dados inválidos: {0}")]
    Validation(String),

    #[error("Autenticação necessária")]
    Unauthorized,

    #[error(transparent)]
    Storage(#[from] DbError),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl NetworkError {
    pub fn not_found(entity: &'static str, id: uuid::Uuid) -> Self {
        NetworkError::NotFound { entity, id }
    }

    pub fn code(&self) -> &'static str {
        match self {
            NetworkError::Forbidden(_) => "FORBIDDEN",
            NetworkError::InvalidState(_) => "INVALID_STATE",
            NetworkError::DuplicateActiveRelationship => "DUPLICATE_ACTIVE_RELATIONSHIP",
            NetworkError::ConsentRequired => "CONSENT_REQUIRED",
            NetworkError::PlanNotFound(_) => "PLAN_NOT_FOUND",
            NetworkError::NotFound { .. } => "NOT_FOUND",
            NetworkError::Validation(_) => "BAD_REQUEST",
            NetworkError::Unauthorized => "AUTH_REQUIRED",
            NetworkError::Storage(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            NetworkError::Forbidden(_) => StatusCode::FORBIDDEN,
            NetworkError::InvalidState(_) | NetworkError::DuplicateActiveRelationship => {
                StatusCode::CONFLICT
            }
            NetworkError::ConsentRequired => StatusCode::UNPROCESSABLE_ENTITY,
            NetworkError::PlanNotFound(_) | NetworkError::NotFound { .. } => StatusCode::NOT_FOUND,
            NetworkError::Validation(_) => StatusCode::BAD_REQUEST,
            NetworkError::Unauthorized => StatusCode::UNAUTHORIZED,
            NetworkError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for NetworkError {
    fn from(error: sqlx::Error) -> Self {
        NetworkError::Storage(DbError::from(error))
    }
}

impl From<validator::ValidationErrors> for NetworkError {
    fn from(errors: validator::ValidationErrors) -> Self {
        NetworkError::Validation(errors.to_string())
    }
}

impl IntoResponse for NetworkError {
    fn into_response(self) -> Response {
        let message = match &self {
            NetworkError::Storage(detail) => {
                tracing::error!(%detail, "Erro interno de armazenamento");
                "Ocorreu um erro interno".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message,
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

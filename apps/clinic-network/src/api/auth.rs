//! Autenticação por bearer JWT (HS256) emitido pelo provedor de identidade

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use common_db::models::Party;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::error::{NetworkError, NetworkResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Usuário autenticado
    pub sub: Uuid,
    /// Parte em nome da qual a sessão age (equipe da clínica ou aliado)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party: Option<Party>,
    pub exp: i64,
}

/// Quem está chamando
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: Uuid,
    pub party: Option<Party>,
}

impl Actor {
    /// Operações de parte exigem a parte no token
    pub fn require_party(&self) -> NetworkResult<Party> {
        self.party.ok_or_else(|| {
            NetworkError::Forbidden("a sessão não age em nome de uma parte".to_string())
        })
    }
}

pub fn issue_token(
    secret: &str,
    user_id: Uuid,
    party: Option<Party>,
    ttl: chrono::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id,
        party,
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn verify_token(secret: &str, token: &str) -> NetworkResult<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| {
        debug!(error = %e, "Token rejeitado");
        NetworkError::Unauthorized
    })?;
    Ok(data.claims)
}

#[async_trait]
impl FromRequestParts<AppState> for Actor {
    type Rejection = NetworkError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(NetworkError::Unauthorized)?;

        let claims = verify_token(&state.jwt_secret, token)?;
        Ok(Actor {
            user_id: claims.sub,
            party: claims.party,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_carries_party() {
        let party = Party::Ally(Uuid::new_v4());
        let user = Uuid::new_v4();
        let token = issue_token("segredo", user, Some(party), chrono::Duration::minutes(5)).unwrap();

        let claims = verify_token("segredo", &token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.party, Some(party));
    }

    #[test]
    fn wrong_secret_or_expired_is_unauthorized() {
        let token = issue_token("segredo", Uuid::new_v4(), None, chrono::Duration::minutes(5)).unwrap();
        assert!(matches!(verify_token("outro", &token), Err(NetworkError::Unauthorized)));

        let expired =
            issue_token("segredo", Uuid::new_v4(), None, chrono::Duration::hours(-2)).unwrap();
        assert!(matches!(verify_token("segredo", &expired), Err(NetworkError::Unauthorized)));
    }

    #[test]
    fn patient_session_has_no_party() {
        let actor = Actor {
            user_id: Uuid::new_v4(),
            party: None,
        };
        assert!(matches!(actor.require_party(), Err(NetworkError::Forbidden(_))));
    }
}

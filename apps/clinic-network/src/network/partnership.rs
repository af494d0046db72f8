//! Registro de parcerias.
//!
//! `(nenhuma) -> pending -> {active, rejected}`, `active -> revoked`. Um novo
//! pedido depois de `rejected`/`revoked` cria outro registro em `pending`.
//! O índice único parcial em `pair_key` garante no máximo uma parceria
//! pendente ou ativa por par.

use chrono::Utc;
use common_db::error::DbError;
use common_db::models::{Party, Partnership, PartnershipKind, PartnershipStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::NetworkService;
use crate::error::{NetworkError, NetworkResult};
use crate::events::EntityKind;

/// Decisão do destinatário sobre um pedido pendente
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnershipDecision {
    Active,
    Rejected,
}

impl PartnershipDecision {
    pub fn status(&self) -> PartnershipStatus {
        match self {
            PartnershipDecision::Active => PartnershipStatus::Active,
            PartnershipDecision::Rejected => PartnershipStatus::Rejected,
        }
    }
}

impl NetworkService {
    pub async fn request_partnership(
        &self,
        requester: Party,
        responder: Party,
        kind: PartnershipKind,
    ) -> NetworkResult<Partnership> {
        if requester == responder {
            return Err(NetworkError::Validation(
                "uma parte não pode se conectar consigo mesma".to_string(),
            ));
        }
        if PartnershipKind::between(requester, responder) != kind {
            return Err(NetworkError::Validation(format!(
                "tipo de parceria {} não corresponde às partes",
                kind.as_str()
            )));
        }

        let requester_profile = self.load_party(requester).await?;
        let responder_profile = self.load_party(responder).await?;

        let partnership = Partnership {
            id: Uuid::new_v4(),
            kind,
            requester,
            responder,
            status: PartnershipStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
            revoked_at: None,
        };

        let inserted = sqlx::query(
            "INSERT INTO partnerships (id, kind, requester_kind, requester_id, responder_kind, \
             responder_id, pair_key, status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(partnership.id)
        .bind(kind.as_str())
        .bind(requester.kind().as_str())
        .bind(requester.id())
        .bind(responder.kind().as_str())
        .bind(responder.id())
        .bind(Party::pair_key(requester, responder))
        .bind(PartnershipStatus::Pending.as_str())
        .bind(partnership.created_at)
        .execute(self.pool())
        .await;

        if let Err(e) = inserted {
            return match DbError::from(e) {
                DbError::UniqueViolation(_) => {
                    warn!(%requester, %responder, "Parceria pendente ou ativa já existe");
                    Err(NetworkError::DuplicateActiveRelationship)
                }
                other => Err(other.into()),
            };
        }

        info!(partnership_id = %partnership.id, %requester, %responder, "Parceria solicitada");
        self.events()
            .publish(EntityKind::Partnership, partnership.id, vec![requester, responder]);
        self.notifier.notify(
            responder_profile.owner_user_id,
            "Nova solicitação de parceria",
            format!("{} quer se conectar com você", requester_profile.name),
        );

        Ok(partnership)
    }

    /// Só o destinatário decide; a transição só vale a partir de `pending`
    pub async fn respond_to_partnership(
        &self,
        partnership_id: Uuid,
        acting: Party,
        decision: PartnershipDecision,
    ) -> NetworkResult<Partnership> {
        let mut partnership = self.get_partnership(partnership_id).await?;
        if partnership.responder != acting {
            warn!(%partnership_id, %acting, "Resposta de parceria por quem não é o destinatário");
            return Err(NetworkError::Forbidden(
                "apenas o destinatário pode responder ao pedido".to_string(),
            ));
        }

        let status = decision.status();
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE partnerships SET status = ?, responded_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(partnership_id)
        .execute(self.pool())
        .await?;

        if updated.rows_affected() == 0 {
            return Err(NetworkError::InvalidState(
                "a parceria não está pendente".to_string(),
            ));
        }

        partnership.status = status;
        partnership.responded_at = Some(now);

        info!(%partnership_id, %status, "Parceria respondida");
        self.events().publish(
            EntityKind::Partnership,
            partnership_id,
            vec![partnership.requester, partnership.responder],
        );
        Ok(partnership)
    }

    /// Qualquer uma das partes encerra uma parceria ativa
    pub async fn revoke_partnership(
        &self,
        partnership_id: Uuid,
        acting: Party,
    ) -> NetworkResult<Partnership> {
        let mut partnership = self.get_partnership(partnership_id).await?;
        if !partnership.involves(acting) {
            return Err(NetworkError::Forbidden(
                "apenas as partes da parceria podem revogá-la".to_string(),
            ));
        }

        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE partnerships SET status = 'revoked', revoked_at = ? WHERE id = ? AND status = 'active'",
        )
        .bind(now)
        .bind(partnership_id)
        .execute(self.pool())
        .await?;

        if updated.rows_affected() == 0 {
            return Err(NetworkError::InvalidState(
                "apenas parcerias ativas podem ser revogadas".to_string(),
            ));
        }

        partnership.status = PartnershipStatus::Revoked;
        partnership.revoked_at = Some(now);

        info!(%partnership_id, %acting, "Parceria revogada");
        self.events().publish(
            EntityKind::Partnership,
            partnership_id,
            vec![partnership.requester, partnership.responder],
        );
        Ok(partnership)
    }

    pub async fn get_partnership(&self, partnership_id: Uuid) -> NetworkResult<Partnership> {
        sqlx::query_as::<_, Partnership>("SELECT * FROM partnerships WHERE id = ?")
            .bind(partnership_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| NetworkError::not_found("Parceria", partnership_id))
    }

    /// Todas as parcerias da parte, mais recentes primeiro
    pub async fn list_partnerships(&self, party: Party) -> NetworkResult<Vec<Partnership>> {
        let rows = sqlx::query_as::<_, Partnership>(
            "SELECT * FROM partnerships \
             WHERE (requester_kind = ?1 AND requester_id = ?2) \
                OR (responder_kind = ?1 AND responder_id = ?2) \
             ORDER BY created_at DESC",
        )
        .bind(party.kind().as_str())
        .bind(party.id())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn has_active_partnership(&self, a: Party, b: Party) -> NetworkResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM partnerships WHERE pair_key = ? AND status = 'active' LIMIT 1",
        )
        .bind(Party::pair_key(a, b))
        .fetch_optional(self.pool())
        .await?;
        Ok(found.is_some())
    }
}

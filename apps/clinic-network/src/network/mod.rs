//! Regras da rede de clínicas: parcerias, encaminhamentos, consentimento,
//! diretório e assinaturas compartilhadas.
//!
//! Toda transição com invariante ("no máximo um X ativo") é uma única
//! atualização condicional no banco (`UPDATE ... WHERE status = ?`) ou é
//! garantida por índice único. Eventos e notificações saem depois do commit.

use std::sync::Arc;

use common_db::crypto::EncryptionKey;
use common_db::models::{Party, PartyKind};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{NetworkError, NetworkResult};
use crate::events::EventBus;
use crate::notify::NotificationDispatcher;

pub mod consent;
pub mod directory;
pub mod partnership;
pub mod referral;
pub mod registry;
pub mod subscription;

pub use consent::{decide_consent_path, ConsentPath};
pub use directory::{DirectoryEntry, OfferedAction};
pub use partnership::PartnershipDecision;
pub use referral::{NewReferral, PatientRef, ReferralDecision, ReferralDirection, ReferralOutcome};
pub use registry::{NewAlly, NewClinic, NewPerson};

/// Ponto de entrada das operações da rede; clonar é barato
#[derive(Clone)]
pub struct NetworkService {
    pool: SqlitePool,
    key: Arc<EncryptionKey>,
    events: EventBus,
    notifier: NotificationDispatcher,
}

/// Dados de exibição e contato de uma parte
#[derive(Debug, Clone)]
pub struct PartyProfile {
    pub party: Party,
    pub name: String,
    /// Usuário que recebe as notificações da parte
    pub owner_user_id: Uuid,
}

impl NetworkService {
    pub fn new(
        pool: SqlitePool,
        key: EncryptionKey,
        events: EventBus,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self {
            pool,
            key: Arc::new(key),
            events,
            notifier,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn key(&self) -> &EncryptionKey {
        &self.key
    }

    /// Carrega nome e dono da parte; `NotFound` se ela não existe
    pub async fn load_party(&self, party: Party) -> NetworkResult<PartyProfile> {
        let sql = match party.kind() {
            PartyKind::Clinic => "SELECT name, owner_id FROM clinics WHERE id = ?",
            PartyKind::Ally => "SELECT full_name, user_id FROM allies WHERE id = ?",
        };

        let row: Option<(String, Uuid)> = sqlx::query_as(sql)
            .bind(party.id())
            .fetch_optional(&self.pool)
            .await?;

        let (name, owner_user_id) = row.ok_or_else(|| match party.kind() {
            PartyKind::Clinic => NetworkError::not_found("Clínica", party.id()),
            PartyKind::Ally => NetworkError::not_found("Aliado", party.id()),
        })?;

        Ok(PartyProfile {
            party,
            name,
            owner_user_id,
        })
    }
}

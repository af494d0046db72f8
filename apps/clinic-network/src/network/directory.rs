//! Diretório de contrapartes com o status da relação.
//!
//! Projeção somente leitura; é recalculada a cada chamada, e os clientes
//! chamam de novo quando recebem um evento de mudança.

use std::collections::HashMap;

use common_db::models::{Party, PartyKind, Partnership, PartnershipStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::NetworkService;
use crate::error::NetworkResult;

/// Ação oferecida ao usuário para a contraparte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferedAction {
    /// Nenhuma parceria ainda
    Connect,
    /// A última foi recusada ou revogada
    ReRequest,
    /// Pedido enviado, aguardando a outra parte
    Pending,
    /// Pedido recebido, cabe a nós responder
    Respond,
    /// Parceria ativa
    Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub party: Party,
    pub name: String,
    /// Endereço da clínica ou especialidade do aliado
    pub detail: Option<String>,
    pub partnership_id: Option<Uuid>,
    pub status: Option<PartnershipStatus>,
    pub action: OfferedAction,
}

fn precedence(status: PartnershipStatus) -> u8 {
    match status {
        PartnershipStatus::Active => 3,
        PartnershipStatus::Pending => 2,
        PartnershipStatus::Rejected | PartnershipStatus::Revoked => 1,
    }
}

/// Escolhe a parceria que define a exibição: maior precedência de status,
/// empate resolvido pela mais recente
pub fn most_relevant<'a>(
    candidates: impl IntoIterator<Item = &'a Partnership>,
) -> Option<&'a Partnership> {
    candidates
        .into_iter()
        .max_by_key(|p| (precedence(p.status), p.created_at))
}

pub fn offered_action(self_party: Party, partnership: Option<&Partnership>) -> OfferedAction {
    let Some(partnership) = partnership else {
        return OfferedAction::Connect;
    };
    match partnership.status {
        PartnershipStatus::Active => OfferedAction::Message,
        PartnershipStatus::Pending if partnership.responder == self_party => OfferedAction::Respond,
        PartnershipStatus::Pending => OfferedAction::Pending,
        PartnershipStatus::Rejected | PartnershipStatus::Revoked => OfferedAction::ReRequest,
    }
}

impl NetworkService {
    /// Todas as partes do tipo pedido, exceto a própria, ordenadas por nome
    pub async fn list_counterparts_with_status(
        &self,
        self_party: Party,
        kind: PartyKind,
    ) -> NetworkResult<Vec<DirectoryEntry>> {
        let sql = match kind {
            PartyKind::Clinic => "SELECT id, name, address FROM clinics ORDER BY name",
            PartyKind::Ally => "SELECT id, full_name, specialty FROM allies ORDER BY full_name",
        };
        let counterparts: Vec<(Uuid, String, Option<String>)> =
            sqlx::query_as(sql).fetch_all(self.pool()).await?;

        let partnerships = self.list_partnerships(self_party).await?;
        let mut by_counterpart: HashMap<Party, Vec<&Partnership>> = HashMap::new();
        for partnership in &partnerships {
            if let Some(other) = partnership.counterpart_of(self_party) {
                by_counterpart.entry(other).or_default().push(partnership);
            }
        }

        let entries = counterparts
            .into_iter()
            .map(|(id, name, detail)| (Party::new(kind, id), name, detail))
            .filter(|(party, _, _)| *party != self_party)
            .map(|(party, name, detail)| {
                let relevant = by_counterpart
                    .get(&party)
                    .and_then(|found| most_relevant(found.iter().copied()));
                DirectoryEntry {
                    party,
                    name,
                    detail,
                    partnership_id: relevant.map(|p| p.id),
                    status: relevant.map(|p| p.status),
                    action: offered_action(self_party, relevant),
                }
            })
            .collect();
        Ok(entries)
    }
}

//! Livro de encaminhamentos.
//!
//! Dois caminhos de criação: direto (paciente sem portal ou só snapshot,
//! exige declaração de consentimento manual) e com consentimento (paciente
//! com conta no portal; gera um pedido de consentimento e nenhum
//! encaminhamento até a aprovação).

use chrono::Utc;
use common_db::crypto::EncryptedData;
use common_db::error::DbError;
use common_db::models::{
    name_contains, ConsentRequest, EncryptedReferral, Party, PatientInfo, Referral, ReferralStatus,
};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, SqliteConnection};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::consent::{decide_consent_path, ConsentPath};
use super::NetworkService;
use crate::error::{NetworkError, NetworkResult};
use crate::events::EntityKind;

/// Paciente encaminhado: registro da clínica ou apenas um snapshot livre
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientRef {
    Person(Uuid),
    Snapshot(PatientInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReferral {
    pub receiver: Party,
    pub patient: PatientRef,
    pub notes: Option<String>,
    /// Declaração do profissional de que o paciente consentiu por escrito
    #[serde(default)]
    pub consent_attested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum ReferralOutcome {
    Created(Referral),
    ConsentRequested(ConsentRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralDecision {
    Accepted,
    Rejected,
}

impl ReferralDecision {
    pub fn status(&self) -> ReferralStatus {
        match self {
            ReferralDecision::Accepted => ReferralStatus::Accepted,
            ReferralDecision::Rejected => ReferralStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralDirection {
    Incoming,
    Outgoing,
    #[default]
    All,
}

impl ReferralDirection {
    /// Cláusula sobre `referrals r`, com a parte em `?1`/`?2`
    fn filter(self) -> &'static str {
        match self {
            ReferralDirection::Incoming => "(r.receiver_kind = ?1 AND r.receiver_id = ?2)",
            ReferralDirection::Outgoing => "(r.sender_kind = ?1 AND r.sender_id = ?2)",
            ReferralDirection::All => {
                "((r.sender_kind = ?1 AND r.sender_id = ?2) \
                 OR (r.receiver_kind = ?1 AND r.receiver_id = ?2))"
            }
        }
    }
}

/// Grava um encaminhamento com o snapshot já cifrado
pub(crate) async fn insert_referral(
    conn: &mut SqliteConnection,
    referral: &Referral,
    sealed: &EncryptedData,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO referrals (id, sender_kind, sender_id, receiver_kind, receiver_id, person_id, \
         consent_request_id, patient_info_ciphertext, patient_info_nonce, notes, consent_attested, \
         status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(referral.id)
    .bind(referral.sender.kind().as_str())
    .bind(referral.sender.id())
    .bind(referral.receiver.kind().as_str())
    .bind(referral.receiver.id())
    .bind(referral.person_id)
    .bind(referral.consent_request_id)
    .bind(&sealed.ciphertext)
    .bind(&sealed.nonce)
    .bind(&referral.notes)
    .bind(referral.consent_attested)
    .bind(referral.status.as_str())
    .bind(referral.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

impl NetworkService {
    #[instrument(skip(self, new), fields(receiver = %new.receiver))]
    pub async fn create_referral(
        &self,
        sender: Party,
        new: NewReferral,
    ) -> NetworkResult<ReferralOutcome> {
        if sender == new.receiver {
            return Err(NetworkError::Validation(
                "remetente e destinatário são a mesma parte".to_string(),
            ));
        }
        let sender_profile = self.load_party(sender).await?;
        let receiver_profile = self.load_party(new.receiver).await?;

        if !self.has_active_partnership(sender, new.receiver).await? {
            warn!(%sender, "Encaminhamento sem parceria ativa");
            return Err(NetworkError::Forbidden(
                "não há parceria ativa com o destinatário".to_string(),
            ));
        }

        match new.patient {
            PatientRef::Person(person_id) => {
                let person = self.get_person(person_id).await?;
                if sender != Party::Clinic(person.clinic_id) {
                    return Err(NetworkError::Forbidden(
                        "o paciente não pertence à clínica remetente".to_string(),
                    ));
                }

                match decide_consent_path(&person) {
                    ConsentPath::Gated { user_id } => {
                        let request = self
                            .open_consent_request(
                                &person,
                                new.receiver,
                                new.notes,
                                &sender_profile.name,
                                &receiver_profile.name,
                            )
                            .await?;
                        info!(consent_request_id = %request.id, %user_id, "Encaminhamento aguardando consentimento");
                        Ok(ReferralOutcome::ConsentRequested(request))
                    }
                    ConsentPath::Direct => {
                        let referral = self
                            .create_direct_referral(
                                sender,
                                new.receiver,
                                Some(person.id),
                                person.snapshot(),
                                new.notes,
                                new.consent_attested,
                            )
                            .await?;
                        Ok(ReferralOutcome::Created(referral))
                    }
                }
            }
            PatientRef::Snapshot(info) => {
                if info.name.trim().is_empty() {
                    return Err(NetworkError::Validation(
                        "patient_info.name é obrigatório".to_string(),
                    ));
                }
                let referral = self
                    .create_direct_referral(
                        sender,
                        new.receiver,
                        None,
                        info,
                        new.notes,
                        new.consent_attested,
                    )
                    .await?;
                Ok(ReferralOutcome::Created(referral))
            }
        }
    }

    async fn create_direct_referral(
        &self,
        sender: Party,
        receiver: Party,
        person_id: Option<Uuid>,
        patient_info: PatientInfo,
        notes: Option<String>,
        consent_attested: bool,
    ) -> NetworkResult<Referral> {
        if !consent_attested {
            return Err(NetworkError::ConsentRequired);
        }

        let referral = Referral {
            id: Uuid::new_v4(),
            sender,
            receiver,
            person_id,
            consent_request_id: None,
            patient_info,
            notes,
            consent_attested: true,
            status: ReferralStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
        };
        let sealed = referral.patient_info.seal(self.key())?;

        let mut conn = self.pool().acquire().await?;
        insert_referral(&mut conn, &referral, &sealed).await?;

        info!(referral_id = %referral.id, %sender, %receiver, "Encaminhamento direto criado");
        self.events()
            .publish(EntityKind::Referral, referral.id, vec![sender, receiver]);
        Ok(referral)
    }

    /// Aceitar ou recusar cabe ao destinatário, e só a partir de `pending`
    pub async fn respond_to_referral(
        &self,
        referral_id: Uuid,
        decision: ReferralDecision,
        acting: Party,
    ) -> NetworkResult<Referral> {
        let mut referral = self.load_referral(referral_id).await?;
        if referral.receiver != acting {
            warn!(%referral_id, %acting, "Resposta de encaminhamento fora do destinatário");
            return Err(NetworkError::Forbidden(
                "apenas o destinatário pode responder ao encaminhamento".to_string(),
            ));
        }

        let status = decision.status();
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE referrals SET status = ?, responded_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(referral_id)
        .execute(self.pool())
        .await?;

        if updated.rows_affected() == 0 {
            return Err(NetworkError::InvalidState(
                "o encaminhamento não está pendente".to_string(),
            ));
        }

        referral.status = status;
        referral.responded_at = Some(now);

        info!(%referral_id, %status, "Encaminhamento respondido");
        self.events().publish(
            EntityKind::Referral,
            referral_id,
            vec![referral.sender, referral.receiver],
        );
        Ok(referral)
    }

    /// Remoção definitiva por qualquer participante, em qualquer status
    pub async fn delete_referral(&self, referral_id: Uuid, acting: Party) -> NetworkResult<()> {
        let referral = self.load_referral(referral_id).await?;
        if !referral.involves(acting) {
            return Err(NetworkError::Forbidden(
                "apenas participantes podem remover o encaminhamento".to_string(),
            ));
        }

        let deleted = sqlx::query("DELETE FROM referrals WHERE id = ?")
            .bind(referral_id)
            .execute(self.pool())
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(NetworkError::not_found("Encaminhamento", referral_id));
        }

        info!(%referral_id, %acting, "Encaminhamento removido");
        self.events().publish(
            EntityKind::Referral,
            referral_id,
            vec![referral.sender, referral.receiver],
        );
        Ok(())
    }

    pub async fn get_referral(&self, referral_id: Uuid, acting: Party) -> NetworkResult<Referral> {
        let referral = self.load_referral(referral_id).await?;
        if !referral.involves(acting) {
            return Err(NetworkError::Forbidden(
                "encaminhamento de outras partes".to_string(),
            ));
        }
        Ok(referral)
    }

    pub async fn list_referrals(
        &self,
        party: Party,
        direction: ReferralDirection,
    ) -> NetworkResult<Vec<Referral>> {
        let sql = format!(
            "SELECT * FROM referrals r WHERE {} ORDER BY r.created_at DESC",
            direction.filter()
        );

        let rows = sqlx::query_as::<_, EncryptedReferral>(&sql)
            .bind(party.kind().as_str())
            .bind(party.id())
            .fetch_all(self.pool())
            .await?;
        self.decrypt_referrals(rows)
    }

    /// Busca pelo nome gravado no snapshot da criação
    pub async fn search_referrals_by_snapshot(
        &self,
        party: Party,
        direction: ReferralDirection,
        query: &str,
    ) -> NetworkResult<Vec<Referral>> {
        let referrals = self.list_referrals(party, direction).await?;
        Ok(referrals
            .into_iter()
            .filter(|r| r.patient_info.name_matches(query))
            .collect())
    }

    /// Busca pelo nome atual do paciente vinculado; pode divergir do snapshot
    pub async fn search_referrals_by_person(
        &self,
        party: Party,
        direction: ReferralDirection,
        query: &str,
    ) -> NetworkResult<Vec<Referral>> {
        // lower() do SQLite só trata ASCII; a comparação fica no Rust
        let sql = format!(
            "SELECT r.*, p.full_name AS person_full_name \
             FROM referrals r JOIN persons p ON p.id = r.person_id \
             WHERE {} ORDER BY r.created_at DESC",
            direction.filter()
        );
        let rows = sqlx::query(&sql)
            .bind(party.kind().as_str())
            .bind(party.id())
            .fetch_all(self.pool())
            .await?;

        let mut matched = Vec::new();
        for row in &rows {
            let full_name: String = row.try_get("person_full_name")?;
            if name_contains(&full_name, query) {
                matched.push(EncryptedReferral::from_row(row)?);
            }
        }
        self.decrypt_referrals(matched)
    }

    pub(crate) async fn load_referral(&self, referral_id: Uuid) -> NetworkResult<Referral> {
        let row = sqlx::query_as::<_, EncryptedReferral>("SELECT * FROM referrals WHERE id = ?")
            .bind(referral_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| NetworkError::not_found("Encaminhamento", referral_id))?;
        Ok(row.decrypt(self.key())?)
    }

    fn decrypt_referrals(&self, rows: Vec<EncryptedReferral>) -> NetworkResult<Vec<Referral>> {
        rows.into_iter()
            .map(|row| row.decrypt(self.key()).map_err(NetworkError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::registry::NewPerson;
    use crate::network::test_support::{ally, clinic, harness, partners};
    use common_db::models::Person;

    async fn walk_in(h: &NetworkService, clinic: Party, name: &str) -> Person {
        h.register_person(NewPerson {
            clinic_id: clinic.id(),
            user_id: None,
            full_name: name.to_string(),
            phone: Some("555-0101".to_string()),
            email: None,
        })
        .await
        .unwrap()
    }

    fn to(receiver: Party, patient: PatientRef, attested: bool) -> NewReferral {
        NewReferral {
            receiver,
            patient,
            notes: Some("Avaliação nutricional".to_string()),
            consent_attested: attested,
        }
    }

    #[tokio::test]
    async fn direct_referral_requires_attestation() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = clinic(&h, "B").await;
        partners(&h, a, b).await;
        let juan = walk_in(&h, a, "Juan Pérez").await;

        let refused = h
            .create_referral(a, to(b, PatientRef::Person(juan.id), false))
            .await;
        assert!(matches!(refused, Err(NetworkError::ConsentRequired)));
        assert!(h.list_referrals(a, ReferralDirection::All).await.unwrap().is_empty());

        let outcome = h
            .create_referral(a, to(b, PatientRef::Person(juan.id), true))
            .await
            .unwrap();
        let ReferralOutcome::Created(referral) = outcome else {
            panic!("esperava encaminhamento direto");
        };
        assert_eq!(referral.status, ReferralStatus::Pending);
        assert_eq!(referral.patient_info.name, "Juan Pérez");
        assert_eq!(referral.person_id, Some(juan.id));
    }

    #[tokio::test]
    async fn referral_needs_active_partnership() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = ally(&h, "B").await;

        let result = h
            .create_referral(
                a,
                to(b, PatientRef::Snapshot(PatientInfo::new("Ana", None)), true),
            )
            .await;
        assert!(matches!(result, Err(NetworkError::Forbidden(_))));
    }

    #[tokio::test]
    async fn sender_must_own_the_person() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = clinic(&h, "B").await;
        let c = clinic(&h, "C").await;
        partners(&h, b, c).await;
        let juan = walk_in(&h, a, "Juan Pérez").await;

        let result = h
            .create_referral(b, to(c, PatientRef::Person(juan.id), true))
            .await;
        assert!(matches!(result, Err(NetworkError::Forbidden(_))));
    }

    #[tokio::test]
    async fn only_receiver_responds_once() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = ally(&h, "B").await;
        partners(&h, a, b).await;

        let ReferralOutcome::Created(referral) = h
            .create_referral(
                a,
                to(b, PatientRef::Snapshot(PatientInfo::new("Rosa", None)), true),
            )
            .await
            .unwrap()
        else {
            panic!("esperava encaminhamento direto");
        };

        let by_sender = h
            .respond_to_referral(referral.id, ReferralDecision::Accepted, a)
            .await;
        assert!(matches!(by_sender, Err(NetworkError::Forbidden(_))));

        let rejected = h
            .respond_to_referral(referral.id, ReferralDecision::Rejected, b)
            .await
            .unwrap();
        assert_eq!(rejected.status, ReferralStatus::Rejected);

        let again = h
            .respond_to_referral(referral.id, ReferralDecision::Accepted, b)
            .await;
        assert!(matches!(again, Err(NetworkError::InvalidState(_))));
    }

    #[tokio::test]
    async fn participants_delete_in_any_status() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = clinic(&h, "B").await;
        let outsider = clinic(&h, "C").await;
        partners(&h, a, b).await;

        let ReferralOutcome::Created(referral) = h
            .create_referral(
                a,
                to(b, PatientRef::Snapshot(PatientInfo::new("Rosa", None)), true),
            )
            .await
            .unwrap()
        else {
            panic!("esperava encaminhamento direto");
        };
        h.respond_to_referral(referral.id, ReferralDecision::Accepted, b)
            .await
            .unwrap();

        let forbidden = h.delete_referral(referral.id, outsider).await;
        assert!(matches!(forbidden, Err(NetworkError::Forbidden(_))));

        h.delete_referral(referral.id, b).await.unwrap();
        let gone = h.get_referral(referral.id, a).await;
        assert!(matches!(gone, Err(NetworkError::NotFound { .. })));
    }

    #[tokio::test]
    async fn snapshot_and_person_searches_are_independent() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = clinic(&h, "B").await;
        partners(&h, a, b).await;
        let juan = walk_in(&h, a, "Juan Pérez").await;

        h.create_referral(a, to(b, PatientRef::Person(juan.id), true))
            .await
            .unwrap();

        sqlx::query("UPDATE persons SET full_name = 'Juan Carlos Gómez' WHERE id = ?")
            .bind(juan.id)
            .execute(h.pool())
            .await
            .unwrap();

        let by_snapshot = h.search_referrals_by_snapshot(b, ReferralDirection::All, "pérez").await.unwrap();
        assert_eq!(by_snapshot.len(), 1);
        assert_eq!(by_snapshot[0].patient_info.name, "Juan Pérez");

        let by_person = h.search_referrals_by_person(b, ReferralDirection::All, "gómez").await.unwrap();
        assert_eq!(by_person.len(), 1);
        assert!(h.search_referrals_by_person(b, ReferralDirection::All, "pérez").await.unwrap().is_empty());
        assert!(h.search_referrals_by_snapshot(b, ReferralDirection::All, "gómez").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn accented_uppercase_query_matches_both_searches() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = clinic(&h, "B").await;
        partners(&h, a, b).await;
        let juan = walk_in(&h, a, "Juan Pérez").await;
        h.create_referral(a, to(b, PatientRef::Person(juan.id), true))
            .await
            .unwrap();

        let by_snapshot = h
            .search_referrals_by_snapshot(b, ReferralDirection::All, "PÉREZ")
            .await
            .unwrap();
        let by_person = h
            .search_referrals_by_person(b, ReferralDirection::All, "PÉREZ")
            .await
            .unwrap();
        assert_eq!(by_snapshot.len(), 1);
        assert_eq!(by_person.len(), 1);
        assert_eq!(by_snapshot[0].id, by_person[0].id);
    }

    #[tokio::test]
    async fn searches_respect_direction() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = clinic(&h, "B").await;
        partners(&h, a, b).await;
        let juan = walk_in(&h, a, "Juan Pérez").await;
        h.create_referral(a, to(b, PatientRef::Person(juan.id), true))
            .await
            .unwrap();

        for direction in [ReferralDirection::Outgoing, ReferralDirection::All] {
            assert_eq!(h.search_referrals_by_snapshot(a, direction, "juan").await.unwrap().len(), 1);
            assert_eq!(h.search_referrals_by_person(a, direction, "juan").await.unwrap().len(), 1);
        }
        assert!(h
            .search_referrals_by_snapshot(a, ReferralDirection::Incoming, "juan")
            .await
            .unwrap()
            .is_empty());
        assert!(h
            .search_referrals_by_person(a, ReferralDirection::Incoming, "juan")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn direction_filters_inbox_and_outbox() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = clinic(&h, "B").await;
        partners(&h, a, b).await;

        h.create_referral(
            a,
            to(b, PatientRef::Snapshot(PatientInfo::new("Rosa", None)), true),
        )
        .await
        .unwrap();

        assert_eq!(h.list_referrals(a, ReferralDirection::Outgoing).await.unwrap().len(), 1);
        assert!(h.list_referrals(a, ReferralDirection::Incoming).await.unwrap().is_empty());
        assert_eq!(h.list_referrals(b, ReferralDirection::Incoming).await.unwrap().len(), 1);
    }
}

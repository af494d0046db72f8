//! Porta de consentimento.
//!
//! Paciente com conta no portal aprova eletronicamente o compartilhamento;
//! a aprovação é o único caminho que cria o encaminhamento, uma única vez.
//! Paciente sem portal segue o caminho direto com declaração manual.

use chrono::Utc;
use common_db::models::{
    ConsentRequest, ConsentStatus, EncryptedConsentRequest, EncryptedReferral, Party, Person,
    Referral, ReferralStatus,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::referral::insert_referral;
use super::NetworkService;
use crate::error::{NetworkError, NetworkResult};
use crate::events::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentPath {
    /// O paciente precisa aprovar pelo portal
    Gated { user_id: Uuid },
    /// Exige declaração manual de consentimento
    Direct,
}

pub fn decide_consent_path(person: &Person) -> ConsentPath {
    match person.user_id {
        Some(user_id) => ConsentPath::Gated { user_id },
        None => ConsentPath::Direct,
    }
}

impl NetworkService {
    /// Abre um pedido pendente e avisa o paciente depois do commit
    pub(crate) async fn open_consent_request(
        &self,
        person: &Person,
        receiver: Party,
        notes: Option<String>,
        clinic_name: &str,
        receiver_name: &str,
    ) -> NetworkResult<ConsentRequest> {
        let ConsentPath::Gated { user_id } = decide_consent_path(person) else {
            return Err(NetworkError::Validation(
                "paciente sem conta no portal não recebe pedido de consentimento".to_string(),
            ));
        };

        let request = ConsentRequest {
            id: Uuid::new_v4(),
            clinic_id: person.clinic_id,
            person_id: person.id,
            receiver,
            notes,
            patient_info: person.snapshot(),
            status: ConsentStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
        };
        let sealed = request.patient_info.seal(self.key())?;

        sqlx::query(
            "INSERT INTO consent_requests (id, clinic_id, person_id, receiver_kind, receiver_id, \
             notes, patient_info_ciphertext, patient_info_nonce, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request.id)
        .bind(request.clinic_id)
        .bind(request.person_id)
        .bind(receiver.kind().as_str())
        .bind(receiver.id())
        .bind(&request.notes)
        .bind(&sealed.ciphertext)
        .bind(&sealed.nonce)
        .bind(ConsentStatus::Pending.as_str())
        .bind(request.created_at)
        .execute(self.pool())
        .await?;

        self.events().publish(
            EntityKind::ConsentRequest,
            request.id,
            vec![Party::Clinic(request.clinic_id), receiver],
        );
        self.notifier.notify(
            user_id,
            "Solicitação de consentimento",
            format!(
                "{} quer compartilhar seus dados com {}. Abra o portal para aprovar ou recusar.",
                clinic_name, receiver_name
            ),
        );
        Ok(request)
    }

    /// Aprova o pedido e cria o encaminhamento na mesma transação.
    ///
    /// Repetir a chamada para um pedido já aprovado devolve o mesmo
    /// encaminhamento em vez de criar outro.
    pub async fn approve_consent(
        &self,
        consent_request_id: Uuid,
        approving_user_id: Uuid,
    ) -> NetworkResult<Referral> {
        let row = self.load_consent_row(consent_request_id).await?;
        self.ensure_patient(row.person_id, approving_user_id).await?;

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let flipped = sqlx::query(
            "UPDATE consent_requests SET status = 'approved', responded_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(consent_request_id)
        .execute(&mut *tx)
        .await?;

        if flipped.rows_affected() == 0 {
            tx.rollback().await?;
            return self.existing_approval(consent_request_id).await;
        }

        // A parceria pode ter sido revogada enquanto o paciente decidia
        let active: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM partnerships WHERE pair_key = ? AND status = 'active' LIMIT 1",
        )
        .bind(Party::pair_key(Party::Clinic(row.clinic_id), row.receiver))
        .fetch_optional(&mut *tx)
        .await?;
        if active.is_none() {
            tx.rollback().await?;
            warn!(%consent_request_id, receiver = %row.receiver, "Aprovação sem parceria ativa");
            return Err(NetworkError::Forbidden(
                "não há parceria ativa com o destinatário".to_string(),
            ));
        }

        let sealed = row.patient_info.clone();
        let request = row.decrypt(self.key())?;
        let referral = Referral {
            id: Uuid::new_v4(),
            sender: Party::Clinic(request.clinic_id),
            receiver: request.receiver,
            person_id: Some(request.person_id),
            consent_request_id: Some(request.id),
            patient_info: request.patient_info,
            notes: request.notes,
            consent_attested: false,
            status: ReferralStatus::Pending,
            created_at: now,
            responded_at: None,
        };
        insert_referral(&mut tx, &referral, &sealed).await?;
        tx.commit().await?;

        info!(%consent_request_id, referral_id = %referral.id, "Consentimento aprovado");
        self.events().publish(
            EntityKind::ConsentRequest,
            consent_request_id,
            vec![referral.sender, referral.receiver],
        );
        self.events().publish(
            EntityKind::Referral,
            referral.id,
            vec![referral.sender, referral.receiver],
        );
        Ok(referral)
    }

    pub async fn reject_consent(
        &self,
        consent_request_id: Uuid,
        approving_user_id: Uuid,
    ) -> NetworkResult<ConsentRequest> {
        let row = self.load_consent_row(consent_request_id).await?;
        self.ensure_patient(row.person_id, approving_user_id).await?;

        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE consent_requests SET status = 'rejected', responded_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(consent_request_id)
        .execute(self.pool())
        .await?;

        if updated.rows_affected() == 0 {
            return Err(NetworkError::InvalidState(
                "o pedido de consentimento não está pendente".to_string(),
            ));
        }

        let mut request = row.decrypt(self.key())?;
        request.status = ConsentStatus::Rejected;
        request.responded_at = Some(now);

        info!(%consent_request_id, "Consentimento recusado");
        self.events().publish(
            EntityKind::ConsentRequest,
            consent_request_id,
            vec![Party::Clinic(request.clinic_id), request.receiver],
        );
        Ok(request)
    }

    /// Pedidos pendentes do paciente dono da conta
    pub async fn list_consent_requests_for_user(
        &self,
        user_id: Uuid,
    ) -> NetworkResult<Vec<ConsentRequest>> {
        let rows = sqlx::query_as::<_, EncryptedConsentRequest>(
            "SELECT c.* FROM consent_requests c JOIN persons p ON p.id = c.person_id \
             WHERE p.user_id = ? AND c.status = 'pending' ORDER BY c.created_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        self.decrypt_consent_requests(rows)
    }

    /// Todos os pedidos abertos pela clínica, em qualquer status
    pub async fn list_consent_requests_for_clinic(
        &self,
        clinic_id: Uuid,
    ) -> NetworkResult<Vec<ConsentRequest>> {
        let rows = sqlx::query_as::<_, EncryptedConsentRequest>(
            "SELECT * FROM consent_requests WHERE clinic_id = ? ORDER BY created_at DESC",
        )
        .bind(clinic_id)
        .fetch_all(self.pool())
        .await?;
        self.decrypt_consent_requests(rows)
    }

    async fn load_consent_row(&self, id: Uuid) -> NetworkResult<EncryptedConsentRequest> {
        sqlx::query_as::<_, EncryptedConsentRequest>("SELECT * FROM consent_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| NetworkError::not_found("Pedido de consentimento", id))
    }

    async fn ensure_patient(&self, person_id: Uuid, user_id: Uuid) -> NetworkResult<()> {
        let person = self.get_person(person_id).await?;
        if person.user_id != Some(user_id) {
            warn!(%person_id, %user_id, "Consentimento respondido por outro usuário");
            return Err(NetworkError::Forbidden(
                "apenas o próprio paciente pode responder ao consentimento".to_string(),
            ));
        }
        Ok(())
    }

    /// Resultado de uma aprovação que perdeu a corrida ou foi repetida
    async fn existing_approval(&self, consent_request_id: Uuid) -> NetworkResult<Referral> {
        let existing = sqlx::query_as::<_, EncryptedReferral>(
            "SELECT * FROM referrals WHERE consent_request_id = ?",
        )
        .bind(consent_request_id)
        .fetch_optional(self.pool())
        .await?;

        match existing {
            Some(row) => Ok(row.decrypt(self.key())?),
            None => Err(NetworkError::InvalidState(
                "o pedido de consentimento não está pendente".to_string(),
            )),
        }
    }

    fn decrypt_consent_requests(
        &self,
        rows: Vec<EncryptedConsentRequest>,
    ) -> NetworkResult<Vec<ConsentRequest>> {
        rows.into_iter()
            .map(|row| row.decrypt(self.key()).map_err(NetworkError::from))
            .collect()
    }
}

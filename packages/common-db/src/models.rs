//! Modelos de dados compartilhados entre aplicações
//!
//! Este módulo define as estruturas de dados da rede de clínicas: partes
//! (clínicas e aliados), parcerias, encaminhamentos, pedidos de
//! consentimento e assinaturas compartilhadas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::crypto::{self, EncryptedData, EncryptionKey};
use crate::error::DbError;

fn invalid_column(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Valor inválido para {}: {}", column, value),
        )),
    }
}

fn decode_column<T>(row: &SqliteRow, column: &str, parse: fn(&str) -> Option<T>) -> sqlx::Result<T> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or_else(|| invalid_column(column, &raw))
}

/// Tipo de parte na rede
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyKind {
    Clinic,
    Ally,
}

impl PartyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyKind::Clinic => "clinic",
            PartyKind::Ally => "ally",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clinic" => Some(PartyKind::Clinic),
            "ally" => Some(PartyKind::Ally),
            _ => None,
        }
    }
}

impl std::fmt::Display for PartyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uma parte da rede: clínica ou profissional aliado.
///
/// Cada lado de uma parceria ou encaminhamento guarda exatamente uma parte.
/// Serializa como `{"kind": "clinic", "id": "..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Party {
    Clinic(Uuid),
    Ally(Uuid),
}

impl Party {
    pub fn new(kind: PartyKind, id: Uuid) -> Self {
        match kind {
            PartyKind::Clinic => Party::Clinic(id),
            PartyKind::Ally => Party::Ally(id),
        }
    }

    pub fn kind(&self) -> PartyKind {
        match self {
            Party::Clinic(_) => PartyKind::Clinic,
            Party::Ally(_) => PartyKind::Ally,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Party::Clinic(id) | Party::Ally(id) => *id,
        }
    }

    /// Chave do par independente da ordem, usada pelo índice único de parcerias
    pub fn pair_key(a: Party, b: Party) -> String {
        let (a, b) = (a.to_string(), b.to_string());
        if a <= b {
            format!("{}|{}", a, b)
        } else {
            format!("{}|{}", b, a)
        }
    }

    /// Lê uma parte a partir das colunas `<prefixo>_kind` e `<prefixo>_id`
    pub fn from_columns(row: &SqliteRow, prefix: &str) -> sqlx::Result<Self> {
        let kind = decode_column(row, &format!("{}_kind", prefix), PartyKind::parse)?;
        let id: Uuid = row.try_get(format!("{}_id", prefix).as_str())?;
        Ok(Party::new(kind, id))
    }
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Combinação de tipos de parte numa parceria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnershipKind {
    ClinicClinic,
    ClinicAlly,
    AllyAlly,
}

impl PartnershipKind {
    pub fn between(a: Party, b: Party) -> Self {
        match (a.kind(), b.kind()) {
            (PartyKind::Clinic, PartyKind::Clinic) => PartnershipKind::ClinicClinic,
            (PartyKind::Ally, PartyKind::Ally) => PartnershipKind::AllyAlly,
            _ => PartnershipKind::ClinicAlly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PartnershipKind::ClinicClinic => "clinic_clinic",
            PartnershipKind::ClinicAlly => "clinic_ally",
            PartnershipKind::AllyAlly => "ally_ally",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clinic_clinic" => Some(PartnershipKind::ClinicClinic),
            "clinic_ally" => Some(PartnershipKind::ClinicAlly),
            "ally_ally" => Some(PartnershipKind::AllyAlly),
            _ => None,
        }
    }
}

/// Status possíveis de uma parceria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnershipStatus {
    /// Aguardando decisão do destinatário
    Pending,
    /// Mútua; encaminhamentos permitidos
    Active,
    /// Recusada pelo destinatário
    Rejected,
    /// Encerrada por uma das partes
    Revoked,
}

impl PartnershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartnershipStatus::Pending => "pending",
            PartnershipStatus::Active => "active",
            PartnershipStatus::Rejected => "rejected",
            PartnershipStatus::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PartnershipStatus::Pending),
            "active" => Some(PartnershipStatus::Active),
            "rejected" => Some(PartnershipStatus::Rejected),
            "revoked" => Some(PartnershipStatus::Revoked),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, PartnershipStatus::Pending | PartnershipStatus::Active)
    }
}

impl std::fmt::Display for PartnershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relação bilateral entre duas partes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partnership {
    pub id: Uuid,
    pub kind: PartnershipKind,
    /// Quem pediu a parceria
    pub requester: Party,
    /// Quem decide o pedido
    pub responder: Party,
    pub status: PartnershipStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Partnership {
    pub fn involves(&self, party: Party) -> bool {
        self.requester == party || self.responder == party
    }

    /// A outra parte da relação, se `party` participa dela
    pub fn counterpart_of(&self, party: Party) -> Option<Party> {
        if self.requester == party {
            Some(self.responder)
        } else if self.responder == party {
            Some(self.requester)
        } else {
            None
        }
    }
}

impl FromRow<'_, SqliteRow> for Partnership {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: decode_column(row, "kind", PartnershipKind::parse)?,
            requester: Party::from_columns(row, "requester")?,
            responder: Party::from_columns(row, "responder")?,
            status: decode_column(row, "status", PartnershipStatus::parse)?,
            created_at: row.try_get("created_at")?,
            responded_at: row.try_get("responded_at")?,
            revoked_at: row.try_get("revoked_at")?,
        })
    }
}

/// Clínica participante da rede
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Clinic {
    pub id: Uuid,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Usuário dono da clínica; recebe as notificações da clínica
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Profissional aliado independente
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ally {
    pub id: Uuid,
    pub full_name: String,
    pub specialty: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Paciente de uma clínica
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Person {
    pub id: Uuid,
    pub clinic_id: Uuid,
    /// Conta do portal; `None` quando a clínica gerencia o paciente sem portal
    pub user_id: Option<Uuid>,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub group_id: Option<Uuid>,
    pub current_plan_id: Option<Uuid>,
    pub subscription_start: Option<DateTime<Utc>>,
    pub subscription_end: Option<DateTime<Utc>>,
    pub points: i64,
    pub rank: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Person {
    /// Snapshot pontual usado em encaminhamentos e pedidos de consentimento
    pub fn snapshot(&self) -> PatientInfo {
        let mut info = PatientInfo::new(self.full_name.clone(), self.phone.clone());
        if let Some(email) = &self.email {
            info.extra
                .insert("email".to_string(), serde_json::Value::String(email.clone()));
        }
        info
    }
}

/// Plano de serviço oferecido pela clínica
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PatientServicePlan {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub name: String,
    pub duration_days: i64,
    pub max_consultations: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Grupo de pacientes com assinatura compartilhada
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PatientGroup {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Assinatura única de um grupo
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SharedSubscription {
    pub id: Uuid,
    pub group_id: Uuid,
    pub plan_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot semi-estruturado do paciente.
///
/// Contém pelo menos `name` e `phone`; chaves adicionais são preservadas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientInfo {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PatientInfo {
    pub fn new(name: impl Into<String>, phone: Option<String>) -> Self {
        Self {
            name: name.into(),
            phone,
            extra: serde_json::Map::new(),
        }
    }

    /// Serializa e cifra o snapshot para gravação
    pub fn seal(&self, key: &EncryptionKey) -> Result<EncryptedData, DbError> {
        let json = serde_json::to_vec(self)?;
        Ok(crypto::encrypt(&json, key)?)
    }

    pub fn open(sealed: &EncryptedData, key: &EncryptionKey) -> Result<Self, DbError> {
        let json = crypto::decrypt(sealed, key)?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn name_matches(&self, query: &str) -> bool {
        name_contains(&self.name, query)
    }
}

/// Busca por nome sem diferenciar maiúsculas, acentuadas inclusive
pub fn name_contains(name: &str, query: &str) -> bool {
    name.to_lowercase().contains(&query.trim().to_lowercase())
}

fn sealed_snapshot(row: &SqliteRow) -> sqlx::Result<EncryptedData> {
    Ok(EncryptedData {
        ciphertext: row.try_get("patient_info_ciphertext")?,
        nonce: row.try_get("patient_info_nonce")?,
    })
}

/// Status possíveis de um encaminhamento
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::Accepted => "accepted",
            ReferralStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ReferralStatus::Pending),
            "accepted" => Some(ReferralStatus::Accepted),
            "rejected" => Some(ReferralStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encaminhamento - versão encriptada, como gravada no banco
#[derive(Debug, Clone)]
pub struct EncryptedReferral {
    pub id: Uuid,
    pub sender: Party,
    pub receiver: Party,
    pub person_id: Option<Uuid>,
    pub consent_request_id: Option<Uuid>,
    pub patient_info: EncryptedData,
    pub notes: Option<String>,
    pub consent_attested: bool,
    pub status: ReferralStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl FromRow<'_, SqliteRow> for EncryptedReferral {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            sender: Party::from_columns(row, "sender")?,
            receiver: Party::from_columns(row, "receiver")?,
            person_id: row.try_get("person_id")?,
            consent_request_id: row.try_get("consent_request_id")?,
            patient_info: sealed_snapshot(row)?,
            notes: row.try_get("notes")?,
            consent_attested: row.try_get("consent_attested")?,
            status: decode_column(row, "status", ReferralStatus::parse)?,
            created_at: row.try_get("created_at")?,
            responded_at: row.try_get("responded_at")?,
        })
    }
}

impl EncryptedReferral {
    pub fn decrypt(self, key: &EncryptionKey) -> Result<Referral, DbError> {
        Ok(Referral {
            patient_info: PatientInfo::open(&self.patient_info, key)?,
            id: self.id,
            sender: self.sender,
            receiver: self.receiver,
            person_id: self.person_id,
            consent_request_id: self.consent_request_id,
            notes: self.notes,
            consent_attested: self.consent_attested,
            status: self.status,
            created_at: self.created_at,
            responded_at: self.responded_at,
        })
    }
}

/// Encaminhamento de um paciente de uma parte para outra
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub sender: Party,
    pub receiver: Party,
    /// Paciente vinculado, quando houver registro na clínica de origem
    pub person_id: Option<Uuid>,
    /// Pedido de consentimento que originou o encaminhamento
    pub consent_request_id: Option<Uuid>,
    /// Snapshot do momento da criação; nunca é atualizado
    pub patient_info: PatientInfo,
    pub notes: Option<String>,
    /// Consentimento manual declarado pelo profissional
    pub consent_attested: bool,
    pub status: ReferralStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl Referral {
    pub fn involves(&self, party: Party) -> bool {
        self.sender == party || self.receiver == party
    }
}

/// Status possíveis de um pedido de consentimento
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Pending,
    Approved,
    Rejected,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Pending => "pending",
            ConsentStatus::Approved => "approved",
            ConsentStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ConsentStatus::Pending),
            "approved" => Some(ConsentStatus::Approved),
            "rejected" => Some(ConsentStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pedido de consentimento - versão encriptada
#[derive(Debug, Clone)]
pub struct EncryptedConsentRequest {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub person_id: Uuid,
    pub receiver: Party,
    pub notes: Option<String>,
    pub patient_info: EncryptedData,
    pub status: ConsentStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl FromRow<'_, SqliteRow> for EncryptedConsentRequest {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            clinic_id: row.try_get("clinic_id")?,
            person_id: row.try_get("person_id")?,
            receiver: Party::from_columns(row, "receiver")?,
            notes: row.try_get("notes")?,
            patient_info: sealed_snapshot(row)?,
            status: decode_column(row, "status", ConsentStatus::parse)?,
            created_at: row.try_get("created_at")?,
            responded_at: row.try_get("responded_at")?,
        })
    }
}

impl EncryptedConsentRequest {
    pub fn decrypt(self, key: &EncryptionKey) -> Result<ConsentRequest, DbError> {
        Ok(ConsentRequest {
            patient_info: PatientInfo::open(&self.patient_info, key)?,
            id: self.id,
            clinic_id: self.clinic_id,
            person_id: self.person_id,
            receiver: self.receiver,
            notes: self.notes,
            status: self.status,
            created_at: self.created_at,
            responded_at: self.responded_at,
        })
    }
}

/// Pedido para o paciente aprovar o compartilhamento dos seus dados
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRequest {
    pub id: Uuid,
    /// Clínica de origem
    pub clinic_id: Uuid,
    pub person_id: Uuid,
    pub receiver: Party,
    pub notes: Option<String>,
    pub patient_info: PatientInfo,
    pub status: ConsentStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_serializes_as_tagged_union() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(Party::Ally(id)).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "ally", "id": id.to_string() }));

        let back: Party = serde_json::from_value(json).unwrap();
        assert_eq!(back, Party::Ally(id));
    }

    #[test]
    fn pair_key_ignores_order() {
        let a = Party::Clinic(Uuid::new_v4());
        let b = Party::Ally(Uuid::new_v4());
        assert_eq!(Party::pair_key(a, b), Party::pair_key(b, a));
        assert_ne!(Party::pair_key(a, b), Party::pair_key(a, Party::Clinic(b.id())));
    }

    #[test]
    fn partnership_kind_between_parties() {
        let clinic = Party::Clinic(Uuid::new_v4());
        let ally = Party::Ally(Uuid::new_v4());
        assert_eq!(PartnershipKind::between(clinic, ally), PartnershipKind::ClinicAlly);
        assert_eq!(PartnershipKind::between(ally, clinic), PartnershipKind::ClinicAlly);
        assert_eq!(PartnershipKind::between(ally, ally), PartnershipKind::AllyAlly);
    }

    #[test]
    fn patient_info_keeps_extra_keys() {
        let raw = serde_json::json!({ "name": "Ana", "phone": null, "dni": "123" });
        let info: PatientInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.name, "Ana");
        assert_eq!(info.extra.get("dni"), Some(&serde_json::json!("123")));

        let key = EncryptionKey::generate();
        let sealed = info.seal(&key).unwrap();
        assert_eq!(PatientInfo::open(&sealed, &key).unwrap(), info);
    }

    #[test]
    fn name_match_is_case_insensitive() {
        let info = PatientInfo::new("Juan Pérez", None);
        assert!(info.name_matches("juan"));
        assert!(info.name_matches(" PÉREZ "));
        assert!(!info.name_matches("ana"));
    }
}

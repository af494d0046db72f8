//! Handlers HTTP: uma chamada com parâmetros nomeados por transição

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use common_db::models::{
    ConsentRequest, Party, PartyKind, Partnership, PartnershipKind, Referral, SharedSubscription,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::auth::Actor;
use super::AppState;
use crate::build_info;
use crate::error::{NetworkError, NetworkResult};
use crate::network::{
    DirectoryEntry, NewReferral, PartnershipDecision, PatientRef, ReferralDecision,
    ReferralDirection, ReferralOutcome,
};

fn validated<T: Validate>(body: T) -> NetworkResult<T> {
    body.validate()?;
    Ok(body)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub rustc: &'static str,
    pub events_published: u64,
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> NetworkResult<Json<HealthResponse>> {
    sqlx::query("SELECT 1").execute(state.service.pool()).await?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: build_info::PKG_VERSION,
        rustc: build_info::RUSTC_VERSION,
        events_published: state.service.events().sequence(),
    }))
}

// Parcerias

#[derive(Debug, Deserialize)]
pub struct RequestPartnershipBody {
    pub responder: Party,
    /// Deduzido das partes quando ausente
    pub kind: Option<PartnershipKind>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody<D> {
    pub decision: D,
}

pub async fn list_partnerships(
    State(state): State<AppState>,
    actor: Actor,
) -> NetworkResult<Json<Vec<Partnership>>> {
    let party = actor.require_party()?;
    Ok(Json(state.service.list_partnerships(party).await?))
}

pub async fn request_partnership(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<RequestPartnershipBody>,
) -> NetworkResult<(StatusCode, Json<Partnership>)> {
    let requester = actor.require_party()?;
    let kind = body
        .kind
        .unwrap_or_else(|| PartnershipKind::between(requester, body.responder));
    let partnership = state
        .service
        .request_partnership(requester, body.responder, kind)
        .await?;
    Ok((StatusCode::CREATED, Json(partnership)))
}

pub async fn respond_to_partnership(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody<PartnershipDecision>>,
) -> NetworkResult<Json<Partnership>> {
    let acting = actor.require_party()?;
    let partnership = state
        .service
        .respond_to_partnership(id, acting, body.decision)
        .await?;
    Ok(Json(partnership))
}

pub async fn revoke_partnership(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> NetworkResult<Json<Partnership>> {
    let acting = actor.require_party()?;
    Ok(Json(state.service.revoke_partnership(id, acting).await?))
}

// Diretório

#[derive(Debug, Deserialize)]
pub struct DirectoryQuery {
    pub kind: PartyKind,
}

pub async fn directory(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<DirectoryQuery>,
) -> NetworkResult<Json<Vec<DirectoryEntry>>> {
    let party = actor.require_party()?;
    let entries = state
        .service
        .list_counterparts_with_status(party, query.kind)
        .await?;
    Ok(Json(entries))
}

// Encaminhamentos

#[derive(Debug, Deserialize, Validate)]
pub struct CreateReferralBody {
    pub receiver: Party,
    pub patient: PatientRef,
    #[validate(length(max = 4000))]
    pub notes: Option<String>,
    #[serde(default)]
    pub consent_attested: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Nome gravado no encaminhamento
    #[default]
    Snapshot,
    /// Nome atual do paciente
    Person,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ListReferralsQuery {
    #[serde(default)]
    pub direction: ReferralDirection,
    #[validate(length(min = 1, max = 200))]
    pub q: Option<String>,
    #[serde(default)]
    pub search: SearchMode,
}

pub async fn create_referral(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<CreateReferralBody>,
) -> NetworkResult<(StatusCode, Json<ReferralOutcome>)> {
    let sender = actor.require_party()?;
    let body = validated(body)?;
    let outcome = state
        .service
        .create_referral(
            sender,
            NewReferral {
                receiver: body.receiver,
                patient: body.patient,
                notes: body.notes,
                consent_attested: body.consent_attested,
            },
        )
        .await?;

    let status = match outcome {
        ReferralOutcome::Created(_) => StatusCode::CREATED,
        ReferralOutcome::ConsentRequested(_) => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

pub async fn list_referrals(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ListReferralsQuery>,
) -> NetworkResult<Json<Vec<Referral>>> {
    let party = actor.require_party()?;
    let query = validated(query)?;

    let referrals = match (query.q.as_deref(), query.search) {
        (None, _) => state.service.list_referrals(party, query.direction).await?,
        (Some(q), SearchMode::Snapshot) => {
            state
                .service
                .search_referrals_by_snapshot(party, query.direction, q)
                .await?
        }
        (Some(q), SearchMode::Person) => {
            state
                .service
                .search_referrals_by_person(party, query.direction, q)
                .await?
        }
    };
    Ok(Json(referrals))
}

pub async fn get_referral(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> NetworkResult<Json<Referral>> {
    let acting = actor.require_party()?;
    Ok(Json(state.service.get_referral(id, acting).await?))
}

pub async fn respond_to_referral(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody<ReferralDecision>>,
) -> NetworkResult<Json<Referral>> {
    let acting = actor.require_party()?;
    let referral = state
        .service
        .respond_to_referral(id, body.decision, acting)
        .await?;
    Ok(Json(referral))
}

pub async fn delete_referral(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> NetworkResult<StatusCode> {
    let acting = actor.require_party()?;
    state.service.delete_referral(id, acting).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Consentimento: o ator é o próprio paciente

pub async fn list_consent_requests(
    State(state): State<AppState>,
    actor: Actor,
) -> NetworkResult<Json<Vec<ConsentRequest>>> {
    let requests = match actor.party {
        Some(Party::Clinic(clinic_id)) => {
            state.service.list_consent_requests_for_clinic(clinic_id).await?
        }
        Some(Party::Ally(_)) => {
            return Err(NetworkError::Forbidden(
                "aliados não acompanham pedidos de consentimento".to_string(),
            ))
        }
        None => state.service.list_consent_requests_for_user(actor.user_id).await?,
    };
    Ok(Json(requests))
}

pub async fn approve_consent(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> NetworkResult<Json<Referral>> {
    Ok(Json(state.service.approve_consent(id, actor.user_id).await?))
}

pub async fn reject_consent(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> NetworkResult<Json<ConsentRequest>> {
    Ok(Json(state.service.reject_consent(id, actor.user_id).await?))
}

// Assinatura do grupo

#[derive(Debug, Deserialize)]
pub struct AssignPlanBody {
    pub plan_id: Uuid,
}

pub async fn assign_plan(
    State(state): State<AppState>,
    actor: Actor,
    Path(group_id): Path<Uuid>,
    Json(body): Json<AssignPlanBody>,
) -> NetworkResult<Json<SharedSubscription>> {
    let acting = actor.require_party()?;
    let subscription = state
        .service
        .assign_plan_to_group(acting, group_id, body.plan_id)
        .await?;
    Ok(Json(subscription))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    actor: Actor,
    Path(group_id): Path<Uuid>,
) -> NetworkResult<Json<SharedSubscription>> {
    let acting = actor.require_party()?;
    let group = state.service.get_group(group_id).await?;
    if acting != Party::Clinic(group.clinic_id) {
        return Err(NetworkError::Forbidden("grupo de outra clínica".to_string()));
    }
    state
        .service
        .get_group_subscription(group_id)
        .await?
        .map(Json)
        .ok_or_else(|| NetworkError::not_found("Assinatura do grupo", group_id))
}

//! API HTTP/JSON da rede, montada sob `/api`.
//!
//! Camadas (externa → interna): trace, CORS, limite global de concorrência,
//! compressão (exceto no fluxo de eventos).

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::network::NetworkService;

pub mod auth;
pub mod events;
pub mod handlers;

#[derive(Clone)]
pub struct AppState {
    pub service: NetworkService,
    pub jwt_secret: Arc<str>,
    closing: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(service: NetworkService, jwt_secret: &str) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            service,
            jwt_secret: Arc::from(jwt_secret),
            closing: Arc::new(closing),
        }
    }

    /// Encerra os fluxos de eventos abertos; o encerramento gracioso do
    /// servidor espera por eles
    pub fn close_streams(&self) {
        self.closing.send_replace(true);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }
}

pub fn router(state: AppState, concurrency_limit: usize) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/partnerships",
            get(handlers::list_partnerships).post(handlers::request_partnership),
        )
        .route("/partnerships/:id/respond", post(handlers::respond_to_partnership))
        .route("/partnerships/:id/revoke", post(handlers::revoke_partnership))
        .route("/directory", get(handlers::directory))
        .route(
            "/referrals",
            get(handlers::list_referrals).post(handlers::create_referral),
        )
        .route(
            "/referrals/:id",
            get(handlers::get_referral).delete(handlers::delete_referral),
        )
        .route("/referrals/:id/respond", post(handlers::respond_to_referral))
        .route("/consent-requests", get(handlers::list_consent_requests))
        .route("/consent-requests/:id/approve", post(handlers::approve_consent))
        .route("/consent-requests/:id/reject", post(handlers::reject_consent))
        .route(
            "/groups/:id/subscription",
            get(handlers::get_subscription).put(handlers::assign_plan),
        )
        .layer(CompressionLayer::new());

    let streaming = Router::new().route("/events", get(events::stream_changes));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api.merge(streaming))
        .with_state(state)
        .layer(GlobalConcurrencyLimitLayer::new(concurrency_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::{ally, clinic, harness, partners, Harness};
    use crate::network::NewPerson;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use common_db::models::Party;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "segredo-de-teste";

    fn app(h: &Harness) -> Router {
        router(AppState::new(h.service.clone(), SECRET), 16)
    }

    fn bearer(user_id: Uuid, party: Option<Party>) -> String {
        let token =
            auth::issue_token(SECRET, user_id, party, chrono::Duration::minutes(10)).unwrap();
        format!("Bearer {}", token)
    }

    async fn call(app: Router, method: Method, uri: &str, auth: Option<String>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            req = req.header(header::AUTHORIZATION, auth);
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_version() {
        let h = harness().await;
        let (status, body) = call(app(&h), Method::GET, "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let h = harness().await;
        let (status, body) = call(app(&h), Method::GET, "/api/partnerships", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn duplicate_partnership_request_is_conflict() {
        let h = harness().await;
        let y = ally(&h, "Ally Y").await;
        let z = clinic(&h, "Clinic Z").await;
        let auth = bearer(Uuid::new_v4(), Some(y));
        let body = json!({ "responder": { "kind": "clinic", "id": z.id() } });

        let (status, created) = call(app(&h), Method::POST, "/api/partnerships", Some(auth.clone()), Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["kind"], "clinic_ally");

        let (status, err) = call(app(&h), Method::POST, "/api/partnerships", Some(auth), Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"]["code"], "DUPLICATE_ACTIVE_RELATIONSHIP");
    }

    #[tokio::test]
    async fn direct_referral_without_attestation_is_unprocessable() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = clinic(&h, "B").await;
        partners(&h, a, b).await;
        let body = json!({
            "receiver": { "kind": "clinic", "id": b.id() },
            "patient": { "snapshot": { "name": "Juan Pérez", "phone": "555-0101" } },
        });

        let (status, err) = call(app(&h), Method::POST, "/api/referrals", Some(bearer(Uuid::new_v4(), Some(a))), Some(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["error"]["code"], "CONSENT_REQUIRED");
    }

    #[tokio::test]
    async fn consent_flow_over_http() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let x = ally(&h, "Ally X").await;
        partners(&h, a, x).await;
        let patient_user = Uuid::new_v4();
        let ana = h
            .register_person(NewPerson {
                clinic_id: a.id(),
                user_id: Some(patient_user),
                full_name: "Ana".to_string(),
                phone: None,
                email: None,
            })
            .await
            .unwrap();

        let body = json!({
            "receiver": { "kind": "ally", "id": x.id() },
            "patient": { "person": ana.id },
            "consent_attested": true,
        });
        let (status, outcome) = call(app(&h), Method::POST, "/api/referrals", Some(bearer(Uuid::new_v4(), Some(a))), Some(body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(outcome["outcome"], "consent_requested");
        let request_id = outcome["record"]["id"].as_str().unwrap().to_string();

        let (status, pending) = call(app(&h), Method::GET, "/api/consent-requests", Some(bearer(patient_user, None)), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending.as_array().unwrap().len(), 1);

        let uri = format!("/api/consent-requests/{}/approve", request_id);
        let (status, referral) = call(app(&h), Method::POST, &uri, Some(bearer(patient_user, None)), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(referral["receiver"]["id"], x.id().to_string());
        assert_eq!(referral["status"], "pending");

        let (status, inbox) = call(app(&h), Method::GET, "/api/referrals?direction=incoming", Some(bearer(Uuid::new_v4(), Some(x))), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(inbox.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_keeps_the_direction_filter() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = clinic(&h, "B").await;
        partners(&h, a, b).await;
        let sender = bearer(Uuid::new_v4(), Some(a));
        let body = json!({
            "receiver": { "kind": "clinic", "id": b.id() },
            "patient": { "snapshot": { "name": "Juan Pérez" } },
            "consent_attested": true,
        });
        let (status, _) = call(app(&h), Method::POST, "/api/referrals", Some(sender.clone()), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, outbox) = call(app(&h), Method::GET, "/api/referrals?direction=outgoing&q=juan", Some(sender.clone()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outbox.as_array().unwrap().len(), 1);

        let (status, inbox) = call(app(&h), Method::GET, "/api/referrals?direction=incoming&q=juan", Some(sender), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(inbox.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closing_streams_signals_subscribers() {
        let h = harness().await;
        let state = AppState::new(h.service.clone(), SECRET);
        let mut signal = state.shutdown_signal();
        assert!(!*signal.borrow());

        state.clone().close_streams();
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
    }

    #[tokio::test]
    async fn patient_session_cannot_act_as_party() {
        let h = harness().await;
        let (status, err) = call(app(&h), Method::GET, "/api/directory?kind=clinic", Some(bearer(Uuid::new_v4(), None)), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(err["error"]["code"], "FORBIDDEN");
    }
}

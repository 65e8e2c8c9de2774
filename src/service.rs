//! HTTP surface over the deal core.

use crate::{
    config::{AppConfig, SigningMode},
    error::{NegotiationError, Result},
    model::{AgentReputation, NegotiationResult, SettlementRequest, SettlementResult, TrustLevel, DEFAULT_SLA_TIER},
    negotiation::{NegotiationEngine, NegotiationRequest},
    reputation::{InMemoryReputationStore, ReputationLedger},
    settlement::SettlementEngine,
    signing::Ed25519Keyring,
    AgentId,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub negotiation: Arc<NegotiationEngine>,
    pub settlement: Arc<SettlementEngine>,
    pub default_asset: String,
    pub default_network: String,
}

impl AppState {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;

        let reputation = Arc::new(ReputationLedger::with_store(
            Arc::new(InMemoryReputationStore::new()),
            config.reputation,
        )?);

        let mut settlement = SettlementEngine::new(reputation).with_options(config.settlement.to_options());
        if config.settlement.signing == SigningMode::Ed25519 {
            let keyring = Arc::new(Ed25519Keyring::new());
            settlement = settlement.with_signing(keyring.clone(), keyring);
        }

        Ok(Self {
            negotiation: Arc::new(NegotiationEngine::new(config.negotiation)?),
            settlement: Arc::new(settlement),
            default_asset: config.settlement.default_asset.clone(),
            default_network: config.settlement.default_network.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealRequest {
    pub buyer_id: AgentId,
    pub seller_id: AgentId,
    pub buyer_budget: f64,
    pub seller_base_price: f64,
    #[serde(default)]
    pub buyer_intent: String,
    #[serde(default)]
    pub seller_capability: String,
    #[serde(default)]
    pub sla_tier: Option<String>,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    /// Both parties must score at least this much before negotiation starts.
    #[serde(default)]
    pub min_reputation: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationView {
    #[serde(flatten)]
    pub reputation: AgentReputation,
    pub trust_level: TrustLevel,
}

impl From<AgentReputation> for ReputationView {
    fn from(reputation: AgentReputation) -> Self {
        let trust_level = reputation.trust_level();
        Self { reputation, trust_level }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealResponse {
    pub negotiation: NegotiationResult,
    pub settlement: Option<SettlementResult>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/negotiate", post(negotiate))
        .route("/negotiate/feasibility", post(feasibility))
        .route("/settle", post(settle))
        .route("/deals", post(run_deal))
        .route("/reputation", get(list_reputation))
        .route("/reputation/:agent_id", get(get_reputation))
        .route("/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn status_for(err: &NegotiationError) -> StatusCode {
    match err {
        NegotiationError::Config(_) | NegotiationError::Validation(_) => StatusCode::BAD_REQUEST,
        NegotiationError::AgentNotFound(_) => StatusCode::NOT_FOUND,
        NegotiationError::InsufficientReputation { .. } => StatusCode::FORBIDDEN,
        NegotiationError::StoreConflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn negotiate(
    State(state): State<AppState>,
    Json(request): Json<NegotiationRequest>,
) -> std::result::Result<Json<NegotiationResult>, StatusCode> {
    match state.negotiation.run_negotiation(&request) {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            tracing::error!("Failed to run negotiation: {}", e);
            Err(status_for(&e))
        }
    }
}

async fn feasibility(
    State(state): State<AppState>,
    Json(request): Json<NegotiationRequest>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    match state
        .negotiation
        .check_zopa_feasibility(request.buyer_budget, request.seller_base_price)
    {
        Ok(feasible) => Ok(Json(serde_json::json!({ "feasible": feasible }))),
        Err(e) => {
            tracing::error!("Failed to check feasibility: {}", e);
            Err(status_for(&e))
        }
    }
}

async fn settle(
    State(state): State<AppState>,
    Json(request): Json<SettlementRequest>,
) -> std::result::Result<Json<SettlementResult>, StatusCode> {
    match state.settlement.execute_settlement_with_timeout(&request).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            tracing::error!("Failed to execute settlement: {}", e);
            Err(status_for(&e))
        }
    }
}

async fn run_deal(
    State(state): State<AppState>,
    Json(request): Json<DealRequest>,
) -> std::result::Result<Json<DealResponse>, StatusCode> {
    execute_deal(&state, request).await.map(Json).map_err(|e| {
        tracing::error!("Failed to run deal: {}", e);
        status_for(&e)
    })
}

/// Negotiate, then settle on agreement. The feasibility pre-check runs first
/// so a hopeless pairing never reaches the engines.
pub async fn execute_deal(state: &AppState, request: DealRequest) -> Result<DealResponse> {
    if let Some(required) = request.min_reputation {
        let ledger = state.settlement.reputation();
        for agent_id in [&request.buyer_id, &request.seller_id] {
            if !ledger.check_min_reputation(agent_id, required) {
                let score = ledger.score_of(agent_id);
                tracing::info!(
                    agent_id = %agent_id,
                    score,
                    trust_level = ?TrustLevel::from(score),
                    required,
                    "Counterparty below reputation threshold"
                );
                return Err(NegotiationError::InsufficientReputation {
                    agent_id: agent_id.clone(),
                    score,
                    required,
                });
            }
        }
    }

    let sla_tier = request.sla_tier.unwrap_or_else(|| DEFAULT_SLA_TIER.to_string());
    let negotiation_request = NegotiationRequest::new(request.buyer_budget, request.seller_base_price)
        .with_labels(request.buyer_intent, request.seller_capability)
        .with_sla_tier(sla_tier);

    if !state
        .negotiation
        .check_zopa_feasibility(request.buyer_budget, request.seller_base_price)?
    {
        tracing::info!(
            buyer_id = %request.buyer_id,
            seller_id = %request.seller_id,
            "No zone of possible agreement, skipping negotiation"
        );
        return Ok(DealResponse {
            negotiation: NegotiationResult::rejected(state.negotiation.config().max_rounds),
            settlement: None,
        });
    }

    let negotiation = state.negotiation.run_negotiation(&negotiation_request)?;
    let (price, sla) = match (negotiation.agreed_price(), negotiation.agreed_sla()) {
        (Some(price), Some(sla)) => (price, sla.to_string()),
        _ => {
            return Ok(DealResponse {
                negotiation,
                settlement: None,
            })
        }
    };

    let settlement_request = SettlementRequest::new(price, request.buyer_id, request.seller_id)
        .with_sla_tier(sla)
        .with_asset(
            request.asset.unwrap_or_else(|| state.default_asset.clone()),
            request.network.unwrap_or_else(|| state.default_network.clone()),
        );
    let settlement = state
        .settlement
        .execute_settlement_with_timeout(&settlement_request)
        .await?;

    Ok(DealResponse {
        negotiation,
        settlement: Some(settlement),
    })
}

async fn get_reputation(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> std::result::Result<Json<ReputationView>, StatusCode> {
    match state.settlement.reputation().require(&agent_id) {
        Ok(reputation) => Ok(Json(ReputationView::from(reputation))),
        Err(e) => {
            tracing::debug!("Reputation lookup failed: {}", e);
            Err(status_for(&e))
        }
    }
}

async fn list_reputation(State(state): State<AppState>) -> Json<Vec<AgentReputation>> {
    Json(state.settlement.reputation().all())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request},
    };
    use tower::ServiceExt;

    fn router() -> Router {
        build_router(AppState::from_config(&AppConfig::default()).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_negotiate_endpoint() {
        let req = post_json(
            "/negotiate",
            serde_json::json!({"buyer_budget": 100.0, "seller_base_price": 100.0}),
        );
        let resp = router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["status"], "AGREED");
        assert_eq!(body["agreed_price"], 100.0);
        assert_eq!(body["rounds_taken"], 1);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_bad_budget() {
        let req = post_json(
            "/negotiate",
            serde_json::json!({"buyer_budget": -5.0, "seller_base_price": 100.0}),
        );
        let resp = router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_feasibility_endpoint() {
        let req = post_json(
            "/negotiate/feasibility",
            serde_json::json!({"buyer_budget": 10.0, "seller_base_price": 100.0}),
        );
        let resp = router().oneshot(req).await.unwrap();
        assert_eq!(json_body(resp).await["feasible"], false);
    }

    #[tokio::test]
    async fn test_settle_then_read_reputation() {
        let app = router();

        let resp = app
            .clone()
            .oneshot(post_json(
                "/settle",
                serde_json::json!({"agreed_price": 50.0, "buyer_id": "A", "seller_id": "B"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "CONFIRMED");
        assert_eq!(body["asset"], "USDC");

        let req = Request::builder().uri("/reputation/A").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["total_deals"], 1);
        assert_eq!(body["trust_level"], "trusted");

        let req = Request::builder().uri("/reputation/nobody").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_deal_skips_settlement_without_zopa() {
        let state = AppState::from_config(&AppConfig::default()).unwrap();
        let response = execute_deal(
            &state,
            DealRequest {
                buyer_id: "A".to_string(),
                seller_id: "B".to_string(),
                buyer_budget: 10.0,
                seller_base_price: 100.0,
                buyer_intent: "gpu hours".to_string(),
                seller_capability: "h100 cluster".to_string(),
                sla_tier: None,
                asset: None,
                network: None,
                min_reputation: None,
            },
        )
        .await
        .unwrap();

        assert!(!response.negotiation.is_agreed());
        assert!(response.settlement.is_none());
        assert!(state.settlement.reputation().get("A").is_none());
    }

    #[tokio::test]
    async fn test_deal_endpoint_settles_agreement() {
        let mut config = AppConfig::default();
        config.settlement.signing = SigningMode::Ed25519;
        let app = build_router(AppState::from_config(&config).unwrap());

        let resp = app
            .oneshot(post_json(
                "/deals",
                serde_json::json!({
                    "buyer_id": "A",
                    "seller_id": "B",
                    "buyer_budget": 60.0,
                    "seller_base_price": 90.0,
                    "sla_tier": "premium"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["negotiation"]["status"], "AGREED");
        assert_eq!(body["negotiation"]["rounds_taken"], 3);
        assert_eq!(body["settlement"]["status"], "CONFIRMED");
        assert_eq!(body["settlement"]["sla_tier"], "premium");
    }

    #[tokio::test]
    async fn test_deal_refused_below_reputation_threshold() {
        let state = AppState::from_config(&AppConfig::default()).unwrap();
        state
            .settlement
            .reputation()
            .update_after_deal("flaky-seller", false, 10.0, 1.0)
            .unwrap();

        let request = DealRequest {
            buyer_id: "A".to_string(),
            seller_id: "flaky-seller".to_string(),
            buyer_budget: 100.0,
            seller_base_price: 100.0,
            buyer_intent: String::new(),
            seller_capability: String::new(),
            sla_tier: None,
            asset: None,
            network: None,
            min_reputation: Some(0.3),
        };
        let err = execute_deal(&state, request.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::InsufficientReputation { ref agent_id, .. } if agent_id == "flaky-seller"
        ));
        assert_eq!(status_for(&err), StatusCode::FORBIDDEN);
        assert!(state.settlement.reputation().get("A").is_none());

        let relaxed = DealRequest { min_reputation: Some(0.1), ..request };
        let response = execute_deal(&state, relaxed).await.unwrap();
        assert!(response.settlement.unwrap().is_confirmed());
    }
}

//! Composition root (spec §9 design note): one constructed value owning
//! the ledger, the mirror, and the router, replacing the source's
//! process-wide mirror instance and module-global config/pricing.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};

use crate::chain::LiquidMirror;
use crate::config::Config;
use crate::ledger::Ledger;
use crate::{admin, proxy};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub http: reqwest::Client,
    pub config: Arc<Config>,
}

pub struct App {
    pub state: AppState,
    pub mirror: Option<Arc<LiquidMirror>>,
    pub router: Router,
}

impl App {
    pub fn new(config: Config) -> rusqlite::Result<Self> {
        let config = Arc::new(config);
        let ledger = Arc::new(Ledger::open(&config.database_path, &config.usdc_mint, config.sol_usdc_rate)?);

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .pool_idle_timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client configuration is valid");

        let mirror = if config.disable_mirror {
            None
        } else {
            Some(LiquidMirror::new(config.rpc_url(), config.ws_url(), config.program_id.clone(), ledger.clone()))
        };

        let state = AppState { ledger, http, config };
        let router = build_router(state.clone());

        Ok(Self { state, mirror, router })
    }

    /// Starts the liquid mirror's background workers, if enabled. Returns
    /// `None` when `--disable-mirror` is set (used by tests and local
    /// smoke runs that seed balances manually).
    pub async fn start_mirror(&self) -> Option<crate::chain::mirror::MirrorHandles> {
        match &self.mirror {
            Some(mirror) => Some(mirror.start().await),
            None => None,
        }
    }

    pub fn request_mirror_shutdown(&self) {
        if let Some(mirror) = &self.mirror {
            mirror.request_shutdown();
        }
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/v1/register", post(admin::register))
        .route("/v1/register/:deposit_code/status", get(admin::registration_status))
        .route("/v1/pricing", get(admin::pricing))
        .route("/v1/admin/stats", get(admin::stats))
        .route("/proxy/:api_token/v1/chat/completions", post(proxy::handlers::chat_completions))
        .route("/proxy/:api_token/v1/messages", post(proxy::handlers::messages))
        .route("/proxy/:api_token/balance", get(proxy::handlers::balance))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

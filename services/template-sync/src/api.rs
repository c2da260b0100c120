use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gbt_protocol::{
    DevnetTransactionRequest, ErrorBody, ErrorCategory, GenerateRequest, MinerStatus, MiningInfo,
    StartMinerRequest, SubmitBlockReply, SubmitBlockRequest, SubmitHeaderRequest, TemplateReply,
    TemplateRequest,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::devnet::DevnetChain;
use crate::error::{MiningError, MiningResult};
use crate::miner::BackgroundMiner;
use crate::primitives::{self, Transaction};
use crate::service::MiningService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MiningService>,
    pub miner: Arc<BackgroundMiner>,
    /// Present only when running the devnet backend.
    pub devnet: Option<Arc<DevnetChain>>,
}

pub struct ApiError(MiningError);

impl From<MiningError> for ApiError {
    fn from(e: MiningError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorCategory::ValidationRejected | ErrorCategory::VerifyError => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorCategory::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::BuildFailure | ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let category = self.0.category();
        let status = status_for(category);
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            category,
            detail: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Runs a blocking service call off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> MiningResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Ok(Json(result?)),
        Err(e) => Err(ApiError(MiningError::Internal(format!(
            "worker task failed: {e}"
        )))),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/getblocktemplate", post(get_block_template))
        .route("/submitblock", post(submit_block))
        .route("/submitheader", post(submit_header))
        .route("/generate", post(generate))
        .route("/mininginfo", get(mining_info))
        .route("/miner", get(miner_status))
        .route("/miner/start", post(miner_start))
        .route("/miner/stop", post(miner_stop))
        .route("/devnet/transactions", post(devnet_transaction))
        .with_state(state)
}

pub async fn run_http_server<S>(bind_addr: &str, state: AppState, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

async fn get_block_template(
    State(state): State<AppState>,
    Json(req): Json<TemplateRequest>,
) -> ApiResult<TemplateReply> {
    blocking(move || state.service.get_template(&req)).await
}

async fn submit_block(
    State(state): State<AppState>,
    Json(req): Json<SubmitBlockRequest>,
) -> ApiResult<SubmitBlockReply> {
    blocking(move || state.service.submit_block(&req.hexdata)).await
}

async fn submit_header(
    State(state): State<AppState>,
    Json(req): Json<SubmitHeaderRequest>,
) -> ApiResult<Value> {
    blocking(move || {
        state.service.submit_header(&req.hexdata)?;
        Ok(Value::Null)
    })
    .await
}

async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<Vec<String>> {
    blocking(move || {
        let stop = AtomicBool::new(false);
        let hashes =
            state
                .service
                .search_for_blocks(&req.payout_script, req.nblocks, req.maxtries, &stop)?;
        Ok(hashes.iter().map(|h| h.to_string()).collect())
    })
    .await
}

async fn mining_info(State(state): State<AppState>) -> ApiResult<MiningInfo> {
    blocking(move || state.service.mining_info(state.miner.status())).await
}

async fn miner_status(State(state): State<AppState>) -> Json<MinerStatus> {
    Json(state.miner.status())
}

async fn miner_start(
    State(state): State<AppState>,
    Json(req): Json<StartMinerRequest>,
) -> ApiResult<MinerStatus> {
    state
        .miner
        .start(&req.payout_script, req.nthreads, req.maxtries)?;
    Ok(Json(state.miner.status()))
}

async fn miner_stop(State(state): State<AppState>) -> ApiResult<MinerStatus> {
    blocking(move || {
        state.miner.stop();
        Ok(state.miner.status())
    })
    .await
}

async fn devnet_transaction(
    State(state): State<AppState>,
    Json(req): Json<DevnetTransactionRequest>,
) -> ApiResult<Value> {
    let Some(chain) = state.devnet.clone() else {
        return Err(ApiError(MiningError::InvalidInput(
            "transactions can only be injected on the devnet backend".to_string(),
        )));
    };
    let tx: Transaction =
        primitives::from_hex(&req.hex).map_err(|e| MiningError::decode("Transaction", e))?;
    let txid = chain.add_transaction(tx, req.fee)?;
    Ok(Json(json!({ "txid": txid.to_string() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ValidationGateway;
    use crate::primitives::{BlockHash, BlockHeader, BlockVersion, CompactTarget, TxMerkleNode};
    use crate::primitives::{Txid, to_hex};
    use bitcoin::hashes::Hash as _;
    use crate::service::tests::service;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use tower::ServiceExt;

    fn app() -> (Router, Arc<DevnetChain>) {
        let (svc, chain) = service();
        let state = AppState {
            miner: Arc::new(BackgroundMiner::new(svc.clone())),
            service: svc,
            devnet: Some(chain.clone()),
        };
        (router(state), chain)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _) = app();
        let (status, body) = call(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("ok".into()));
    }

    #[tokio::test]
    async fn serves_template_over_http() {
        let (app, chain) = app();
        let (status, body) = call(&app, post_json("/getblocktemplate", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["height"], 1);
        assert_eq!(
            body["previousblockhash"],
            chain.current_tip().unwrap().hash.to_string()
        );
        assert_eq!(body["bits"], "207fffff");
    }

    #[tokio::test]
    async fn errors_carry_category_and_status() {
        let (app, _) = app();
        let (status, body) = call(
            &app,
            post_json("/getblocktemplate", json!({ "mode": "bogus" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["category"], "invalid_input");

        let orphan = BlockHeader {
            version: BlockVersion::ONE,
            prev_blockhash: BlockHash::hash(b"unknown"),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 0,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: 0,
        };
        let (status, body) = call(
            &app,
            post_json(
                "/submitheader",
                json!({ "hexdata": to_hex(&orphan) }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["category"], "validation_rejected");
    }

    #[tokio::test]
    async fn generate_then_mining_info() {
        let (app, _) = app();
        let (status, body) = call(
            &app,
            post_json("/generate", json!({ "nblocks": 2, "payout_script": "51" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let hashes = body.as_array().unwrap();
        assert_eq!(hashes.len(), 2);

        let (status, info) = call(&app, get("/mininginfo")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["blocks"], 2);
        assert_eq!(info["bestblockhash"], hashes[1]);
        assert_eq!(info["miner"]["status"], "stopped");
        assert_eq!(info["miner"]["nthreads"], 0);
        assert_eq!(info["chain"], "devnet");
        assert_eq!(info["protocol_version"], gbt_protocol::PROTOCOL_VERSION);
        assert!(info["difficulty"].as_f64().is_some());
    }

    #[tokio::test]
    async fn submitblock_reports_duplicate() {
        let (app, chain) = app();
        let block = crate::devnet::tests::mine_next(&chain, 7);
        let req = || post_json("/submitblock", json!({ "hexdata": to_hex(&block) }));

        let (status, body) = call(&app, req()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], Value::Null);

        let (_, body) = call(&app, req()).await;
        assert_eq!(body["status"], "duplicate");
    }

    #[tokio::test]
    async fn devnet_transactions_enter_mempool() {
        let (app, chain) = app();
        let tx = crate::template::tests::spend(Txid::hash(b"coin"), 0, 3);
        let (status, body) = call(
            &app,
            post_json(
                "/devnet/transactions",
                json!({ "hex": to_hex(&tx), "fee": 1_000 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["txid"], tx.txid().to_string());
        assert_eq!(crate::gateway::MempoolSource::size(chain.as_ref()), 1);

        let (status, _) = call(
            &app,
            post_json("/devnet/transactions", json!({ "hex": "zz", "fee": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn miner_start_and_stop() {
        let (app, _) = app();
        let (status, _) = call(
            &app,
            post_json("/miner/start", json!({ "payout_script": "51" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = call(
            &app,
            post_json(
                "/miner/start",
                json!({ "payout_script": "51", "nthreads": 2 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        assert_eq!(body["nthreads"], 2);

        let (_, body) = call(&app, post_json("/miner/stop", json!({}))).await;
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["nthreads"], 0);

        let (_, body) = call(&app, get("/miner")).await;
        assert_eq!(body["status"], "stopped");
    }
}

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::config::PipelineConfig;
use crate::pipeline::{CollectionPipeline, QueryPipeline};
use crate::{PipelineError, Result};

pub mod collect;
pub mod query;

#[derive(Clone)]
pub struct AppState {
    pub queries: Arc<QueryPipeline>,
    /// Present when a monitoring endpoint is configured
    pub collection: Option<Arc<CollectionPipeline>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/query", get(query::run_query).post(query::run_query))
        .route("/collect", post(collect::run_collection))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_query_node(config: Arc<PipelineConfig>) -> Result<()> {
    let queries = Arc::new(QueryPipeline::from_config(config.clone())?);
    let collection = match config.monitoring_endpoint {
        Some(_) => Some(Arc::new(CollectionPipeline::from_config(config.clone())?)),
        None => None,
    };

    let app = router(AppState {
        queries,
        collection,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    info!(
        addr = %addr,
        storage_root = %config.storage_root().display(),
        database = %config.database,
        "starting query node"
    );

    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        PipelineError::Configuration(format!("Failed to bind to address {}: {}", addr, e))
    })?;

    axum::serve(listener, app)
        .await
        .map_err(|e| PipelineError::Upstream {
            message: format!("Server error: {}", e),
            transient: false,
        })?;

    Ok(())
}

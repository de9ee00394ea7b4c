use axum::{extract::State, Json};

use super::AppState;
use crate::models::CollectionReport;
use crate::{PipelineError, Result};

/// Runs one collection for the most recent window.
pub async fn run_collection(State(state): State<AppState>) -> Result<Json<CollectionReport>> {
    let pipeline = state.collection.as_ref().ok_or_else(|| {
        PipelineError::Configuration("collection is not configured on this node".into())
    })?;
    Ok(Json(pipeline.run().await?))
}

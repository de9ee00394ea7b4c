use std::env;
use std::sync::Arc;

use metrics_lake::{api, config::PipelineConfig, logging, pipeline::CollectionPipeline, Result};

#[tokio::main]
async fn main() {
    let role = env::var("PIPELINE_ROLE").unwrap_or_else(|_| "query".to_string());

    if let Err(err) = logging::init_logger(&role) {
        eprintln!("{}", err);
        std::process::exit(1);
    }

    if let Err(err) = run(&role).await {
        tracing::error!(role = %role, kind = err.kind(), error = %err, "pipeline exited with error");
        std::process::exit(1);
    }
}

async fn run(role: &str) -> Result<()> {
    let config = Arc::new(PipelineConfig::from_env()?);

    match role {
        "query" => api::start_query_node(config).await,
        "collect" => {
            let report = CollectionPipeline::from_config(config)?.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        _ => {
            eprintln!("Invalid PIPELINE_ROLE. Must be 'query' or 'collect'");
            std::process::exit(1);
        }
    }
}

//! Dext broker server
//!
//! Run with: dext-server

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dext::broker::{Broker, BrokerConfig};
use dext::embedding::EmbeddingConfig;
use dext::retrieval::RetrievalOptions;

#[derive(Parser, Debug)]
#[command(name = "dext-server")]
#[command(about = "Tool-retrieval broker for MCP agents")]
struct Args {
    /// Database path
    #[arg(long, env = "DEXT_DB_PATH", default_value = "~/.dext/tools_vector.db")]
    db_path: String,

    /// Embedding endpoint API key
    #[arg(long, env = "EMBEDDING_API_KEY")]
    embedding_api_key: Option<String>,

    /// Embedding endpoint root
    #[arg(
        long,
        env = "EMBEDDING_BASE_URL",
        default_value = "https://ark.cn-beijing.volces.com/api/v3"
    )]
    embedding_base_url: String,

    /// Embedding model identifier, recorded alongside each vector
    #[arg(
        long,
        env = "EMBEDDING_MODEL_NAME",
        default_value = "doubao-embedding-text-240715"
    )]
    embedding_model_name: String,

    /// Embedding output dimension; must match the vector index width
    #[arg(long, env = "EMBEDDING_VECTOR_DIMENSION", default_value = "1024")]
    embedding_vector_dimension: usize,

    /// Candidates returned per retrieval query
    #[arg(long, env = "TOOL_RETRIEVER_TOP_K", default_value = "5")]
    top_k: usize,

    /// Similarity floor for retrieval
    #[arg(long, env = "TOOL_RETRIEVER_THRESHOLD", default_value = "0.10")]
    threshold: f32,

    /// Port for the MCP endpoint and the REST API
    #[arg(long, env = "MCP_SERVER_PORT", default_value = "3000")]
    port: u16,

    /// Port reserved for upstream OAuth callbacks
    #[arg(long, env = "MCP_CALLBACK_PORT", default_value = "3001")]
    callback_port: u16,

    /// Upstream invocation deadline in seconds (capped at 600)
    #[arg(long, env = "DEXT_EXECUTOR_TIMEOUT", default_value = "300")]
    executor_timeout_seconds: u64,
}

#[tokio::main]
async fn main() -> dext::Result<()> {
    // Logs go to stderr; stdout stays clean for tooling
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Expand ~ in path
    let db_path = shellexpand::tilde(&args.db_path).to_string();

    let config = BrokerConfig {
        db_path,
        embedding: EmbeddingConfig {
            api_key: args.embedding_api_key,
            base_url: args.embedding_base_url,
            model_name: args.embedding_model_name,
            dimension: args.embedding_vector_dimension,
        },
        retrieval: RetrievalOptions {
            top_k: args.top_k,
            threshold: args.threshold,
        },
        executor_timeout: Duration::from_secs(args.executor_timeout_seconds),
    };

    let broker = Arc::new(Broker::new(&config)?);

    tracing::info!(
        db = %config.db_path,
        port = args.port,
        callback_port = args.callback_port,
        "dext broker starting"
    );

    broker.boot().await;

    dext::api::serve(broker, args.port).await?;

    Ok(())
}

//! Chat search node CLI
//!
//! Command-line interface for searching the chat corpus and running the API.

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chatsearch_node::api::HealthResponse;
use chatsearch_node::search::SearchProgress;
use chatsearch_node::{
    ApiServer, AppState, CacheManagerConfig, CacheStorage, CachedEmbeddingFetcher, CorpusSource,
    EmbeddingCacheManager, EmbeddingFetcher, Error, FileStorage, HttpEmbeddingFetcher,
    InMemoryCorpus, JsonFileCorpus, MemoryStorage, NodeConfig, RestCorpusSource, Result,
    SearchContext, SearchQuery,
};

#[derive(Parser)]
#[command(name = "chatsearch")]
#[command(author, version, about = "Semantic search over chat messages", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },

    /// Search the corpus for messages similar to TEXT
    Search {
        text: String,

        /// Number of results to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Rebuild the embedding cache from the corpus
    Refresh,

    /// Run the HTTP API
    Serve {
        /// HTTP API listen address (overrides the config file)
        #[arg(long)]
        addr: Option<String>,
    },

    /// Check a running node's health
    Health {
        /// API endpoint to check
        #[arg(long, default_value = "http://localhost:8080")]
        endpoint: String,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: &str) -> Result<NodeConfig> {
    if Path::new(path).exists() {
        info!("Loading configuration from: {}", path);
        NodeConfig::load(path)
    } else {
        info!("Using default configuration");
        Ok(NodeConfig::default())
    }
}

fn build_storage(config: &NodeConfig) -> Arc<dyn CacheStorage> {
    match &config.cache.path {
        Some(path) => {
            debug!("Persisting embedding cache at {}", path.display());
            Arc::new(FileStorage::new(path.clone()))
        }
        None => {
            debug!("Embedding cache is memory only");
            Arc::new(MemoryStorage::new())
        }
    }
}

fn build_corpus(config: &NodeConfig) -> Result<Arc<dyn CorpusSource>> {
    if let Some(url) = &config.corpus.rest_url {
        info!("Corpus source: {}", url);
        return Ok(Arc::new(RestCorpusSource::new(
            url.clone(),
            config.corpus.api_key(),
        )?));
    }
    if let Some(file) = &config.corpus.file {
        info!("Corpus source: {}", file.display());
        return Ok(Arc::new(JsonFileCorpus::new(file.clone())));
    }
    warn!("No corpus source configured; searches will see an empty corpus");
    Ok(Arc::new(InMemoryCorpus::default()))
}

fn build_fetcher(config: &NodeConfig) -> Result<Arc<dyn EmbeddingFetcher>> {
    let embedding = &config.embedding;

    #[cfg(feature = "local-embeddings")]
    let base: Arc<dyn EmbeddingFetcher> = if embedding.endpoint == "local" {
        info!("Loading local embedding model...");
        Arc::new(chatsearch_node::search::LocalEmbeddingFetcher::new()?)
    } else {
        Arc::new(http_fetcher(config)?)
    };
    #[cfg(not(feature = "local-embeddings"))]
    let base: Arc<dyn EmbeddingFetcher> = Arc::new(http_fetcher(config)?);

    if embedding.memo_ttl_secs == 0 {
        return Ok(base);
    }
    Ok(Arc::new(CachedEmbeddingFetcher::new(
        base,
        Duration::from_secs(embedding.memo_ttl_secs),
        embedding.memo_capacity,
    )))
}

fn http_fetcher(config: &NodeConfig) -> Result<HttpEmbeddingFetcher> {
    Ok(
        HttpEmbeddingFetcher::new(config.embedding.endpoint.clone(), config.embedding.timeout())?
            .with_api_key(config.embedding.api_key())
            .with_dimension(Some(config.cache.dimension)),
    )
}

fn build_context(config: &NodeConfig) -> Result<SearchContext> {
    let cache = EmbeddingCacheManager::new(
        build_storage(config),
        CacheManagerConfig {
            ttl: config.cache.ttl(),
            dimension: Some(config.cache.dimension),
        },
    );
    Ok(SearchContext::new(
        Arc::new(cache),
        build_fetcher(config)?,
        build_corpus(config)?,
    )
    .with_top_k(config.search.top_k))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Init { output } => {
            info!("Initializing new configuration at: {}", output);
            let config = NodeConfig::default();
            config.save(&output)?;
            info!("Configuration saved successfully");
        }

        Commands::Search { text, top_k } => {
            let config = load_config(&cli.config)?;
            let context = build_context(&config)?;
            context.init().await;

            let mut query = SearchQuery::new(text);
            query.top_k = top_k;

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SearchProgress>();
            let progress = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    debug!("Search progress: {:?}", event);
                }
            });

            let results = context.search_with_progress(&query, Some(&tx)).await;
            drop(tx);
            let _ = progress.await;

            match results {
                Ok(results) => {
                    if results.is_empty() {
                        info!("No matching messages");
                    }
                    for (i, result) in results.iter().enumerate() {
                        println!(
                            "{:>2}. [{:.4}] {}",
                            i + 1,
                            result.score,
                            result.entry.text
                        );
                    }
                }
                Err(e) => {
                    error!("Search failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Refresh => {
            let config = load_config(&cli.config)?;
            let context = build_context(&config)?;
            let entries = context.refresh().await?;
            info!("Embedding cache refreshed with {} entries", entries);
        }

        Commands::Serve { addr } => {
            info!("Starting chat search node...");
            let config = load_config(&cli.config)?;
            let addr = addr.unwrap_or_else(|| config.api.listen_address.clone());

            let metrics = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| Error::Config(format!("Failed to install metrics recorder: {}", e)))?;

            let context = build_context(&config)?;
            context.init().await;

            let app_state = AppState::new(context).with_metrics(metrics);
            let mut api_config = config.api.clone();
            api_config.listen_address = addr.clone();
            let api_server = ApiServer::with_state(api_config, app_state);

            let server = tokio::spawn(async move { api_server.run(&addr).await });

            info!("Press Ctrl+C to stop");
            tokio::select! {
                result = server => {
                    match result {
                        Ok(Err(e)) => error!("API server error: {}", e),
                        Err(e) => error!("API server task failed: {}", e),
                        Ok(Ok(())) => {}
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("Received shutdown signal");
                }
            }
            info!("Node stopped");
        }

        Commands::Health { endpoint } => {
            info!("Checking node health at: {}", endpoint);

            match check_health(&endpoint).await {
                Ok(response) => {
                    info!("Node status: {}", response.status);
                    info!("Version: {}", response.version);
                    info!("Cached entries: {}", response.entries);
                    match response.last_refreshed {
                        Some(ts) => info!("Last refreshed: {} (epoch ms)", ts),
                        None => info!("Last refreshed: never"),
                    }
                    info!("Uptime: {} seconds", response.uptime);
                }
                Err(e) => {
                    error!("Health check failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Perform a health check against the API endpoint.
async fn check_health(endpoint: &str) -> Result<HealthResponse> {
    let url = format!("{}/health", endpoint.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| Error::Api(format!("Failed to build client: {}", e)))?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Api(format!("Connection failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(Error::Api(format!("Unexpected status {}", response.status())));
    }

    response
        .json()
        .await
        .map_err(|e| Error::Api(format!("JSON parse error: {}", e)))
}

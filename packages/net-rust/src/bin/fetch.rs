//! `conductor-fetch`: loads resources through the conductor resource loader.
//!
//! Every URL is loaded concurrently. Repeated URLs share one request.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use conductor_core::ExclusivityRegistry;
use conductor_net::{CachePolicy, NetConfig, ResourceLoader};
use futures_util::future::join_all;
use reqwest::Url;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "conductor-fetch",
    version,
    about = "Fetch resources with deduplication and reachability gating"
)]
struct Args {
    /// URLs to load.
    #[arg(required = true)]
    urls: Vec<Url>,

    /// `User-Agent` header sent with every request.
    #[arg(long, env = "CONDUCTOR_USER_AGENT")]
    user_agent: Option<String>,

    /// Per-request timeout in seconds.
    #[arg(long, env = "CONDUCTOR_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// `Accept` header sent with every request.
    #[arg(long, env = "CONDUCTOR_ACCEPT", default_value = "*/*")]
    accept: String,

    /// Maximum number of fetches executing at once.
    #[arg(long, env = "CONDUCTOR_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Emit logs and results as JSON lines.
    #[arg(long, env = "CONDUCTOR_JSON")]
    json: bool,
}

impl Args {
    fn config(&self) -> NetConfig {
        let mut config = NetConfig {
            request_timeout: Duration::from_secs(self.timeout_secs),
            resource_accept: self.accept.clone(),
            max_concurrent_fetches: self.max_concurrent,
            ..NetConfig::default()
        };
        if let Some(user_agent) = &self.user_agent {
            config.user_agent.clone_from(user_agent);
        }
        config
    }
}

#[derive(Debug, Serialize)]
struct Report {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let loader = ResourceLoader::from_config(&args.config(), Arc::new(ExclusivityRegistry::new()))?;
    let unique: BTreeSet<&Url> = args.urls.iter().collect();
    info!(requested = args.urls.len(), unique = unique.len(), "loading resources");

    let loads = args
        .urls
        .iter()
        .map(|url| {
            let fetch = loader.load(url.clone(), CachePolicy::UseCache);
            async move { (url, fetch.await) }
        })
        .collect::<Vec<_>>();

    let mut failed = 0usize;
    for (url, result) in join_all(loads).await {
        let report = match result {
            Ok(body) => Report {
                url: url.to_string(),
                bytes: Some(body.len()),
                error: None,
            },
            Err(err) => {
                failed += 1;
                Report {
                    url: url.to_string(),
                    bytes: None,
                    error: Some(err.to_string()),
                }
            }
        };
        if args.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            match (&report.bytes, &report.error) {
                (Some(bytes), _) => println!("{bytes:>10}  {}", report.url),
                (None, Some(error)) => println!("{:>10}  {}  {error}", "failed", report.url),
                (None, None) => {}
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} loads failed", args.urls.len());
    }
    Ok(())
}

/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use fedi3_relations::collection_fetch::HttpCollectionFetcher;
use fedi3_relations::discovery::RelationDiscovery;
use fedi3_relations::discovery_policy::{DiscoveryConfig, DiscoveryPolicy, SystemClock};
use fedi3_relations::discovery_queue::DiscoveryWorker;
use fedi3_relations::relation_db::RelationDb;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    db_path: PathBuf,
    #[serde(default)]
    discovery: DiscoveryConfig,
}

fn default_config_path() -> Result<PathBuf> {
    if cfg!(target_os = "windows") {
        let base = std::env::var("APPDATA")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        return Ok(PathBuf::from(base).join("Fedi3").join("relations.json"));
    }
    if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        return Ok(PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join("Fedi3")
            .join("relations.json"));
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Ok(PathBuf::from(home).join(".config").join("fedi3").join("relations.json"))
}

struct Args {
    config: PathBuf,
    discover: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut discover = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            "--discover" => {
                let url = args.next().context("--discover requires a profile url")?;
                discover.push(url);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    let config = match config {
        Some(p) => p,
        None => match std::env::var("FEDI3_RELATIONS_CONFIG") {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => default_config_path()?,
        },
    };
    Ok(Args { config, discover })
}

fn load_config(text: &str) -> Result<ServiceConfig> {
    serde_json::from_str(text).context("decode relations service config")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    info!("config: {}", args.config.display());
    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("read config: {}", args.config.display()))?;
    let cfg = load_config(&text)?;

    let db = Arc::new(RelationDb::open(&cfg.db_path)?);
    info!(
        level = ?DiscoveryPolicy::new(&cfg.discovery).level(),
        "relations db: {}",
        cfg.db_path.display()
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("build http client")?;
    let discovery = Arc::new(RelationDiscovery::new(
        db.clone(),
        (*db).clone(),
        HttpCollectionFetcher::new(http, &cfg.discovery),
        DiscoveryPolicy::new(&cfg.discovery),
        SystemClock,
    ));

    let worker = DiscoveryWorker::new(&cfg.discovery);
    for url in &args.discover {
        if let Err(e) = worker.enqueue(&db, url).await {
            warn!("enqueue {url} failed: {e:#}");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    worker.start(shutdown_rx, db, discovery);

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    Ok(())
}

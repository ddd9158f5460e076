/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use fedi3_relations::collection_fetch::HttpCollectionFetcher;
use fedi3_relations::discovery::RelationDiscovery;
use fedi3_relations::discovery_policy::{DiscoveryConfig, DiscoveryLevel, DiscoveryPolicy, SystemClock};
use fedi3_relations::relation_db::{RelationDb, RelationStore};
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let db_path = env::args().nth(1).unwrap_or_default();
    let profile_url = env::args().nth(2).unwrap_or_default();
    if db_path.trim().is_empty() || profile_url.trim().is_empty() {
        anyhow::bail!("usage: dev_discover <db_path> <profile_url> [level 0..3]");
    }
    let level = match env::args().nth(3) {
        Some(v) => DiscoveryLevel::try_from(v.trim().parse::<u8>()?).map_err(anyhow::Error::msg)?,
        None => DiscoveryLevel::All,
    };

    let cfg = DiscoveryConfig {
        level: Some(level),
        ..DiscoveryConfig::default()
    };
    let db = Arc::new(RelationDb::open(db_path.trim())?);
    let discovery = RelationDiscovery::new(
        db.clone(),
        (*db).clone(),
        HttpCollectionFetcher::new(reqwest::Client::new(), &cfg),
        DiscoveryPolicy::new(&cfg),
        SystemClock,
    );

    let outcome = discovery.discover_by_url(profile_url.trim()).await?;
    println!("outcome={outcome:?}");
    if let Some(contact) = db.contact_by_url(profile_url.trim())? {
        println!("contact_id={}", contact.id);
        println!("relations={}", db.list_relations_from(contact.id)?.len());
    }
    Ok(())
}

/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::collection_fetch::{CollectionFetcher, CollectionItems};
use crate::discovery_policy::{Clock, DiscoveryPolicy, Eligibility, Rejection, SystemClock};
use crate::relation_db::{blocking, normalise_link, Contact, RelationDb, RelationStore};
use anyhow::Result;
use async_trait::async_trait;
use fedi3_protocol::CollectionEntry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Maps profile URLs to local contact identities.
#[async_trait]
pub trait ContactResolver: Send + Sync {
    async fn get_by_url(&self, url: &str) -> Result<Option<Contact>>;

    /// May create a minimal contact record for an unseen remote URL.
    async fn get_id_for_url(&self, url: &str) -> Result<Option<i64>>;
}

#[async_trait]
impl ContactResolver for RelationDb {
    async fn get_by_url(&self, url: &str) -> Result<Option<Contact>> {
        let db = self.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || db.contact_by_url(&url)).await?
    }

    async fn get_id_for_url(&self, url: &str) -> Result<Option<i64>> {
        let db = self.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || db.contact_id_for_url(&url)).await?
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    UnknownContact,
    Rejected(Rejection),
    /// Neither collection yielded entries; only the cooldown stamp was written.
    EmptyResult,
    Reconciled {
        followers: u64,
        following: u64,
        pruned: u64,
    },
}

/// Runs discovery passes: gate, fetch both collections, reconcile the edge table.
///
/// Passes for the same target must not overlap; the clear/reconcile/prune
/// sequence spans several statements and is not atomic.
pub struct RelationDiscovery<S, R, F, C = SystemClock> {
    store: Arc<S>,
    resolver: R,
    fetcher: F,
    policy: DiscoveryPolicy,
    clock: C,
}

impl<S, R, F, C> RelationDiscovery<S, R, F, C>
where
    S: RelationStore + 'static,
    R: ContactResolver,
    F: CollectionFetcher,
    C: Clock,
{
    pub fn new(store: Arc<S>, resolver: R, fetcher: F, policy: DiscoveryPolicy, clock: C) -> Self {
        Self {
            store,
            resolver,
            fetcher,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &DiscoveryPolicy {
        &self.policy
    }

    pub async fn is_discoverable(&self, url: &str, contact: Option<&Contact>) -> Result<bool> {
        self.policy
            .is_discoverable(&self.store, &self.fetcher, self.clock.now_ms(), url, contact)
            .await
    }

    pub async fn record_interaction(&self, subject_id: i64, actor_id: i64, ts_ms: i64) -> Result<()> {
        blocking(&self.store, move |s| s.record_interaction(subject_id, actor_id, ts_ms)).await
    }

    /// Storage errors abort the pass and leave `last_discovery_ms` untouched so
    /// the profile stays eligible for the next attempt.
    pub async fn discover_by_url(&self, url: &str) -> Result<DiscoveryOutcome> {
        let url = url.trim();
        let Some(contact) = self.resolver.get_by_url(url).await? else {
            debug!(url, "discovery skipped: unknown contact");
            return Ok(DiscoveryOutcome::UnknownContact);
        };

        let probed = match self
            .policy
            .check(&self.store, &self.fetcher, self.clock.now_ms(), url, Some(&contact))
            .await?
        {
            Eligibility::Eligible(actor) => actor,
            Eligibility::Rejected(reason) => {
                debug!(url, ?reason, "discovery skipped");
                return Ok(DiscoveryOutcome::Rejected(reason));
            }
        };

        let actor = match probed {
            Some(actor) => actor,
            None => self.fetcher.fetch_actor(url).await.unwrap_or_default(),
        };
        let followers = match actor.followers.as_deref() {
            Some(col) => self.fetcher.fetch_items(col).await,
            None => CollectionItems::default(),
        };
        let following = match actor.following.as_deref() {
            Some(col) => self.fetcher.fetch_items(col).await,
            None => CollectionItems::default(),
        };

        let target = contact.id;
        if followers.is_empty() && following.is_empty() {
            let now = self.clock.now_ms();
            blocking(&self.store, move |s| s.mark_discovered(target, now)).await?;
            info!(target_id = target, url, "no followers or following collected");
            return Ok(DiscoveryOutcome::EmptyResult);
        }

        let now = self.clock.now_ms();
        // Followers past a paging cap were never seen, so their edges can not be judged stale.
        let sweep_followers = !followers.is_empty() && !followers.truncated;
        if followers.truncated {
            debug!(target_id = target, url, "follower list truncated, keeping unconfirmed followers");
        }
        if sweep_followers {
            blocking(&self.store, move |s| s.clear_follow_flags(target)).await?;
        }

        let follower_urls = profile_urls(&followers);
        let following_urls = profile_urls(&following);
        let mut seen = HashSet::new();
        let unique = followers
            .entries
            .iter()
            .chain(following.entries.iter())
            .filter_map(CollectionEntry::profile_url)
            .filter(|u| seen.insert(normalise_link(u)))
            .collect::<Vec<_>>();

        let mut follower_count = 0u64;
        let mut following_count = 0u64;
        for entry_url in unique {
            let id = match self.resolver.get_id_for_url(entry_url).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    debug!(url = entry_url, "relation entry not resolvable");
                    continue;
                }
                Err(e) => {
                    debug!("resolve relation entry {entry_url} failed: {e:#}");
                    continue;
                }
            };
            if id == target {
                continue;
            }
            let nurl = normalise_link(entry_url);
            if follower_urls.contains(&nurl) {
                blocking(&self.store, move |s| s.set_follow_state(target, id, true, now)).await?;
                follower_count += 1;
            }
            if following_urls.contains(&nurl) {
                blocking(&self.store, move |s| s.set_follow_state(id, target, true, now)).await?;
                following_count += 1;
            }
        }

        let pruned = if sweep_followers {
            blocking(&self.store, move |s| s.prune_stale_followers(target)).await?
        } else {
            0
        };

        let now = self.clock.now_ms();
        blocking(&self.store, move |s| s.mark_discovered(target, now)).await?;
        info!(
            target_id = target,
            url,
            followers = follower_count,
            following = following_count,
            pruned,
            "relation discovery finished"
        );
        Ok(DiscoveryOutcome::Reconciled {
            followers: follower_count,
            following: following_count,
            pruned,
        })
    }
}

fn profile_urls(items: &CollectionItems) -> HashSet<String> {
    items
        .entries
        .iter()
        .filter_map(CollectionEntry::profile_url)
        .map(normalise_link)
        .collect()
}

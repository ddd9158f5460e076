/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::collection_fetch::CollectionFetcher;
use crate::relation_db::{blocking, Contact, RelationStore};
use anyhow::Result;
use fedi3_protocol::RemoteActor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const DAY_MS: i64 = 24 * 3600 * 1000;
const HOUR_MS: i64 = 3600 * 1000;

/// How far relation discovery may reach. Ordered from most to least restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DiscoveryLevel {
    /// Never discover.
    None = 0,
    /// Only profiles a local user follows or is followed by.
    Local = 1,
    /// `Local` plus remote profiles that interacted with a local profile.
    Interactor = 2,
    /// Any profile, with the new-account throttle.
    All = 3,
}

impl TryFrom<u8> for DiscoveryLevel {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Local),
            2 => Ok(Self::Interactor),
            3 => Ok(Self::All),
            other => Err(format!("invalid discovery level {other} (expected 0..=3)")),
        }
    }
}

impl From<DiscoveryLevel> for u8 {
    fn from(v: DiscoveryLevel) -> Self {
        v as u8
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// 0=none, 1=local, 2=interactor, 3=all
    pub level: Option<DiscoveryLevel>,
    pub cooldown_days: Option<u32>,
    pub new_account_hours: Option<u32>,
    /// Networks whose actors expose followers/following collections without probing.
    pub native_networks: Option<Vec<String>>,

    pub fetch_max_pages: Option<u32>,
    pub fetch_max_items: Option<u32>,
    pub fetch_attempts: Option<u32>,

    pub worker_tick_secs: Option<u64>,
    pub worker_batch: Option<u32>,
    pub job_max_attempts: Option<u32>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            level: Some(DiscoveryLevel::None),
            cooldown_days: Some(30),
            new_account_hours: Some(24),
            native_networks: Some(vec!["apub".to_string(), "dfrn".to_string()]),
            fetch_max_pages: Some(100),
            fetch_max_items: Some(10_000),
            fetch_attempts: Some(3),
            worker_tick_secs: Some(30),
            worker_batch: Some(20),
            job_max_attempts: Some(5),
        }
    }
}

/// Source of "now" for cooldown and throttle comparisons.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        crate::relation_db::now_ms()
    }
}

/// Why a profile is not eligible for discovery right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Disabled,
    UnknownContact,
    CoolingDown,
    NotLocal,
    NoInteraction,
    NewAccount,
    NoActor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    /// Carries the actor document when the capability probe already fetched it.
    Eligible(Option<RemoteActor>),
    Rejected(Rejection),
}

impl Eligibility {
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::Eligible(_) => None,
            Self::Rejected(reason) => Some(*reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryPolicy {
    level: DiscoveryLevel,
    cooldown_ms: i64,
    new_account_ms: i64,
    native_networks: Vec<String>,
}

impl DiscoveryPolicy {
    pub fn new(cfg: &DiscoveryConfig) -> Self {
        let defaults = DiscoveryConfig::default();
        let cooldown_days = cfg.cooldown_days.or(defaults.cooldown_days).unwrap_or(30);
        let new_account_hours = cfg.new_account_hours.or(defaults.new_account_hours).unwrap_or(24);
        Self {
            level: cfg.level.unwrap_or(DiscoveryLevel::None),
            cooldown_ms: (cooldown_days as i64).saturating_mul(DAY_MS),
            new_account_ms: (new_account_hours as i64).saturating_mul(HOUR_MS),
            native_networks: cfg
                .native_networks
                .clone()
                .or(defaults.native_networks)
                .unwrap_or_default(),
        }
    }

    pub fn with_level(level: DiscoveryLevel) -> Self {
        Self::new(&DiscoveryConfig {
            level: Some(level),
            ..DiscoveryConfig::default()
        })
    }

    pub fn level(&self) -> DiscoveryLevel {
        self.level
    }

    pub async fn is_discoverable<S, F>(
        &self,
        store: &Arc<S>,
        fetcher: &F,
        now_ms: i64,
        url: &str,
        contact: Option<&Contact>,
    ) -> Result<bool>
    where
        S: RelationStore + 'static,
        F: CollectionFetcher + ?Sized,
    {
        let verdict = self.check(store, fetcher, now_ms, url, contact).await?;
        Ok(verdict.rejection().is_none())
    }

    /// Applies the rules in order; the first one that fails names the rejection.
    pub async fn check<S, F>(
        &self,
        store: &Arc<S>,
        fetcher: &F,
        now_ms: i64,
        url: &str,
        contact: Option<&Contact>,
    ) -> Result<Eligibility>
    where
        S: RelationStore + 'static,
        F: CollectionFetcher + ?Sized,
    {
        if self.level == DiscoveryLevel::None {
            return Ok(Eligibility::Rejected(Rejection::Disabled));
        }

        let contact = match contact {
            Some(c) => c.clone(),
            None => {
                let lookup = url.to_string();
                match blocking(store, move |s| s.contact_by_url(&lookup)).await? {
                    Some(c) => c,
                    None => return Ok(Eligibility::Rejected(Rejection::UnknownContact)),
                }
            }
        };

        if let Some(last) = contact.last_discovery_ms {
            if last > now_ms.saturating_sub(self.cooldown_ms) {
                debug!(url, last_discovery_ms = last, "discovery cooldown active");
                return Ok(Eligibility::Rejected(Rejection::CoolingDown));
            }
        }

        if self.level != DiscoveryLevel::All {
            let nurl = contact.nurl.clone();
            let local = blocking(store, move |s| s.has_local_contact(&nurl)).await?;
            if self.level == DiscoveryLevel::Local && !local {
                debug!(url, "not a local relation");
                return Ok(Eligibility::Rejected(Rejection::NotLocal));
            }
            if self.level == DiscoveryLevel::Interactor && !local {
                let id = contact.id;
                if !blocking(store, move |s| s.has_recorded_interaction(id)).await? {
                    debug!(url, "no local relation and no recorded interaction");
                    return Ok(Eligibility::Rejected(Rejection::NoInteraction));
                }
            }
        } else if contact.created_ms > now_ms.saturating_sub(self.new_account_ms) {
            debug!(url, created_ms = contact.created_ms, "contact too new for discovery");
            return Ok(Eligibility::Rejected(Rejection::NewAccount));
        }

        if self.native_networks.iter().any(|n| n == &contact.network) {
            return Ok(Eligibility::Eligible(None));
        }
        match fetcher.fetch_actor(url).await {
            Some(actor) => Ok(Eligibility::Eligible(Some(actor))),
            None => {
                debug!(url, network = %contact.network, "no discoverable actor");
                Ok(Eligibility::Rejected(Rejection::NoActor))
            }
        }
    }
}

/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::discovery_policy::DiscoveryConfig;
use crate::http_retry::send_with_retry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use fedi3_protocol::{CollectionEntry, CollectionPage, OrderedCollection, PageRef, RemoteActor};
use reqwest::header::{ACCEPT, USER_AGENT};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

const AP_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Entries gathered from one followers/following collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionItems {
    pub entries: Vec<CollectionEntry>,
    /// Paging stopped at the page or item cap: entries past it were never seen,
    /// so the list can not be used to decide which edges went stale.
    pub truncated: bool,
}

impl CollectionItems {
    pub fn complete(entries: Vec<CollectionEntry>) -> Self {
        Self {
            entries,
            truncated: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Remote side of a discovery pass. Implementations hide transport errors:
/// a failed fetch is indistinguishable from an absent actor or an empty collection.
#[async_trait]
pub trait CollectionFetcher: Send + Sync {
    /// Fetches the actor document. Doubles as the capability probe for
    /// profiles on networks that do not natively expose collections.
    async fn fetch_actor(&self, profile_url: &str) -> Option<RemoteActor>;

    /// Fetches the entries of a followers/following collection, following pagination.
    async fn fetch_items(&self, collection_url: &str) -> CollectionItems;
}

#[derive(Clone)]
pub struct HttpCollectionFetcher {
    http: reqwest::Client,
    max_pages: usize,
    max_items: usize,
    attempts: u32,
}

impl HttpCollectionFetcher {
    pub fn new(http: reqwest::Client, cfg: &DiscoveryConfig) -> Self {
        Self {
            http,
            max_pages: cfg.fetch_max_pages.unwrap_or(100).max(1) as usize,
            max_items: cfg.fetch_max_items.unwrap_or(10_000).max(1) as usize,
            attempts: cfg.fetch_attempts.unwrap_or(3),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Vec<u8>> {
        let resp = send_with_retry(
            || {
                self.http
                    .get(url)
                    .header(ACCEPT, AP_ACCEPT)
                    .header(USER_AGENT, format!("fedi3/{}", env!("CARGO_PKG_VERSION")))
            },
            self.attempts,
        )
        .await
        .with_context(|| format!("fetch: {url}"))?
        .error_for_status()
        .with_context(|| format!("not ok: {url}"))?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn collect(&self, collection_url: &str) -> Result<CollectionItems> {
        let body = self.get_json(collection_url).await?;
        let col: OrderedCollection = serde_json::from_slice(&body)
            .with_context(|| format!("parse collection json: {collection_url}"))?;

        let mut out = Vec::new();
        let mut truncated = false;
        if let Some(items) = col.inline_items() {
            truncated |= push_entries(&mut out, items, self.max_items);
        }

        let mut next_page = match col.first {
            Some(PageRef::Link(url)) => Some(url),
            Some(PageRef::Page(page)) => {
                truncated |= push_entries(&mut out, page.page_items(), self.max_items);
                page.next
            }
            None => None,
        };

        let mut visited = HashSet::new();
        visited.insert(collection_url.to_string());
        let mut pages = 0usize;
        while let Some(page_url) = next_page.take() {
            // Some servers link a page back to itself or to the collection.
            if !visited.insert(page_url.clone()) {
                break;
            }
            if truncated || pages >= self.max_pages || out.len() >= self.max_items {
                debug!(collection_url, pages, items = out.len(), "collection truncated");
                truncated = true;
                break;
            }
            let body = self.get_json(&page_url).await?;
            let page: CollectionPage = serde_json::from_slice(&body)
                .with_context(|| format!("parse collection page json: {page_url}"))?;
            pages += 1;
            if page.page_items().is_empty() {
                break;
            }
            truncated |= push_entries(&mut out, page.page_items(), self.max_items);
            next_page = page.next;
        }
        Ok(CollectionItems {
            entries: out,
            truncated,
        })
    }
}

#[async_trait]
impl CollectionFetcher for HttpCollectionFetcher {
    async fn fetch_actor(&self, profile_url: &str) -> Option<RemoteActor> {
        let body = match self.get_json(profile_url).await {
            Ok(b) => b,
            Err(e) => {
                debug!("actor fetch failed: {e:#}");
                return None;
            }
        };
        match serde_json::from_slice::<RemoteActor>(&body) {
            Ok(actor) if actor.id.is_some() => Some(actor),
            Ok(_) => None,
            Err(e) => {
                debug!("parse actor json from {profile_url}: {e}");
                None
            }
        }
    }

    async fn fetch_items(&self, collection_url: &str) -> CollectionItems {
        match self.collect(collection_url).await {
            Ok(items) => items,
            Err(e) => {
                debug!("collection fetch failed: {e:#}");
                CollectionItems::default()
            }
        }
    }
}

/// Appends the decodable entries of `items`. Returns true when the item cap
/// left some of them out.
fn push_entries(out: &mut Vec<CollectionEntry>, items: &[Value], max_items: usize) -> bool {
    for item in items {
        let Some(entry) = CollectionEntry::from_value(item) else {
            continue;
        };
        if out.len() >= max_items {
            return true;
        }
        out.push(entry);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const A1: &str = "https://a.example/users/one";
    const A2: &str = "https://a.example/users/two";
    const A3: &str = "https://a.example/users/three";

    /// Minimal HTTP/1.1 server answering GETs from a path -> JSON map; 404 otherwise.
    struct Fixture {
        base: String,
        routes: Arc<Mutex<HashMap<String, String>>>,
    }

    impl Fixture {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let routes: Arc<Mutex<HashMap<String, String>>> = Arc::default();
            let served = routes.clone();
            tokio::spawn(async move {
                while let Ok((mut sock, _)) = listener.accept().await {
                    let routes = served.clone();
                    tokio::spawn(async move {
                        let mut req = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                            match sock.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => req.extend_from_slice(&buf[..n]),
                            }
                        }
                        let head = String::from_utf8_lossy(&req);
                        let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                        let body = routes.lock().unwrap().get(&path).cloned();
                        let resp = match body {
                            Some(body) => format!(
                                "HTTP/1.1 200 OK\r\ncontent-type: application/activity+json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                                body.len()
                            ),
                            None => "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string(),
                        };
                        let _ = sock.write_all(resp.as_bytes()).await;
                        let _ = sock.shutdown().await;
                    });
                }
            });
            Self { base, routes }
        }

        fn url(&self, path: &str) -> String {
            format!("{}{path}", self.base)
        }

        fn serve(&self, path: &str, body: Value) {
            self.routes.lock().unwrap().insert(path.to_string(), body.to_string());
        }

        /// `/followers` -> link to page 1 -> page 2 -> end.
        fn serve_two_pages(&self) {
            self.serve("/followers", json!({
                "type": "OrderedCollection",
                "totalItems": 3,
                "first": self.url("/followers?page=1"),
            }));
            self.serve("/followers?page=1", json!({
                "type": "OrderedCollectionPage",
                "orderedItems": [A1, {"type": "Person", "url": A2}],
                "next": self.url("/followers?page=2"),
            }));
            self.serve("/followers?page=2", json!({
                "type": "OrderedCollectionPage",
                "orderedItems": [A3],
            }));
        }
    }

    fn fetcher(max_pages: u32, max_items: u32) -> HttpCollectionFetcher {
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        HttpCollectionFetcher::new(http, &DiscoveryConfig {
            fetch_max_pages: Some(max_pages),
            fetch_max_items: Some(max_items),
            fetch_attempts: Some(1),
            ..DiscoveryConfig::default()
        })
    }

    fn urls(items: &CollectionItems) -> Vec<&str> {
        items.entries.iter().filter_map(|e| e.profile_url()).collect()
    }

    #[tokio::test]
    async fn follows_first_link_then_next() {
        let fx = Fixture::start().await;
        fx.serve_two_pages();

        let items = fetcher(100, 10_000).fetch_items(&fx.url("/followers")).await;
        assert_eq!(urls(&items), vec![A1, A2, A3]);
        assert!(!items.truncated);
    }

    #[tokio::test]
    async fn reads_inline_and_embedded_first_page() {
        let fx = Fixture::start().await;
        fx.serve("/inline", json!({"type": "OrderedCollection", "orderedItems": [A1, A2]}));
        fx.serve("/embedded", json!({
            "type": "OrderedCollection",
            "first": {"type": "OrderedCollectionPage", "items": [A1], "next": fx.url("/embedded/2")},
        }));
        fx.serve("/embedded/2", json!({"type": "OrderedCollectionPage", "items": [A2]}));

        let f = fetcher(100, 10_000);
        assert_eq!(urls(&f.fetch_items(&fx.url("/inline")).await), vec![A1, A2]);
        let embedded = f.fetch_items(&fx.url("/embedded")).await;
        assert_eq!(urls(&embedded), vec![A1, A2]);
        assert!(!embedded.truncated);
    }

    #[tokio::test]
    async fn stops_on_revisited_or_empty_page() {
        let fx = Fixture::start().await;
        fx.serve("/loop", json!({"first": fx.url("/loop/1")}));
        fx.serve("/loop/1", json!({"orderedItems": [A1], "next": fx.url("/loop/2")}));
        fx.serve("/loop/2", json!({"orderedItems": [A2], "next": fx.url("/loop/1")}));
        // /sparse/3 is never served: reaching it would fail the whole collection.
        fx.serve("/sparse", json!({"first": fx.url("/sparse/1")}));
        fx.serve("/sparse/1", json!({"orderedItems": [A1], "next": fx.url("/sparse/2")}));
        fx.serve("/sparse/2", json!({"orderedItems": [], "next": fx.url("/sparse/3")}));

        let f = fetcher(100, 10_000);
        let looped = f.fetch_items(&fx.url("/loop")).await;
        assert_eq!(urls(&looped), vec![A1, A2]);
        assert!(!looped.truncated);
        let sparse = f.fetch_items(&fx.url("/sparse")).await;
        assert_eq!(urls(&sparse), vec![A1]);
        assert!(!sparse.truncated);
    }

    #[tokio::test]
    async fn failed_page_empties_collection() {
        let fx = Fixture::start().await;
        fx.serve("/followers", json!({"first": fx.url("/followers/1")}));
        fx.serve("/followers/1", json!({"orderedItems": [A1], "next": fx.url("/followers/2")}));

        let f = fetcher(100, 10_000);
        assert_eq!(f.fetch_items(&fx.url("/followers")).await, CollectionItems::default());
        assert_eq!(f.fetch_items(&fx.url("/missing")).await, CollectionItems::default());
    }

    #[tokio::test]
    async fn page_and_item_caps_mark_truncation() {
        let fx = Fixture::start().await;
        fx.serve_two_pages();
        let url = fx.url("/followers");

        let by_pages = fetcher(1, 10_000).fetch_items(&url).await;
        assert_eq!(urls(&by_pages), vec![A1, A2]);
        assert!(by_pages.truncated);

        let by_items = fetcher(100, 1).fetch_items(&url).await;
        assert_eq!(urls(&by_items), vec![A1]);
        assert!(by_items.truncated);

        // Exactly filling the cap on the last page is still a complete read.
        let exact = fetcher(100, 3).fetch_items(&url).await;
        assert_eq!(urls(&exact), vec![A1, A2, A3]);
        assert!(!exact.truncated);
    }

    #[tokio::test]
    async fn actor_needs_an_id() {
        let fx = Fixture::start().await;
        fx.serve("/users/t", json!({
            "id": fx.url("/users/t"),
            "type": "Person",
            "followers": fx.url("/users/t/followers"),
        }));
        fx.serve("/users/anon", json!({"type": "Person"}));

        let f = fetcher(100, 10_000);
        let actor = f.fetch_actor(&fx.url("/users/t")).await.unwrap();
        assert_eq!(actor.followers, Some(fx.url("/users/t/followers")));
        assert_eq!(actor.following, None);
        assert!(f.fetch_actor(&fx.url("/users/anon")).await.is_none());
        assert!(f.fetch_actor(&fx.url("/users/gone")).await.is_none());
    }

    #[test]
    fn push_entries_skips_malformed_and_caps() {
        let items = vec![
            json!("https://a.example/users/alice"),
            json!(17),
            json!({"url": "https://b.example/@bob"}),
            json!({"name": "no url"}),
            json!("https://c.example/users/carol"),
        ];
        let mut out = Vec::new();
        assert!(!push_entries(&mut out, &items, 10));
        assert_eq!(out.len(), 3);

        let mut capped = Vec::new();
        assert!(push_entries(&mut capped, &items, 2));
        assert_eq!(
            capped.iter().filter_map(|e| e.profile_url()).collect::<Vec<_>>(),
            vec!["https://a.example/users/alice", "https://b.example/@bob"]
        );
    }

    #[test]
    fn limits_come_from_config() {
        let cfg = DiscoveryConfig {
            fetch_max_pages: Some(0),
            fetch_max_items: Some(5),
            ..DiscoveryConfig::default()
        };
        let f = HttpCollectionFetcher::new(reqwest::Client::new(), &cfg);
        assert_eq!(f.max_pages, 1);
        assert_eq!(f.max_items, 5);
        assert_eq!(f.attempts, 3);
    }
}

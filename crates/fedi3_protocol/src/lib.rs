/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One item of a remote `followers`/`following` collection.
///
/// Servers either list bare actor URLs or embed (part of) the actor object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectionEntry {
    UrlOnly(String),
    EmbeddedActor(EmbeddedActor),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedActor {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl CollectionEntry {
    /// Decodes a raw collection item. Anything that is neither a string nor an
    /// object with a string `url` is dropped.
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) => Some(Self::UrlOnly(s.clone())),
            Value::Object(map) => {
                let url = map.get("url").and_then(|u| u.as_str())?;
                Some(Self::EmbeddedActor(EmbeddedActor {
                    url: url.to_string(),
                    id: map.get("id").and_then(|i| i.as_str()).map(str::to_string),
                    kind: map.get("type").and_then(|t| t.as_str()).map(str::to_string),
                }))
            }
            _ => None,
        }
    }

    pub fn profile_url(&self) -> Option<&str> {
        let url = match self {
            Self::UrlOnly(url) => url,
            Self::EmbeddedActor(actor) => &actor.url,
        };
        let url = url.trim();
        if url.is_empty() {
            None
        } else {
            Some(url)
        }
    }
}

/// The subset of an actor document needed to discover its relations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteActor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub followers: Option<String>,
    #[serde(default)]
    pub following: Option<String>,
}

/// `first` may be a link to the first page or the page itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PageRef {
    Link(String),
    Page(Box<CollectionPage>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderedCollection {
    #[serde(default, rename = "totalItems")]
    pub total_items: Option<u64>,
    #[serde(default)]
    pub first: Option<PageRef>,
    #[serde(default, rename = "orderedItems")]
    pub ordered_items: Option<Vec<Value>>,
    #[serde(default)]
    pub items: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionPage {
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default, rename = "orderedItems")]
    pub ordered_items: Option<Vec<Value>>,
    #[serde(default)]
    pub items: Option<Vec<Value>>,
}

impl OrderedCollection {
    pub fn inline_items(&self) -> Option<&[Value]> {
        self.ordered_items.as_deref().or(self.items.as_deref())
    }
}

impl CollectionPage {
    pub fn page_items(&self) -> &[Value] {
        self.ordered_items
            .as_deref()
            .or(self.items.as_deref())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_string_and_object_entries() {
        let bare = CollectionEntry::from_value(&json!("https://a.example/users/alice")).unwrap();
        assert_eq!(bare.profile_url(), Some("https://a.example/users/alice"));

        let embedded = CollectionEntry::from_value(&json!({
            "id": "https://b.example/users/bob",
            "type": "Person",
            "url": "https://b.example/@bob"
        }))
        .unwrap();
        assert_eq!(embedded.profile_url(), Some("https://b.example/@bob"));
        match embedded {
            CollectionEntry::EmbeddedActor(actor) => {
                assert_eq!(actor.kind.as_deref(), Some("Person"));
                assert_eq!(actor.id.as_deref(), Some("https://b.example/users/bob"));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn drops_malformed_entries() {
        assert!(CollectionEntry::from_value(&json!(42)).is_none());
        assert!(CollectionEntry::from_value(&json!(null)).is_none());
        assert!(CollectionEntry::from_value(&json!({"id": "https://c.example/u"})).is_none());
        assert!(CollectionEntry::from_value(&json!({"url": ["x"]})).is_none());
        assert_eq!(CollectionEntry::UrlOnly("   ".into()).profile_url(), None);
    }

    #[test]
    fn first_page_may_be_embedded() {
        let linked: OrderedCollection = serde_json::from_value(json!({
            "type": "OrderedCollection",
            "totalItems": 3,
            "first": "https://a.example/users/alice/followers?page=1"
        }))
        .unwrap();
        assert!(matches!(linked.first, Some(PageRef::Link(_))));
        assert_eq!(linked.total_items, Some(3));

        let embedded: OrderedCollection = serde_json::from_value(json!({
            "type": "OrderedCollection",
            "first": {
                "type": "OrderedCollectionPage",
                "orderedItems": ["https://b.example/u/1"],
                "next": "https://a.example/users/alice/followers?page=2"
            }
        }))
        .unwrap();
        match embedded.first {
            Some(PageRef::Page(page)) => {
                assert_eq!(page.page_items().len(), 1);
                assert!(page.next.is_some());
            }
            other => panic!("unexpected first {other:?}"),
        }
    }

    #[test]
    fn actor_document_ignores_unknown_fields() {
        let actor: RemoteActor = serde_json::from_value(json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://a.example/users/alice",
            "type": "Person",
            "inbox": "https://a.example/users/alice/inbox",
            "followers": "https://a.example/users/alice/followers",
            "following": "https://a.example/users/alice/following"
        }))
        .unwrap();
        assert_eq!(actor.kind.as_deref(), Some("Person"));
        assert_eq!(
            actor.followers.as_deref(),
            Some("https://a.example/users/alice/followers")
        );
    }
}

/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directed follow/interaction edges plus the contact rows they point at.
///
/// Every method is a single statement against the database, so a failure never
/// leaves an edge half-written.
pub trait RelationStore: Send + Sync {
    /// Stamps `last_interaction_ms` on the edge `(subject, actor)`. Self pairs are ignored.
    fn record_interaction(&self, subject_id: i64, actor_id: i64, ts_ms: i64) -> Result<()>;

    /// Overwrites the follow flag of the edge `(subject, object)`. Self pairs are ignored.
    fn set_follow_state(&self, subject_id: i64, object_id: i64, follows: bool, ts_ms: i64) -> Result<()>;

    /// Resets `follows` on every edge whose subject is `contact_id`.
    fn clear_follow_flags(&self, contact_id: i64) -> Result<u64>;

    /// Deletes unconfirmed edges of `contact_id` that never carried an interaction.
    fn prune_stale_followers(&self, contact_id: i64) -> Result<u64>;

    fn contact_by_url(&self, url: &str) -> Result<Option<Contact>>;

    /// True when a local user keeps a contact row for this normalized URL.
    fn has_local_contact(&self, nurl: &str) -> Result<bool>;

    /// True when some edge has `contact_id` as object and a recorded interaction.
    fn has_recorded_interaction(&self, contact_id: i64) -> Result<bool>;

    fn mark_discovered(&self, contact_id: i64, ts_ms: i64) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: i64,
    pub url: String,
    pub nurl: String,
    pub network: String,
    pub created_ms: i64,
    pub last_discovery_ms: Option<i64>,
    pub local: bool,
}

#[derive(Debug, Clone)]
pub struct NewContact {
    pub url: String,
    pub network: String,
    pub created_ms: i64,
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationEdge {
    pub subject_id: i64,
    pub object_id: i64,
    pub follows: bool,
    pub follow_updated_ms: Option<i64>,
    pub last_interaction_ms: Option<i64>,
}

pub struct DiscoveryJob {
    pub url: String,
    pub attempt: u32,
}

#[derive(Clone)]
pub struct RelationDb {
    path: PathBuf,
}

impl RelationDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS contacts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              url TEXT NOT NULL,
              nurl TEXT NOT NULL,
              network TEXT NOT NULL DEFAULT '',
              created_at_ms INTEGER NOT NULL,
              last_discovery_ms INTEGER NULL,
              local INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_nurl ON contacts(nurl, local);

            -- One row per ordered pair. follows=1: object_id follows subject_id.
            CREATE TABLE IF NOT EXISTS contact_relations (
              subject_id INTEGER NOT NULL,
              object_id INTEGER NOT NULL,
              follows INTEGER NOT NULL DEFAULT 0,
              follow_updated_ms INTEGER NULL,
              last_interaction_ms INTEGER NULL,
              PRIMARY KEY(subject_id, object_id)
            );
            CREATE INDEX IF NOT EXISTS idx_relations_object ON contact_relations(object_id);

            -- status: 0=pending, 1=done, 2=dead
            CREATE TABLE IF NOT EXISTS discovery_jobs (
              url TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              next_attempt_at_ms INTEGER NOT NULL,
              attempt INTEGER NOT NULL,
              status INTEGER NOT NULL,
              last_error TEXT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_discovery_due ON discovery_jobs(status, next_attempt_at_ms);
            "#,
        )?;
        Ok(Self { path })
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn insert_contact(&self, contact: &NewContact) -> Result<i64> {
        let url = contact.url.trim();
        let nurl = normalise_link(url);
        anyhow::ensure!(!nurl.is_empty(), "contact url is empty");
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT INTO contacts(url, nurl, network, created_at_ms, last_discovery_ms, local)
            VALUES (?1, ?2, ?3, ?4, NULL, ?5)
            "#,
            params![url, nurl, contact.network, contact.created_ms, if contact.local { 1 } else { 0 }],
        )
        .with_context(|| format!("insert contact: {url}"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Returns the cached contact id for `url`, creating a minimal remote record when unseen.
    pub fn contact_id_for_url(&self, url: &str) -> Result<Option<i64>> {
        let url = url.trim();
        let nurl = normalise_link(url);
        if nurl.is_empty() {
            return Ok(None);
        }
        let mut conn = Connection::open(&self.path)?;
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM contacts WHERE nurl=?1 ORDER BY local ASC, id ASC LIMIT 1",
                params![nurl],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(Some(id));
        }
        tx.execute(
            r#"
            INSERT INTO contacts(url, nurl, network, created_at_ms, last_discovery_ms, local)
            VALUES (?1, ?2, '', ?3, NULL, 0)
            "#,
            params![url, nurl, now_ms()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(id))
    }

    pub fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        let conn = Connection::open(&self.path)?;
        conn.query_row(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id=?1"),
            params![id],
            map_contact,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_relation(&self, subject_id: i64, object_id: i64) -> Result<Option<RelationEdge>> {
        let conn = Connection::open(&self.path)?;
        conn.query_row(
            &format!("SELECT {RELATION_COLUMNS} FROM contact_relations WHERE subject_id=?1 AND object_id=?2"),
            params![subject_id, object_id],
            map_relation,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_relations_from(&self, subject_id: i64) -> Result<Vec<RelationEdge>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RELATION_COLUMNS} FROM contact_relations WHERE subject_id=?1 ORDER BY object_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![subject_id], map_relation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_relations(&self) -> Result<Vec<RelationEdge>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RELATION_COLUMNS} FROM contact_relations ORDER BY subject_id ASC, object_id ASC"
        ))?;
        let rows = stmt
            .query_map([], map_relation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_relations(&self) -> Result<u64> {
        let conn = Connection::open(&self.path)?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM contact_relations", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Queues `url` for discovery. A pending job keeps its earlier due time.
    pub fn enqueue_discovery(&self, url: &str, due_at_ms: i64) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Ok(());
        }
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT INTO discovery_jobs(url, created_at_ms, next_attempt_at_ms, attempt, status, last_error)
            VALUES (?1, ?2, ?3, 0, 0, NULL)
            ON CONFLICT(url) DO UPDATE SET
              next_attempt_at_ms=(CASE WHEN discovery_jobs.status=0 AND discovery_jobs.next_attempt_at_ms < excluded.next_attempt_at_ms
                                       THEN discovery_jobs.next_attempt_at_ms ELSE excluded.next_attempt_at_ms END),
              attempt=(CASE WHEN discovery_jobs.status=0 THEN discovery_jobs.attempt ELSE 0 END),
              status=0
            "#,
            params![url, now_ms(), due_at_ms],
        )?;
        Ok(())
    }

    pub fn fetch_due_discovery_jobs(&self, now_ms: i64, limit: u32) -> Result<Vec<DiscoveryJob>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT url, attempt
            FROM discovery_jobs
            WHERE status=0 AND next_attempt_at_ms <= ?1
            ORDER BY next_attempt_at_ms ASC
            LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![now_ms, limit.max(1)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DiscoveryJob {
                url: row.get(0)?,
                attempt: row.get(1)?,
            });
        }
        Ok(out)
    }

    pub fn finish_discovery_job(&self, url: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE discovery_jobs SET status=1, last_error=NULL WHERE url=?1",
            params![url],
        )?;
        Ok(())
    }

    pub fn retry_discovery_job(&self, url: &str, attempt: u32, next_attempt_at_ms: i64, err: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE discovery_jobs SET attempt=?2, next_attempt_at_ms=?3, last_error=?4 WHERE url=?1",
            params![url, attempt, next_attempt_at_ms, err],
        )?;
        Ok(())
    }

    pub fn mark_discovery_job_dead(&self, url: &str, err: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE discovery_jobs SET status=2, last_error=?2 WHERE url=?1",
            params![url, err],
        )?;
        Ok(())
    }

    pub fn discovery_job_status(&self, url: &str) -> Result<Option<(u32, u32, Option<String>)>> {
        let conn = Connection::open(&self.path)?;
        conn.query_row(
            "SELECT status, attempt, last_error FROM discovery_jobs WHERE url=?1",
            params![url.trim()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(Into::into)
    }
}

impl RelationStore for RelationDb {
    fn record_interaction(&self, subject_id: i64, actor_id: i64, ts_ms: i64) -> Result<()> {
        if subject_id == actor_id {
            return Ok(());
        }
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT INTO contact_relations(subject_id, object_id, follows, follow_updated_ms, last_interaction_ms)
            VALUES (?1, ?2, 0, NULL, ?3)
            ON CONFLICT(subject_id, object_id) DO UPDATE SET
              last_interaction_ms=excluded.last_interaction_ms
            "#,
            params![subject_id, actor_id, ts_ms],
        )
        .with_context(|| format!("record interaction {subject_id} <- {actor_id}"))?;
        Ok(())
    }

    fn set_follow_state(&self, subject_id: i64, object_id: i64, follows: bool, ts_ms: i64) -> Result<()> {
        if subject_id == object_id {
            return Ok(());
        }
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT INTO contact_relations(subject_id, object_id, follows, follow_updated_ms, last_interaction_ms)
            VALUES (?1, ?2, ?3, ?4, NULL)
            ON CONFLICT(subject_id, object_id) DO UPDATE SET
              follows=excluded.follows,
              follow_updated_ms=excluded.follow_updated_ms
            "#,
            params![subject_id, object_id, if follows { 1 } else { 0 }, ts_ms],
        )
        .with_context(|| format!("set follow state {subject_id} -> {object_id}"))?;
        Ok(())
    }

    fn clear_follow_flags(&self, contact_id: i64) -> Result<u64> {
        let conn = Connection::open(&self.path)?;
        let n = conn
            .execute(
                "UPDATE contact_relations SET follows=0 WHERE subject_id=?1 AND follows<>0",
                params![contact_id],
            )
            .with_context(|| format!("clear follow flags of {contact_id}"))?;
        Ok(n as u64)
    }

    fn prune_stale_followers(&self, contact_id: i64) -> Result<u64> {
        let conn = Connection::open(&self.path)?;
        let n = conn
            .execute(
                "DELETE FROM contact_relations WHERE subject_id=?1 AND follows=0 AND last_interaction_ms IS NULL",
                params![contact_id],
            )
            .with_context(|| format!("prune stale followers of {contact_id}"))?;
        Ok(n as u64)
    }

    fn contact_by_url(&self, url: &str) -> Result<Option<Contact>> {
        let nurl = normalise_link(url);
        if nurl.is_empty() {
            return Ok(None);
        }
        let conn = Connection::open(&self.path)?;
        conn.query_row(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE nurl=?1 ORDER BY local ASC, id ASC LIMIT 1"),
            params![nurl],
            map_contact,
        )
        .optional()
        .map_err(Into::into)
    }

    fn has_local_contact(&self, nurl: &str) -> Result<bool> {
        let conn = Connection::open(&self.path)?;
        let v: Option<i64> = conn
            .query_row(
                "SELECT id FROM contacts WHERE nurl=?1 AND local=1 LIMIT 1",
                params![nurl],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v.is_some())
    }

    fn has_recorded_interaction(&self, contact_id: i64) -> Result<bool> {
        let conn = Connection::open(&self.path)?;
        let v: Option<i64> = conn
            .query_row(
                "SELECT subject_id FROM contact_relations WHERE object_id=?1 AND last_interaction_ms IS NOT NULL LIMIT 1",
                params![contact_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v.is_some())
    }

    fn mark_discovered(&self, contact_id: i64, ts_ms: i64) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE contacts SET last_discovery_ms=?2 WHERE id=?1",
            params![contact_id, ts_ms],
        )
        .with_context(|| format!("stamp last discovery of {contact_id}"))?;
        Ok(())
    }
}

/// Comparison form of a profile URL: scheme folded to `http`, no trailing slash.
pub fn normalise_link(url: &str) -> String {
    let url = url.trim();
    let url = match url.strip_prefix("https://") {
        Some(rest) => format!("http://{rest}"),
        None => url.to_string(),
    };
    url.trim_end_matches('/').to_string()
}

const CONTACT_COLUMNS: &str = "id, url, nurl, network, created_at_ms, last_discovery_ms, local";
const RELATION_COLUMNS: &str = "subject_id, object_id, follows, follow_updated_ms, last_interaction_ms";

fn map_contact(r: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let local: i64 = r.get(6)?;
    Ok(Contact {
        id: r.get(0)?,
        url: r.get(1)?,
        nurl: r.get(2)?,
        network: r.get(3)?,
        created_ms: r.get(4)?,
        last_discovery_ms: r.get(5)?,
        local: local != 0,
    })
}

fn map_relation(r: &rusqlite::Row<'_>) -> rusqlite::Result<RelationEdge> {
    let follows: i64 = r.get(2)?;
    Ok(RelationEdge {
        subject_id: r.get(0)?,
        object_id: r.get(1)?,
        follows: follows != 0,
        follow_updated_ms: r.get(3)?,
        last_interaction_ms: r.get(4)?,
    })
}

/// Runs a synchronous store call on the blocking pool.
pub(crate) async fn blocking<S, T, F>(store: &Arc<S>, f: F) -> Result<T>
where
    S: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref())).await?
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

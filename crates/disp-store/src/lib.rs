//! Persistent state for the dispatcher: queues, queue_items, events,
//! node_status, pills. Every primitive here either commits in full or rolls
//! back; nothing in this crate leaves the tables half written.
//!
//! The pool is opened with a single connection (`max_connections(1)`). SQLite
//! only ever has one writer regardless of pool size, but pinning the pool to
//! one connection makes every transaction below fully serialized against
//! every other one for free — there is no separate "immediate lock" API to
//! reach for, the connection itself is the lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::warn;

use disp_schemas::{
    event_kind, NewQueueItem, NodeStatus, PillType, Queue, QueueItem, QueueStatus, QueueWithItems,
};

pub struct Store {
    pool: SqlitePool,
}

/// Outcome of `Store::record_completion`. The verification/join decision is
/// made and applied inside the same transaction that recorded the event, so
/// by the time this is returned the database already reflects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// An `evt_done_node{n}` row already existed for this queue; nothing was
    /// written (I3).
    Duplicate,
    /// The event was recorded. `finalized` is set when this call also
    /// terminated the queue (either via verification shortfall or because
    /// both nodes' events were present).
    Recorded { finalized: Option<Finalized> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub status: QueueStatus,
    pub reason: Option<String>,
}

impl Store {
    pub async fn connect(sqlite_path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{sqlite_path}"))
            .with_context(|| format!("parsing sqlite path {sqlite_path:?}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .with_context(|| format!("opening sqlite database at {sqlite_path:?}"))?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Used by tests and by `disp-cli` when pointed at `:memory:` /
    /// a tempfile-backed path; goes through the same migration path as
    /// production so schema drift can't hide in a shortcut.
    pub async fn connect_pool(pool: SqlitePool) -> Result<Self> {
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running embedded schema migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- queue creation (external-collaborator / disp-cli entry point) ----

    /// Inserts a queue plus its items, normalizing liquid-pill quantity to 1
    /// and decrementing `pills.amount` (floored at zero), exactly as the
    /// historical HTTP collaborator does. Rejects an empty item list.
    pub async fn create_queue(
        &self,
        patient_id: i64,
        target_room: i64,
        queue_number: i64,
        items: &[NewQueueItem],
    ) -> Result<i64> {
        if items.is_empty() {
            anyhow::bail!("a queue with no items is invalid");
        }
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let queue_id: i64 = sqlx::query(
            "INSERT INTO queues (patient_id, target_room, status, queue_number, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(patient_id)
        .bind(target_room)
        .bind(QueueStatus::Pending.as_str())
        .bind(queue_number)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for item in items {
            let pill_type: Option<String> = sqlx::query("SELECT type FROM pills WHERE id = ?")
                .bind(item.pill_id)
                .fetch_optional(&mut *tx)
                .await?
                .map(|r| r.get::<String, _>(0));

            let is_liquid = pill_type.as_deref() == Some("liquid");
            let effective_qty = if is_liquid { 1 } else { item.quantity };
            if effective_qty <= 0 {
                anyhow::bail!("queue item quantity must be > 0 (pill_id={})", item.pill_id);
            }

            sqlx::query(
                "INSERT INTO queue_items (queue_id, pill_id, quantity) VALUES (?, ?, ?)",
            )
            .bind(queue_id)
            .bind(item.pill_id)
            .bind(effective_qty)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE pills SET amount = MAX(0, amount - ?) WHERE id = ?")
                .bind(effective_qty)
                .bind(item.pill_id)
                .execute(&mut *tx)
                .await?;
        }

        let message = serde_json::json!({ "patient_id": patient_id, "target_room": target_room })
            .to_string();
        sqlx::query(
            "INSERT INTO events (queue_id, timestamp, event_kind, message) VALUES (?, ?, ?, ?)",
        )
        .bind(queue_id)
        .bind(now.to_rfc3339())
        .bind(event_kind::CREATED)
        .bind(message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(queue_id)
    }

    pub async fn insert_pill(&self, name: &str, kind: PillType, amount: i64) -> Result<i64> {
        let kind_str = match kind {
            PillType::Solid => "solid",
            PillType::Liquid => "liquid",
        };
        let id = sqlx::query("INSERT INTO pills (name, type, amount) VALUES (?, ?, ?)")
            .bind(name)
            .bind(kind_str)
            .bind(amount)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(id)
    }

    // ---- dispatch primitives ----

    /// `UPDATE queues SET status='in_progress' WHERE id=? AND status='pending'
    /// AND NOT EXISTS(SELECT 1 FROM queues WHERE status='in_progress')`.
    /// Returns true on exactly one caller for a given id; false otherwise.
    pub async fn claim_pending(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queues SET status = 'in_progress' \
             WHERE id = ? AND status = 'pending' \
             AND NOT EXISTS (SELECT 1 FROM queues WHERE status = 'in_progress')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn next_pending(&self) -> Result<Option<QueueWithItems>> {
        let row = sqlx::query(
            "SELECT id, patient_id, target_room, status, queue_number, created_at, \
             served_at, note, failed_reason FROM queues \
             WHERE status = 'pending' ORDER BY id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let queue = queue_from_row(&row)?;
        let items = self.queue_items(queue.id).await?;
        Ok(Some(QueueWithItems { queue, items }))
    }

    pub async fn list_in_progress(&self) -> Result<Vec<Queue>> {
        let rows = sqlx::query(
            "SELECT id, patient_id, target_room, status, queue_number, created_at, \
             served_at, note, failed_reason FROM queues \
             WHERE status = 'in_progress' ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(queue_from_row).collect()
    }

    pub async fn get_queue(&self, queue_id: i64) -> Result<Option<Queue>> {
        let row = sqlx::query(
            "SELECT id, patient_id, target_room, status, queue_number, created_at, \
             served_at, note, failed_reason FROM queues WHERE id = ?",
        )
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(queue_from_row).transpose()
    }

    pub async fn queue_items(&self, queue_id: i64) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query("SELECT queue_id, pill_id, quantity FROM queue_items WHERE queue_id = ?")
            .bind(queue_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| QueueItem {
                queue_id: r.get(0),
                pill_id: r.get(1),
                quantity: r.get(2),
            })
            .collect())
    }

    /// `SUM(queue_items.quantity)` for the given queue; 0 if the queue has no
    /// rows (should not happen for a real queue, since creation rejects
    /// empty item lists, but a manually-deleted queue can still have orphan
    /// completion events referencing it).
    pub async fn read_expected(&self, queue_id: i64) -> Result<i64> {
        let total: Option<i64> =
            sqlx::query("SELECT SUM(quantity) FROM queue_items WHERE queue_id = ?")
                .bind(queue_id)
                .fetch_one(&self.pool)
                .await?
                .get(0);
        Ok(total.unwrap_or(0))
    }

    pub async fn finalize_queue(
        &self,
        queue_id: i64,
        outcome: QueueStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let served_at = if outcome == QueueStatus::Success {
            Some(now.to_rfc3339())
        } else {
            None
        };
        sqlx::query(
            "UPDATE queues SET status = ?, served_at = COALESCE(?, served_at), failed_reason = ? \
             WHERE id = ?",
        )
        .bind(outcome.as_str())
        .bind(served_at)
        .bind(reason)
        .bind(queue_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- events ----

    pub async fn insert_event(&self, queue_id: Option<i64>, kind: &str, message: &str) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO events (queue_id, timestamp, event_kind, message) VALUES (?, ?, ?, ?)",
        )
        .bind(queue_id)
        .bind(Utc::now().to_rfc3339())
        .bind(kind)
        .bind(message)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn count_events(&self, queue_id: i64, kind: &str) -> Result<i64> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) FROM events WHERE queue_id = ? AND event_kind = ?",
        )
        .bind(queue_id)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?
        .get(0);
        Ok(count)
    }

    pub async fn list_events(&self, queue_id: i64) -> Result<Vec<disp_schemas::Event>> {
        let rows = sqlx::query(
            "SELECT id, queue_id, timestamp, event_kind, message FROM events \
             WHERE queue_id = ? ORDER BY id ASC",
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    // ---- node status / readiness ----

    pub async fn get_node_status(&self, node_id: i64) -> Result<Option<NodeStatus>> {
        let row = sqlx::query(
            "SELECT node_id, online, ready, uptime, last_seen, last_ready_change, \
             last_online_change FROM node_status WHERE node_id = ?",
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(node_status_from_row).transpose()
    }

    /// Alias kept to mirror the naming in the component design (`PeekReady`):
    /// a plain read of the current row, no side effects.
    pub async fn peek_ready(&self, node_id: i64) -> Result<Option<NodeStatus>> {
        self.get_node_status(node_id).await
    }

    /// Upserts node state, touching `last_seen` unconditionally and
    /// `last_ready_change` / `last_online_change` only when the
    /// corresponding value actually flips.
    pub async fn upsert_node_status(
        &self,
        node_id: i64,
        online: bool,
        ready: bool,
        uptime: Option<i64>,
    ) -> Result<NodeStatus> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let existing = sqlx::query(
            "SELECT node_id, online, ready, uptime, last_seen, last_ready_change, \
             last_online_change FROM node_status WHERE node_id = ?",
        )
        .bind(node_id)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(node_status_from_row)
        .transpose()?;

        let (ready_changed_at, online_changed_at) = match &existing {
            None => (now, now),
            Some(prev) => (
                if prev.ready != ready { now } else { prev.last_ready_change },
                if prev.online != online { now } else { prev.last_online_change },
            ),
        };

        sqlx::query(
            "INSERT INTO node_status (node_id, online, ready, uptime, last_seen, \
             last_ready_change, last_online_change) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (node_id) DO UPDATE SET \
             online = excluded.online, ready = excluded.ready, uptime = excluded.uptime, \
             last_seen = excluded.last_seen, last_ready_change = excluded.last_ready_change, \
             last_online_change = excluded.last_online_change",
        )
        .bind(node_id)
        .bind(online)
        .bind(ready)
        .bind(uptime)
        .bind(now.to_rfc3339())
        .bind(ready_changed_at.to_rfc3339())
        .bind(online_changed_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(NodeStatus {
            node_id,
            online,
            ready,
            uptime,
            last_seen: now,
            last_ready_change: ready_changed_at,
            last_online_change: online_changed_at,
        })
    }

    // ---- completion joiner ----

    /// Implements the full completion-joiner algorithm (dedup, record,
    /// optional verification, join) as a single transaction so the second
    /// node to arrive always observes the first node's event.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_completion(
        &self,
        queue_id: i64,
        node_id: i64,
        raw_payload: &str,
        reported_status: Option<&str>,
        detected: Option<i64>,
    ) -> Result<JoinOutcome> {
        let mut tx = self.pool.begin().await?;
        let kind = event_kind::evt_done_node(node_id);

        let already: i64 = sqlx::query(
            "SELECT COUNT(*) FROM events WHERE queue_id = ? AND event_kind = ?",
        )
        .bind(queue_id)
        .bind(&kind)
        .fetch_one(&mut *tx)
        .await?
        .get(0);
        if already > 0 {
            tx.rollback().await?;
            warn!(queue_id, node_id, event_kind = %kind, "duplicate completion event dropped (I3)");
            return Ok(JoinOutcome::Duplicate);
        }

        // Verification and the join decision may only drive a transition out
        // of `in_progress`. A queue that is already terminal (I2) or that was
        // never dispatched (still `pending` — e.g. a completion racing ahead
        // of dispatch, or arriving for a manually-deleted/unknown queue) still
        // gets this node's event recorded for the audit trail, but must not
        // be transitioned: see spec §4.5's "completion arriving before any
        // dispatch" edge case.
        let current_status: Option<String> = sqlx::query("SELECT status FROM queues WHERE id = ?")
            .bind(queue_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.get(0));
        let current_status = current_status.and_then(|s| QueueStatus::parse(&s));
        let may_transition = current_status == Some(QueueStatus::InProgress);

        let now = Utc::now();
        let mut message = raw_payload.to_string();

        sqlx::query(
            "INSERT INTO events (queue_id, timestamp, event_kind, message) VALUES (?, ?, ?, ?)",
        )
        .bind(queue_id)
        .bind(now.to_rfc3339())
        .bind(&kind)
        .bind(&message)
        .execute(&mut *tx)
        .await?;

        if !may_transition {
            tx.commit().await?;
            return Ok(JoinOutcome::Recorded { finalized: None });
        }

        if let Some(detected) = detected {
            let expected: Option<i64> =
                sqlx::query("SELECT SUM(quantity) FROM queue_items WHERE queue_id = ?")
                    .bind(queue_id)
                    .fetch_one(&mut *tx)
                    .await?
                    .get(0);
            let expected = expected.unwrap_or(0);

            if detected < expected {
                message = serde_json::json!({
                    "status": "failed",
                    "verification": { "expected": expected, "detected": detected },
                })
                .to_string();
                sqlx::query(
                    "UPDATE events SET message = ? WHERE queue_id = ? AND event_kind = ?",
                )
                .bind(&message)
                .bind(queue_id)
                .bind(&kind)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "INSERT INTO events (queue_id, timestamp, event_kind, message) VALUES (?, ?, ?, ?)",
                )
                .bind(queue_id)
                .bind(now.to_rfc3339())
                .bind(event_kind::NODE_VERIFICATION_FAILED)
                .bind(&message)
                .execute(&mut *tx)
                .await?;

                let reason = format!(
                    "verification_failed_node{node_id}:detected={detected}:expected={expected}"
                );
                sqlx::query(
                    "UPDATE queues SET status = 'failed', failed_reason = ? WHERE id = ?",
                )
                .bind(&reason)
                .bind(queue_id)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                return Ok(JoinOutcome::Recorded {
                    finalized: Some(Finalized {
                        status: QueueStatus::Failed,
                        reason: Some(reason),
                    }),
                });
            }

            sqlx::query(
                "INSERT INTO events (queue_id, timestamp, event_kind, message) VALUES (?, ?, ?, ?)",
            )
            .bind(queue_id)
            .bind(now.to_rfc3339())
            .bind(event_kind::NODE_VERIFICATION_PASS)
            .bind(
                serde_json::json!({ "expected": expected, "detected": detected }).to_string(),
            )
            .execute(&mut *tx)
            .await?;
        }

        let companion_node = if node_id == 1 { 2 } else { 1 };
        let companion_kind = event_kind::evt_done_node(companion_node);
        let companion_message: Option<String> = sqlx::query(
            "SELECT message FROM events WHERE queue_id = ? AND event_kind = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(queue_id)
        .bind(&companion_kind)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| r.get(0));

        let Some(companion_message) = companion_message else {
            tx.commit().await?;
            return Ok(JoinOutcome::Recorded { finalized: None });
        };

        let self_status = parsed_status_or_success(reported_status);
        let companion_status = parsed_status_from_message(&companion_message);

        let (final_status, reason) = if is_success_status(&self_status) && is_success_status(&companion_status) {
            (QueueStatus::Success, None)
        } else {
            let (s1, s2) = if node_id == 1 {
                (self_status.clone(), companion_status.clone())
            } else {
                (companion_status.clone(), self_status.clone())
            };
            (
                QueueStatus::Failed,
                Some(format!("node1:{s1}, node2:{s2}")),
            )
        };

        if final_status == QueueStatus::Failed {
            sqlx::query(
                "INSERT INTO events (queue_id, timestamp, event_kind, message) VALUES (?, ?, ?, ?)",
            )
            .bind(queue_id)
            .bind(now.to_rfc3339())
            .bind(event_kind::QUEUE_FAILED)
            .bind(reason.clone().unwrap_or_default())
            .execute(&mut *tx)
            .await?;
        }

        let served_at = if final_status == QueueStatus::Success {
            Some(now.to_rfc3339())
        } else {
            None
        };
        sqlx::query(
            "UPDATE queues SET status = ?, served_at = COALESCE(?, served_at), failed_reason = ? \
             WHERE id = ?",
        )
        .bind(final_status.as_str())
        .bind(served_at)
        .bind(reason.as_deref())
        .bind(queue_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(JoinOutcome::Recorded {
            finalized: Some(Finalized {
                status: final_status,
                reason,
            }),
        })
    }

    /// Standalone `disp/vision/*` report: looks up the current in-progress
    /// queue when `queue_id` is absent, writes a `vision_check` event and a
    /// human-readable `queues.note`. Never changes `queues.status` on its
    /// own.
    pub async fn record_vision_report(&self, queue_id: Option<i64>, count_detected: i64) -> Result<()> {
        let queue_id = match queue_id {
            Some(id) => Some(id),
            None => self
                .list_in_progress()
                .await?
                .into_iter()
                .map(|q| q.id)
                .next(),
        };
        let Some(queue_id) = queue_id else {
            return Ok(());
        };

        let expected = self.read_expected(queue_id).await?;
        let note = format!("vision: detected={count_detected} expected={expected}");
        self.insert_event(
            Some(queue_id),
            event_kind::VISION_CHECK,
            &serde_json::json!({ "detected": count_detected, "expected": expected }).to_string(),
        )
        .await?;
        sqlx::query("UPDATE queues SET note = ? WHERE id = ?")
            .bind(&note)
            .bind(queue_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parsed_status_or_success(reported: Option<&str>) -> String {
    reported.unwrap_or("success").to_string()
}

/// §9(c): "treat any non-`success`/`ok` as failure" — `ok` is as much an
/// accept path as `success` for the join decision. The reason string still
/// carries whatever the node actually reported, so `node1:ok, node2:timeout`
/// stays legible even though `ok` counted as a pass here.
fn is_success_status(status: &str) -> bool {
    status == "success" || status == "ok"
}

fn parsed_status_from_message(message: &str) -> String {
    serde_json::from_str::<serde_json::Value>(message)
        .ok()
        .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_string))
        .unwrap_or_else(|| "success".to_string())
}

fn queue_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Queue> {
    let status_str: String = row.get(3);
    let status = QueueStatus::parse(&status_str)
        .with_context(|| format!("unrecognized queue status in database: {status_str:?}"))?;
    let created_at: String = row.get(5);
    let served_at: Option<String> = row.get(6);
    Ok(Queue {
        id: row.get(0),
        patient_id: row.get(1),
        target_room: row.get(2),
        status,
        queue_number: row.get(4),
        created_at: parse_rfc3339(&created_at)?,
        served_at: served_at.map(|s| parse_rfc3339(&s)).transpose()?,
        note: row.get(7),
        failed_reason: row.get(8),
    })
}

fn node_status_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<NodeStatus> {
    let last_seen: String = row.get(4);
    let last_ready_change: String = row.get(5);
    let last_online_change: String = row.get(6);
    Ok(NodeStatus {
        node_id: row.get(0),
        online: row.get::<i64, _>(1) != 0,
        ready: row.get::<i64, _>(2) != 0,
        uptime: row.get(3),
        last_seen: parse_rfc3339(&last_seen)?,
        last_ready_change: parse_rfc3339(&last_ready_change)?,
        last_online_change: parse_rfc3339(&last_online_change)?,
    })
}

fn event_from_row(row: sqlx::sqlite::SqliteRow) -> Result<disp_schemas::Event> {
    let timestamp: String = row.get(2);
    Ok(disp_schemas::Event {
        id: row.get(0),
        queue_id: row.get(1),
        timestamp: parse_rfc3339(&timestamp)?,
        event_kind: row.get(3),
        message: row.get(4),
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("parsing timestamp {s:?}"))?
        .with_timezone(&Utc))
}

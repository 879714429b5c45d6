use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::store::{StateItem, StateStore, StoreResult};

const READ_POOL_SIZE: usize = 4;

#[derive(Debug)]
enum WriteCmd {
    Put {
        item: StateItem,
        now: i64,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    PutIfVersion {
        item: StateItem,
        expected: Option<i64>,
        now: i64,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    Delete {
        pk: String,
        sk: String,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
}

/// SQLite-backed store. Writes are serialized through one writer thread;
/// reads go through a small pool of read-only connections. Several processes
/// may open the same file: WAL mode plus busy timeouts arbitrate between them.
pub struct SqliteStateStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
}

impl Drop for SqliteStateStore {
    fn drop(&mut self) {
        // Close the sender first so the writer loop exits.
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl SqliteStateStore {
    fn sender(&self) -> StoreResult<&mpsc::Sender<WriteCmd>> {
        self.write_tx
            .as_ref()
            .ok_or_else(|| HarnessError::Database("store is closed".to_string()))
    }

    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        append_run_log(
            "info",
            "store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| HarnessError::Database(e.to_string()))?;
            }
        }

        let existed_before_open = path.exists();

        // Reject zero-byte files, they indicate prior corruption.
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| HarnessError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(HarnessError::Database(format!(
                    "state database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;

        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(HarnessError::Database(format!(
                    "state database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut write_conn)?;

        let (write_tx, mut write_rx) = mpsc::channel(128);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::Put { item, now, reply } => {
                        let _ = reply.send(put_item(&write_conn, &item, now));
                    }
                    WriteCmd::PutIfVersion {
                        item,
                        expected,
                        now,
                        reply,
                    } => {
                        let _ = reply.send(put_item_if_version(&write_conn, &item, expected, now));
                    }
                    WriteCmd::Delete { pk, sk, reply } => {
                        let _ = reply.send(delete_item(&write_conn, &pk, &sk));
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        append_run_log(
            "info",
            "store.opened",
            json!({ "path": path.display().to_string() }),
        );

        Ok(Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
            db_path: path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn submit<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> WriteCmd,
    ) -> StoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .blocking_send(build(reply_tx))
            .map_err(|e| HarnessError::Database(e.to_string()))?;
        let result = reply_rx
            .blocking_recv()
            .map_err(|e| HarnessError::Database(e.to_string()))?;
        if let Err(ref e) = result {
            append_run_log(
                "error",
                "store.write.failed",
                json!({ "path": self.db_path.display().to_string(), "error": e.to_string() }),
            );
        }
        result
    }
}

impl StateStore for SqliteStateStore {
    fn get(&self, pk: &str, sk: &str) -> StoreResult<Option<StateItem>> {
        append_run_log("debug", "store.get", json!({ "pk": pk, "sk": sk }));
        self.read_pool.with_conn(|conn| fetch_item(conn, pk, sk))
    }

    fn put(&self, item: StateItem) -> StoreResult<()> {
        append_run_log(
            "debug",
            "store.put",
            json!({ "pk": item.pk, "sk": item.sk }),
        );
        let now = system_time_unix();
        self.submit(|reply| WriteCmd::Put { item, now, reply })
    }

    fn put_if_version(&self, item: StateItem, expected: Option<i64>) -> StoreResult<bool> {
        let (pk, sk) = (item.pk.clone(), item.sk.clone());
        let now = system_time_unix();
        let written = self.submit(|reply| WriteCmd::PutIfVersion {
            item,
            expected,
            now,
            reply,
        })?;
        if written {
            append_run_log(
                "debug",
                "store.put_if_version",
                json!({ "pk": pk, "sk": sk, "expected": expected }),
            );
        } else {
            append_run_log(
                "warn",
                "store.put.conflict",
                json!({ "pk": pk, "sk": sk, "expected": expected }),
            );
        }
        Ok(written)
    }

    fn query(&self, pk: &str) -> StoreResult<Vec<StateItem>> {
        append_run_log("debug", "store.query", json!({ "pk": pk }));
        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(
                    "SELECT pk, sk, body, version
                     FROM state_items
                     WHERE pk = ?1
                     ORDER BY sk ASC",
                )
                .map_err(db_err)?;
            let rows = statement
                .query_map([pk], parse_row)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    fn delete(&self, pk: &str, sk: &str) -> StoreResult<bool> {
        append_run_log("debug", "store.delete", json!({ "pk": pk, "sk": sk }));
        let (pk, sk) = (pk.to_string(), sk.to_string());
        self.submit(|reply| WriteCmd::Delete { pk, sk, reply })
    }
}

#[derive(Clone)]
struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        append_run_log(
            "debug",
            "store.read_pool.open",
            json!({ "path": path.display().to_string(), "size": size }),
        );
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(3))
                .map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }

        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| HarnessError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    append_run_log("debug", "store.write_connection.configure", json!({}));
    // Set before any pragma so concurrent openers wait instead of failing.
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../../migrations/0001_test_state.sql"))];

    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();

        if exists {
            continue;
        }

        append_run_log(
            "info",
            "store.migration.applying",
            json!({ "version": version }),
        );
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        // Another process may have raced us to the same migration.
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, system_time_unix()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        append_run_log(
            "info",
            "store.migration.applied",
            json!({ "version": version }),
        );
    }

    Ok(())
}

fn put_item(conn: &Connection, item: &StateItem, now: i64) -> StoreResult<()> {
    append_run_log(
        "debug",
        "store.put_item.started",
        json!({ "pk": item.pk, "sk": item.sk }),
    );
    let body = serde_json::to_string(&item.body)
        .map_err(|e| HarnessError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO state_items (pk, sk, body, version, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT(pk, sk) DO UPDATE SET
            body = excluded.body,
            version = state_items.version + 1,
            updated_at = excluded.updated_at",
        params![item.pk, item.sk, body, now],
    )
    .map_err(db_err)?;
    Ok(())
}

fn put_item_if_version(
    conn: &Connection,
    item: &StateItem,
    expected: Option<i64>,
    now: i64,
) -> StoreResult<bool> {
    append_run_log(
        "debug",
        "store.put_item_if_version.started",
        json!({ "pk": item.pk, "sk": item.sk, "expected": expected }),
    );
    let body = serde_json::to_string(&item.body)
        .map_err(|e| HarnessError::Serialization(e.to_string()))?;
    let changed = match expected {
        None => conn
            .execute(
                "INSERT INTO state_items (pk, sk, body, version, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(pk, sk) DO NOTHING",
                params![item.pk, item.sk, body, now],
            )
            .map_err(db_err)?,
        Some(version) => conn
            .execute(
                "UPDATE state_items
                 SET body = ?3, version = version + 1, updated_at = ?4
                 WHERE pk = ?1 AND sk = ?2 AND version = ?5",
                params![item.pk, item.sk, body, now, version],
            )
            .map_err(db_err)?,
    };
    Ok(changed > 0)
}

fn delete_item(conn: &Connection, pk: &str, sk: &str) -> StoreResult<bool> {
    append_run_log(
        "debug",
        "store.delete_item.started",
        json!({ "pk": pk, "sk": sk }),
    );
    let changed = conn
        .execute(
            "DELETE FROM state_items WHERE pk = ?1 AND sk = ?2",
            params![pk, sk],
        )
        .map_err(db_err)?;
    Ok(changed > 0)
}

fn fetch_item(conn: &Connection, pk: &str, sk: &str) -> StoreResult<Option<StateItem>> {
    append_run_log(
        "debug",
        "store.fetch_item.started",
        json!({ "pk": pk, "sk": sk }),
    );
    conn.query_row(
        "SELECT pk, sk, body, version FROM state_items WHERE pk = ?1 AND sk = ?2",
        [pk, sk],
        parse_row,
    )
    .optional()
    .map_err(db_err)
}

fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateItem> {
    let body = row.get::<_, String>(2)?;
    Ok(StateItem {
        pk: row.get(0)?,
        sk: row.get(1)?,
        body: serde_json::from_str(&body).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        version: row.get(3)?,
    })
}

fn db_err(error: rusqlite::Error) -> HarnessError {
    HarnessError::Database(error.to_string())
}

pub fn system_time_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

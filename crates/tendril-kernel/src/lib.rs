//! SQLite-backed persistence for strands, semaphores, pages and advisory locks.
//!
//! Every mutation a worker makes to a strand goes through a lease: the
//! lease is taken with a compare-and-swap on the strand row and each tick is
//! committed in one transaction fenced on the lease holder token.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;

pub use error::KernelError;

/// Bound parameters for one nested call level of a strand.
pub type Frame = Map<String, Value>;

/// Back link `[prog, label]` stored on pushed frames.
pub const FRAME_LINK: &str = "link";
pub const FRAME_DEADLINE_TARGET: &str = "deadline_target";
pub const FRAME_DEADLINE_AT: &str = "deadline_at";

const STRAND_COLUMNS: &str =
    "id,parent_id,prog,label,stack,schedule,lease,lease_holder,tries,exitval,retval,created,updated";
const PAGE_COLUMNS: &str = "id,tag,summary,severity,related,details,created,resolved_at";

pub fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ts() -> String {
    ts(Utc::now())
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[derive(Clone, Debug)]
pub struct Kernel {
    db_path: PathBuf,
    busy_ms: u64,
}

/// A persisted strand: one long-running process and its continuation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StrandRow {
    pub id: String,
    pub parent_id: Option<String>,
    pub prog: String,
    pub label: String,
    /// Index 0 is the top frame.
    pub stack: Vec<Frame>,
    pub schedule: String,
    pub lease: Option<String>,
    pub lease_holder: Option<String>,
    pub tries: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exitval: Option<Frame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retval: Option<Frame>,
    pub created: String,
    pub updated: String,
}

impl StrandRow {
    pub fn is_finished(&self) -> bool {
        self.exitval.is_some()
    }

    pub fn top_frame(&self) -> Option<&Frame> {
        self.stack.first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStrand {
    pub id: String,
    pub parent_id: Option<String>,
    pub prog: String,
    pub label: String,
    pub stack: Vec<Frame>,
    /// Defaults to now.
    pub schedule: Option<String>,
}

impl NewStrand {
    pub fn new(prog: impl Into<String>, label: impl Into<String>, frame: Frame) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            prog: prog.into(),
            label: label.into(),
            stack: vec![frame],
            schedule: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreOp {
    pub strand_id: String,
    pub name: String,
    pub incr: bool,
    /// For a decrement: the highest generation the tick consumed. Requests
    /// made after it stay pending. `None` clears whatever is there.
    pub upto: Option<i64>,
}

impl SemaphoreOp {
    pub fn incr(strand_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            strand_id: strand_id.into(),
            name: name.into(),
            incr: true,
            upto: None,
        }
    }

    pub fn decr(strand_id: impl Into<String>, name: impl Into<String>, upto: Option<i64>) -> Self {
        Self {
            strand_id: strand_id.into(),
            name: name.into(),
            incr: false,
            upto,
        }
    }
}

/// Everything one tick changes, applied atomically by [`Kernel::commit_tick`].
#[derive(Debug, Clone, Default)]
pub struct TickCommit {
    pub id: String,
    pub holder: String,
    pub prog: String,
    pub label: String,
    pub stack: Vec<Frame>,
    pub schedule: String,
    pub exitval: Option<Frame>,
    pub retval: Option<Frame>,
    /// Drop the lease after this tick instead of keeping it for the next one.
    pub release: bool,
    pub buds: Vec<NewStrand>,
    pub semaphores: Vec<SemaphoreOp>,
    pub reaped: Vec<String>,
    /// `(name, seq)` of the strand's own semaphores as the tick saw them.
    /// Anything newer was requested mid-tick and wakes the strand.
    pub seen: Vec<(String, i64)>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PageRow {
    pub id: String,
    pub tag: String,
    pub summary: String,
    pub severity: String,
    pub related: Vec<String>,
    pub details: Value,
    pub created: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewPage {
    pub id: String,
    pub tag: String,
    pub summary: String,
    pub severity: String,
    pub related: Vec<String>,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageInsert {
    Created(PageRow),
    /// An unresolved page with the same tag was already open.
    Existing(PageRow),
}

impl PageInsert {
    pub fn page(&self) -> &PageRow {
        match self {
            PageInsert::Created(p) | PageInsert::Existing(p) => p,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, PageInsert::Created(_))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventRow {
    pub id: i64,
    pub time: String,
    pub kind: String,
    pub subject: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrandCounts {
    pub active: i64,
    pub finished: i64,
    pub leased: i64,
}

fn json_col<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn strand_from_row(r: &Row<'_>) -> rusqlite::Result<StrandRow> {
    let stack_s: String = r.get(4)?;
    let exit_s: Option<String> = r.get(9)?;
    let ret_s: Option<String> = r.get(10)?;
    Ok(StrandRow {
        id: r.get(0)?,
        parent_id: r.get(1)?,
        prog: r.get(2)?,
        label: r.get(3)?,
        stack: json_col(4, &stack_s)?,
        schedule: r.get(5)?,
        lease: r.get(6)?,
        lease_holder: r.get(7)?,
        tries: r.get(8)?,
        exitval: exit_s.map(|s| json_col(9, &s)).transpose()?,
        retval: ret_s.map(|s| json_col(10, &s)).transpose()?,
        created: r.get(11)?,
        updated: r.get(12)?,
    })
}

fn page_from_row(r: &Row<'_>) -> rusqlite::Result<PageRow> {
    let related_s: String = r.get(4)?;
    let details_s: String = r.get(5)?;
    Ok(PageRow {
        id: r.get(0)?,
        tag: r.get(1)?,
        summary: r.get(2)?,
        severity: r.get(3)?,
        related: json_col(4, &related_s)?,
        details: serde_json::from_str(&details_s).unwrap_or(serde_json::json!({})),
        created: r.get(6)?,
        resolved_at: r.get(7)?,
    })
}

fn env_num<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn insert_strand_tx(conn: &Connection, new: &NewStrand, now: &str) -> Result<()> {
    if new.stack.is_empty() {
        return Err(KernelError::EmptyStack(new.id.clone()).into());
    }
    let stack_s = serde_json::to_string(&new.stack)?;
    let schedule = new.schedule.as_deref().unwrap_or(now);
    conn.execute(
        "INSERT INTO strand(id,parent_id,prog,label,stack,schedule,tries,created,updated) VALUES(?,?,?,?,?,?,0,?,?)",
        params![new.id, new.parent_id, new.prog, new.label, stack_s, schedule, now, now],
    )?;
    Ok(())
}

/// Saturating increment. Returns false when the strand does not exist.
fn incr_tx(conn: &Connection, strand_id: &str, name: &str, now: &str, wake: bool) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM strand WHERE id=?)",
        [strand_id],
        |r| r.get(0),
    )?;
    if !exists {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO semaphore(id,strand_id,name,seq,created) VALUES(?1,?2,?3,1,?4) \
         ON CONFLICT(strand_id,name) DO UPDATE SET seq=seq+1",
        params![uuid::Uuid::new_v4().to_string(), strand_id, name, now],
    )?;
    if wake {
        conn.execute(
            "UPDATE strand SET schedule=?1 WHERE id=?2 AND exitval IS NULL AND schedule > ?1",
            params![now, strand_id],
        )?;
    }
    Ok(true)
}

fn semaphore_seqs(conn: &Connection, strand_id: &str) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare("SELECT name, seq FROM semaphore WHERE strand_id=? ORDER BY name")?;
    let rows = stmt
        .query_map([strand_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("strands.sqlite");
        // Busy timeout (default 5000ms; override with TENDRIL_SQLITE_BUSY_MS)
        let busy_ms: u64 = env_num("TENDRIL_SQLITE_BUSY_MS").unwrap_or(5000);
        let kernel = Self { db_path, busy_ms };
        let conn = kernel.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        // Cache size: negative = KB units. Default ~= 20MB
        let cache_pages: i64 = env_num("TENDRIL_SQLITE_CACHE_PAGES").unwrap_or(-20000);
        let _ = conn.pragma_update(None, "cache_size", cache_pages);
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        if let Some(mb) = env_num::<i64>("TENDRIL_SQLITE_MMAP_MB") {
            let bytes: i64 = mb.max(0) * 1024 * 1024;
            let _ = conn.pragma_update(None, "mmap_size", bytes);
        }
        Self::init_schema(&conn)?;
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS strand (
              id TEXT PRIMARY KEY,
              parent_id TEXT,
              prog TEXT NOT NULL,
              label TEXT NOT NULL,
              stack TEXT NOT NULL,          -- JSON array of frames, top first
              schedule TEXT NOT NULL,
              lease TEXT,                   -- lease expiry; future value = owned
              lease_holder TEXT,
              tries INTEGER NOT NULL DEFAULT 0,
              exitval TEXT,
              retval TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_strand_parent ON strand(parent_id);
            CREATE INDEX IF NOT EXISTS idx_strand_schedule ON strand(schedule) WHERE exitval IS NULL;

            -- Semaphores saturate at one pending request per (strand, name);
            -- seq grows with every request so a consumer only clears what it saw
            CREATE TABLE IF NOT EXISTS semaphore (
              id TEXT PRIMARY KEY,
              strand_id TEXT NOT NULL,
              name TEXT NOT NULL,
              seq INTEGER NOT NULL DEFAULT 1,
              created TEXT NOT NULL,
              UNIQUE(strand_id, name)
            );

            CREATE TABLE IF NOT EXISTS page (
              id TEXT PRIMARY KEY,          -- same id as the page's strand
              tag TEXT NOT NULL,
              summary TEXT NOT NULL,
              severity TEXT NOT NULL,
              related TEXT NOT NULL,
              details TEXT NOT NULL,
              created TEXT NOT NULL,
              resolved_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_page_open_tag ON page(tag) WHERE resolved_at IS NULL;

            CREATE TABLE IF NOT EXISTS advisory_lock (
              key TEXT PRIMARY KEY,
              holder TEXT NOT NULL,
              until TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              time TEXT NOT NULL,
              kind TEXT NOT NULL,
              subject TEXT,
              payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            CREATE INDEX IF NOT EXISTS idx_events_subject ON events(subject);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_millis(self.busy_ms))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------- Strands ----------------

    pub fn insert_strand(&self, new: &NewStrand) -> Result<StrandRow> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        insert_strand_tx(&tx, new, &now_ts())?;
        tx.commit()?;
        self.get_strand(&new.id)?
            .ok_or_else(|| KernelError::StrandNotFound(new.id.clone()).into())
    }

    pub fn get_strand(&self, id: &str) -> Result<Option<StrandRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STRAND_COLUMNS} FROM strand WHERE id=? LIMIT 1"
        ))?;
        Ok(stmt.query_row([id], strand_from_row).optional()?)
    }

    /// Children not yet reaped, oldest first.
    pub fn children(&self, parent_id: &str) -> Result<Vec<StrandRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STRAND_COLUMNS} FROM strand WHERE parent_id=? ORDER BY created, id"
        ))?;
        let rows = stmt.query_map([parent_id], strand_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_strands(&self, limit: i64) -> Result<Vec<StrandRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STRAND_COLUMNS} FROM strand ORDER BY updated DESC LIMIT ?"
        ))?;
        let rows = stmt.query_map([limit], strand_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn strand_counts(&self) -> Result<StrandCounts> {
        let conn = self.conn()?;
        let now = now_ts();
        let counts = conn.query_row(
            "SELECT \
               COALESCE(SUM(CASE WHEN exitval IS NULL THEN 1 ELSE 0 END),0), \
               COALESCE(SUM(CASE WHEN exitval IS NOT NULL THEN 1 ELSE 0 END),0), \
               COALESCE(SUM(CASE WHEN lease IS NOT NULL AND lease >= ? THEN 1 ELSE 0 END),0) \
             FROM strand",
            [now],
            |r| {
                Ok(StrandCounts {
                    active: r.get(0)?,
                    finished: r.get(1)?,
                    leased: r.get(2)?,
                })
            },
        )?;
        Ok(counts)
    }

    /// Ids of unfinished, lease-free strands whose schedule has passed,
    /// earliest first, excluding `skip`.
    pub fn due_strands(&self, limit: usize, skip: &[String]) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let now = now_ts();
        let fetch = (limit + skip.len()) as i64;
        let mut stmt = conn.prepare(
            "SELECT id FROM strand WHERE exitval IS NULL AND schedule <= ?1 \
             AND (lease IS NULL OR lease < ?1) ORDER BY schedule LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![now, fetch], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids
            .into_iter()
            .filter(|id| !skip.contains(id))
            .take(limit)
            .collect())
    }

    /// Compare-and-swap on the lease column. Returns the strand when the
    /// lease was granted to `holder`, `None` when it is finished, missing,
    /// or owned by someone else.
    pub fn acquire_lease(
        &self,
        id: &str,
        holder: &str,
        lease_for: Duration,
    ) -> Result<Option<StrandRow>> {
        let conn = self.conn()?;
        let now = Utc::now();
        let until = now + chrono::Duration::from_std(lease_for)?;
        let mut stmt = conn.prepare(&format!(
            "UPDATE strand SET lease=?1, lease_holder=?2, updated=?3 \
             WHERE id=?4 AND exitval IS NULL AND (lease IS NULL OR lease < ?3) \
             RETURNING {STRAND_COLUMNS}"
        ))?;
        let mut rows = stmt.query(params![ts(until), holder, ts(now), id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(strand_from_row(row)?));
        }
        Ok(None)
    }

    pub fn release_lease(&self, id: &str, holder: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE strand SET lease=NULL, lease_holder=NULL, updated=? WHERE id=? AND lease_holder=?",
            params![now_ts(), id, holder],
        )?;
        Ok(n > 0)
    }

    /// Marks a failed run: bumps `tries`, reschedules and drops the lease.
    pub fn record_failure(&self, id: &str, holder: &str, retry_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE strand SET tries=tries+1, schedule=?, lease=NULL, lease_holder=NULL, updated=? \
             WHERE id=? AND lease_holder=?",
            params![ts(retry_at), now_ts(), id, holder],
        )?;
        Ok(n > 0)
    }

    /// Applies one tick atomically. Fails with [`KernelError::LeaseLost`]
    /// (and changes nothing) when `holder` no longer owns the strand.
    pub fn commit_tick(&self, c: &TickCommit) -> Result<()> {
        if c.stack.is_empty() {
            return Err(KernelError::EmptyStack(c.id.clone()).into());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ts();
        let stack_s = serde_json::to_string(&c.stack)?;
        let exit_s = c.exitval.as_ref().map(serde_json::to_string).transpose()?;
        let ret_s = c.retval.as_ref().map(serde_json::to_string).transpose()?;
        let n = tx.execute(
            "UPDATE strand SET prog=?1, label=?2, stack=?3, schedule=?4, exitval=?5, retval=?6, tries=0, \
               lease=CASE WHEN ?7 THEN NULL ELSE lease END, \
               lease_holder=CASE WHEN ?7 THEN NULL ELSE lease_holder END, \
               updated=?8 \
             WHERE id=?9 AND lease_holder=?10 AND exitval IS NULL",
            params![
                c.prog, c.label, stack_s, c.schedule, exit_s, ret_s, c.release, now, c.id, c.holder
            ],
        )?;
        if n == 0 {
            return Err(KernelError::LeaseLost(c.id.clone()).into());
        }
        for bud in &c.buds {
            insert_strand_tx(&tx, bud, &now)?;
        }
        let requested_meanwhile = semaphore_seqs(&tx, &c.id)?
            .iter()
            .any(|(name, seq)| !c.seen.iter().any(|(n, s)| n == name && s >= seq));
        for op in &c.semaphores {
            if op.incr {
                // A strand waking itself would undo its own nap.
                incr_tx(&tx, &op.strand_id, &op.name, &now, op.strand_id != c.id)?;
            } else {
                tx.execute(
                    "DELETE FROM semaphore WHERE strand_id=?1 AND name=?2 AND seq <= COALESCE(?3, seq)",
                    params![op.strand_id, op.name, op.upto],
                )?;
            }
        }
        if requested_meanwhile && c.exitval.is_none() {
            tx.execute(
                "UPDATE strand SET schedule=?1 WHERE id=?2 AND schedule > ?1",
                params![now, c.id],
            )?;
        }
        for child in &c.reaped {
            let gone = tx.execute(
                "DELETE FROM strand WHERE id=? AND parent_id=? AND exitval IS NOT NULL",
                params![child, c.id],
            )?;
            if gone > 0 {
                tx.execute("DELETE FROM semaphore WHERE strand_id=?", [child])?;
            }
        }
        if c.exitval.is_some() {
            tx.execute("DELETE FROM semaphore WHERE strand_id=?", [&c.id])?;
            tx.execute(
                "UPDATE strand SET schedule=?1 WHERE id=(SELECT parent_id FROM strand WHERE id=?2) AND exitval IS NULL",
                params![now, c.id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Deletes finished root strands last touched before `before`, plus
    /// finished children whose parent is gone.
    pub fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let cutoff = ts(before);
        tx.execute(
            "DELETE FROM semaphore WHERE strand_id IN \
             (SELECT id FROM strand WHERE parent_id IS NULL AND exitval IS NOT NULL AND updated < ?)",
            [&cutoff],
        )?;
        let roots = tx.execute(
            "DELETE FROM strand WHERE parent_id IS NULL AND exitval IS NOT NULL AND updated < ?",
            [&cutoff],
        )?;
        let orphans = tx.execute(
            "DELETE FROM strand WHERE parent_id IS NOT NULL AND exitval IS NOT NULL \
             AND parent_id NOT IN (SELECT id FROM strand)",
            [],
        )?;
        tx.commit()?;
        Ok(roots + orphans)
    }

    // ---------------- Semaphores ----------------

    /// Requests action `name` on a strand and wakes it if it is napping.
    pub fn incr_semaphore(&self, strand_id: &str, name: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if !incr_tx(&tx, strand_id, name, &now_ts(), true)? {
            return Err(KernelError::StrandNotFound(strand_id.to_string()).into());
        }
        tx.commit()?;
        Ok(())
    }

    pub fn decr_semaphore(&self, strand_id: &str, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM semaphore WHERE strand_id=? AND name=?",
            params![strand_id, name],
        )?;
        Ok(n > 0)
    }

    pub fn is_semaphore_set(&self, strand_id: &str, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let set: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM semaphore WHERE strand_id=? AND name=?)",
            params![strand_id, name],
            |r| r.get(0),
        )?;
        Ok(set)
    }

    /// Pending semaphores with their request generation.
    pub fn semaphore_snapshot(&self, strand_id: &str) -> Result<Vec<(String, i64)>> {
        let conn = self.conn()?;
        semaphore_seqs(&conn, strand_id)
    }

    pub fn semaphore_seq(&self, strand_id: &str, name: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT seq FROM semaphore WHERE strand_id=? AND name=?",
                params![strand_id, name],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn semaphores(&self, strand_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name FROM semaphore WHERE strand_id=? ORDER BY name")?;
        let names = stmt
            .query_map([strand_id], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    // ---------------- Pages ----------------

    /// Opens a page and its strand unless an unresolved page with the same
    /// tag exists, in which case that page is returned untouched.
    pub fn insert_page(&self, page: &NewPage, strand: &NewStrand) -> Result<PageInsert> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = tx
            .query_row(
                &format!("SELECT {PAGE_COLUMNS} FROM page WHERE tag=? AND resolved_at IS NULL"),
                [&page.tag],
                page_from_row,
            )
            .optional()?;
        if let Some(p) = existing {
            return Ok(PageInsert::Existing(p));
        }
        let now = now_ts();
        tx.execute(
            "INSERT INTO page(id,tag,summary,severity,related,details,created) VALUES(?,?,?,?,?,?,?)",
            params![
                page.id,
                page.tag,
                page.summary,
                page.severity,
                serde_json::to_string(&page.related)?,
                serde_json::to_string(&page.details)?,
                now
            ],
        )?;
        insert_strand_tx(&tx, strand, &now)?;
        tx.commit()?;
        let row = self
            .get_page(&page.id)?
            .ok_or_else(|| anyhow!("page {} vanished after insert", page.id))?;
        Ok(PageInsert::Created(row))
    }

    pub fn get_page(&self, id: &str) -> Result<Option<PageRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {PAGE_COLUMNS} FROM page WHERE id=?"))?;
        Ok(stmt.query_row([id], page_from_row).optional()?)
    }

    pub fn find_open_page(&self, tag: &str) -> Result<Option<PageRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PAGE_COLUMNS} FROM page WHERE tag=? AND resolved_at IS NULL"
        ))?;
        Ok(stmt.query_row([tag], page_from_row).optional()?)
    }

    pub fn list_pages(&self, open_only: bool, limit: i64) -> Result<Vec<PageRow>> {
        let conn = self.conn()?;
        let sql = if open_only {
            format!("SELECT {PAGE_COLUMNS} FROM page WHERE resolved_at IS NULL ORDER BY created DESC LIMIT ?")
        } else {
            format!("SELECT {PAGE_COLUMNS} FROM page ORDER BY created DESC LIMIT ?")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], page_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn resolve_page(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE page SET resolved_at=? WHERE id=? AND resolved_at IS NULL",
            params![now_ts(), id],
        )?;
        Ok(n > 0)
    }

    // ---------------- Deadlines ----------------

    /// Unfinished strands whose top frame carries a deadline at or before `now`.
    pub fn expired_deadlines(&self, now: DateTime<Utc>) -> Result<Vec<StrandRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STRAND_COLUMNS} FROM strand WHERE exitval IS NULL \
             AND json_extract(stack, '$[0].{FRAME_DEADLINE_AT}') IS NOT NULL \
             AND json_extract(stack, '$[0].{FRAME_DEADLINE_AT}') <= ? \
             ORDER BY schedule"
        ))?;
        let rows = stmt.query_map([ts(now)], strand_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---------------- Advisory locks ----------------

    /// Takes (or re-takes) the named lock for `holder` unless another holder
    /// has it and it has not expired.
    pub fn try_lock(&self, key: &str, holder: &str, hold_for: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let now = Utc::now();
        let until = now + chrono::Duration::from_std(hold_for)?;
        let n = conn.execute(
            "INSERT INTO advisory_lock(key,holder,until) VALUES(?1,?2,?3) \
             ON CONFLICT(key) DO UPDATE SET holder=excluded.holder, until=excluded.until \
             WHERE advisory_lock.holder=excluded.holder OR advisory_lock.until < ?4",
            params![key, holder, ts(until), ts(now)],
        )?;
        Ok(n > 0)
    }

    pub fn unlock_all(&self, holder: &str) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM advisory_lock WHERE holder=?", [holder])?)
    }

    // ---------------- Events ----------------

    pub fn append_event(&self, env: &tendril_events::Envelope) -> Result<i64> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&env.payload).unwrap_or("{}".to_string());
        conn.execute(
            "INSERT INTO events(time,kind,subject,payload) VALUES (?,?,?,?)",
            params![env.time, env.kind, env.subject, payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_events(&self, limit: i64, after_id: Option<i64>) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt_after;
        let mut stmt_all;
        let mut rows = if let Some(aid) = after_id {
            stmt_after = conn.prepare(
                "SELECT id,time,kind,subject,payload FROM events WHERE id>? ORDER BY id ASC LIMIT ?",
            )?;
            stmt_after.query(params![aid, limit])?
        } else {
            stmt_all = conn.prepare(
                "SELECT id,time,kind,subject,payload FROM events ORDER BY id DESC LIMIT ?",
            )?;
            stmt_all.query(params![limit])?
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload_s: String = row.get(4)?;
            out.push(EventRow {
                id: row.get(0)?,
                time: row.get(1)?,
                kind: row.get(2)?,
                subject: row.get(3)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
            });
        }
        // Ensure ascending order for replay
        if after_id.is_none() {
            out.reverse();
        }
        Ok(out)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Kernel) -> Result<T> + Send + 'static,
    {
        let k = self.clone();
        tokio::task::spawn_blocking(move || f(k))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn insert_strand_async(&self, new: &NewStrand) -> Result<StrandRow> {
        let new = new.clone();
        self.blocking(move |k| k.insert_strand(&new)).await
    }

    pub async fn get_strand_async(&self, id: &str) -> Result<Option<StrandRow>> {
        let id = id.to_string();
        self.blocking(move |k| k.get_strand(&id)).await
    }

    pub async fn children_async(&self, parent_id: &str) -> Result<Vec<StrandRow>> {
        let parent_id = parent_id.to_string();
        self.blocking(move |k| k.children(&parent_id)).await
    }

    pub async fn due_strands_async(&self, limit: usize, skip: Vec<String>) -> Result<Vec<String>> {
        self.blocking(move |k| k.due_strands(limit, &skip)).await
    }

    pub async fn acquire_lease_async(
        &self,
        id: &str,
        holder: &str,
        lease_for: Duration,
    ) -> Result<Option<StrandRow>> {
        let id = id.to_string();
        let holder = holder.to_string();
        self.blocking(move |k| k.acquire_lease(&id, &holder, lease_for))
            .await
    }

    pub async fn release_lease_async(&self, id: &str, holder: &str) -> Result<bool> {
        let id = id.to_string();
        let holder = holder.to_string();
        self.blocking(move |k| k.release_lease(&id, &holder)).await
    }

    pub async fn record_failure_async(
        &self,
        id: &str,
        holder: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let id = id.to_string();
        let holder = holder.to_string();
        self.blocking(move |k| k.record_failure(&id, &holder, retry_at))
            .await
    }

    pub async fn commit_tick_async(&self, commit: TickCommit) -> Result<()> {
        self.blocking(move |k| k.commit_tick(&commit)).await
    }

    pub async fn purge_finished_async(&self, before: DateTime<Utc>) -> Result<usize> {
        self.blocking(move |k| k.purge_finished(before)).await
    }

    pub async fn incr_semaphore_async(&self, strand_id: &str, name: &str) -> Result<()> {
        let strand_id = strand_id.to_string();
        let name = name.to_string();
        self.blocking(move |k| k.incr_semaphore(&strand_id, &name))
            .await
    }

    pub async fn is_semaphore_set_async(&self, strand_id: &str, name: &str) -> Result<bool> {
        let strand_id = strand_id.to_string();
        let name = name.to_string();
        self.blocking(move |k| k.is_semaphore_set(&strand_id, &name))
            .await
    }

    pub async fn semaphore_snapshot_async(&self, strand_id: &str) -> Result<Vec<(String, i64)>> {
        let strand_id = strand_id.to_string();
        self.blocking(move |k| k.semaphore_snapshot(&strand_id)).await
    }

    pub async fn semaphore_seq_async(&self, strand_id: &str, name: &str) -> Result<Option<i64>> {
        let strand_id = strand_id.to_string();
        let name = name.to_string();
        self.blocking(move |k| k.semaphore_seq(&strand_id, &name))
            .await
    }

    pub async fn semaphores_async(&self, strand_id: &str) -> Result<Vec<String>> {
        let strand_id = strand_id.to_string();
        self.blocking(move |k| k.semaphores(&strand_id)).await
    }

    pub async fn insert_page_async(&self, page: NewPage, strand: NewStrand) -> Result<PageInsert> {
        self.blocking(move |k| k.insert_page(&page, &strand)).await
    }

    pub async fn find_open_page_async(&self, tag: &str) -> Result<Option<PageRow>> {
        let tag = tag.to_string();
        self.blocking(move |k| k.find_open_page(&tag)).await
    }

    pub async fn resolve_page_async(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |k| k.resolve_page(&id)).await
    }

    pub async fn expired_deadlines_async(&self, now: DateTime<Utc>) -> Result<Vec<StrandRow>> {
        self.blocking(move |k| k.expired_deadlines(now)).await
    }

    pub async fn try_lock_async(&self, key: &str, holder: &str, hold_for: Duration) -> Result<bool> {
        let key = key.to_string();
        let holder = holder.to_string();
        self.blocking(move |k| k.try_lock(&key, &holder, hold_for))
            .await
    }

    pub async fn unlock_all_async(&self, holder: &str) -> Result<usize> {
        let holder = holder.to_string();
        self.blocking(move |k| k.unlock_all(&holder)).await
    }

    pub async fn append_event_async(&self, env: &tendril_events::Envelope) -> Result<i64> {
        let env = env.clone();
        self.blocking(move |k| k.append_event(&env)).await
    }
}

//! SQLite persistence for pixel-hawk.
//!
//! The kernel owns every persistent row: persons, projects, tiles, the
//! tile/project junction, and the append-only diff history. It also
//! answers the scheduler's bucket queries. One pooled connection set,
//! WAL journal, single serialized writer. Blocking SQLite work runs on
//! a small dedicated thread pool; the `*_async` wrappers hand results
//! back to the tokio side over oneshot channels.

use anyhow::{anyhow, bail, Context, Result};
use hawk_core::{ProjectState, Rectangle, Streak, Tile, HEAT_BURNING, HEAT_INACTIVE};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tokio::sync::oneshot;

mod rows;
pub use rows::{DiffCommit, HistoryChange, Person, Project, TileRecord};

const DB_FILE: &str = "pixel-hawk.db";

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    pool: Arc<PoolShared>,
    blocking: BlockingPool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cvar: Condvar,
    target: usize,
}

struct PoolState {
    conns: Vec<Connection>,
    created: usize,
}

struct ManagedConnection {
    conn: Option<Connection>,
    pool: Arc<PoolShared>,
}

impl Deref for ManagedConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already taken")
    }
}

impl DerefMut for ManagedConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already taken")
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut guard = self.pool.state.lock().expect("pool mutex poisoned");
            guard.conns.push(conn);
            drop(guard);
            self.pool.cvar.notify_one();
        }
    }
}

type BlockingJob = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
struct BlockingPool {
    state: Arc<BlockingPoolState>,
}

struct BlockingPoolState {
    queue: Mutex<VecDeque<BlockingJob>>,
    cvar: Condvar,
    shutdown: AtomicBool,
}

impl BlockingPool {
    fn new(size: usize) -> Result<Self> {
        let state = Arc::new(BlockingPoolState {
            queue: Mutex::new(VecDeque::new()),
            cvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        for idx in 0..size.max(1) {
            let worker_state = Arc::clone(&state);
            thread::Builder::new()
                .name(format!("hawk-kernel-blocking-{idx}"))
                .spawn(move || BlockingPoolState::worker_loop(worker_state))
                .map_err(|e| anyhow!("failed to spawn kernel blocking worker: {e}"))?;
        }
        Ok(Self { state })
    }

    async fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.state.enqueue(Box::new(move || {
            let res = job();
            let _ = tx.send(res);
        }))?;
        rx.await
            .map_err(|_| anyhow!("kernel blocking worker exited unexpectedly"))?
    }

    fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::Relaxed);
        self.state.cvar.notify_all();
    }
}

impl BlockingPoolState {
    fn enqueue(&self, job: BlockingJob) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            bail!("kernel blocking pool shutting down");
        }
        let mut guard = self.queue.lock().expect("blocking queue mutex poisoned");
        guard.push_back(job);
        drop(guard);
        self.cvar.notify_one();
        Ok(())
    }

    fn worker_loop(state: Arc<Self>) {
        loop {
            let job = {
                let mut guard = state.queue.lock().expect("blocking queue mutex poisoned");
                loop {
                    if let Some(job) = guard.pop_front() {
                        break job;
                    }
                    if state.shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    guard = state
                        .cvar
                        .wait(guard)
                        .expect("blocking queue condvar poisoned");
                }
            };
            job();
        }
    }
}

fn pool_size_from_env() -> usize {
    std::env::var("HAWK_SQLITE_POOL_SIZE")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(4)
}

fn blocking_worker_count() -> usize {
    std::env::var("HAWK_KERNEL_BLOCKING_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(2)
}

impl Kernel {
    /// Open (creating if needed) the database under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create data dir {}", dir.display()))?;
        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;
        Self::apply_pragmas(&conn)?;
        Self::init_schema(&conn)?;
        let pool = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                conns: vec![conn],
                created: 1,
            }),
            cvar: Condvar::new(),
            target: pool_size_from_env(),
        });
        let blocking = BlockingPool::new(blocking_worker_count())?;
        Ok(Self {
            db_path,
            pool,
            blocking,
        })
    }

    /// Stop the blocking workers. Queued jobs finish; new ones fail.
    pub fn close(&self) {
        self.blocking.shutdown();
    }

    fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS person (
              id INTEGER PRIMARY KEY,
              name TEXT NOT NULL UNIQUE,
              discord_id INTEGER UNIQUE,
              access INTEGER NOT NULL DEFAULT 0,
              watched_tiles_count INTEGER NOT NULL DEFAULT 0,
              active_projects_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS project (
              id INTEGER PRIMARY KEY,
              owner_id INTEGER NOT NULL REFERENCES person(id),
              name TEXT NOT NULL,
              state INTEGER NOT NULL DEFAULT 0,
              x INTEGER NOT NULL DEFAULT 0,
              y INTEGER NOT NULL DEFAULT 0,
              width INTEGER NOT NULL DEFAULT 0,
              height INTEGER NOT NULL DEFAULT 0,
              first_seen INTEGER NOT NULL DEFAULT 0,
              last_check INTEGER NOT NULL DEFAULT 0,
              last_snapshot INTEGER NOT NULL DEFAULT 0,
              max_completion_pixels INTEGER NOT NULL DEFAULT 0,
              max_completion_percent REAL NOT NULL DEFAULT 0.0,
              max_completion_time INTEGER NOT NULL DEFAULT 0,
              total_progress INTEGER NOT NULL DEFAULT 0,
              total_regress INTEGER NOT NULL DEFAULT 0,
              largest_regress_pixels INTEGER NOT NULL DEFAULT 0,
              largest_regress_time INTEGER NOT NULL DEFAULT 0,
              streak INTEGER NOT NULL DEFAULT 0,
              last_log_message TEXT NOT NULL DEFAULT ''
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_project_owner_name ON project(owner_id, name);
            CREATE INDEX IF NOT EXISTS idx_project_state ON project(state);

            CREATE TABLE IF NOT EXISTS tile (
              id INTEGER PRIMARY KEY,
              x INTEGER NOT NULL,
              y INTEGER NOT NULL,
              heat INTEGER NOT NULL DEFAULT 999,
              last_checked INTEGER NOT NULL DEFAULT 0,
              last_update INTEGER NOT NULL DEFAULT 0,
              etag TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_tile_heat_checked ON tile(heat, last_checked);
            CREATE INDEX IF NOT EXISTS idx_tile_last_update ON tile(last_update);

            CREATE TABLE IF NOT EXISTS tile_project (
              tile_id INTEGER NOT NULL REFERENCES tile(id),
              project_id INTEGER NOT NULL REFERENCES project(id),
              UNIQUE(tile_id, project_id)
            );
            CREATE INDEX IF NOT EXISTS idx_tile_project_project ON tile_project(project_id);

            CREATE TABLE IF NOT EXISTS history_change (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              project_id INTEGER NOT NULL REFERENCES project(id),
              timestamp INTEGER NOT NULL,
              status INTEGER NOT NULL,
              pixels_remaining INTEGER NOT NULL DEFAULT 0,
              pixels_target INTEGER NOT NULL DEFAULT 0,
              completion_percent REAL NOT NULL DEFAULT 0.0,
              progress_pixels INTEGER NOT NULL DEFAULT 0,
              regress_pixels INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_history_project_time
              ON history_change(project_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<ManagedConnection> {
        let mut guard = self.pool.state.lock().expect("pool mutex poisoned");
        loop {
            if let Some(conn) = guard.conns.pop() {
                drop(guard);
                return Ok(ManagedConnection {
                    conn: Some(conn),
                    pool: self.pool.clone(),
                });
            }
            if guard.created < self.pool.target {
                guard.created += 1;
                drop(guard);
                let conn = match Connection::open(&self.db_path) {
                    Ok(conn) => conn,
                    Err(e) => {
                        let mut guard = self.pool.state.lock().expect("pool mutex poisoned");
                        guard.created -= 1;
                        drop(guard);
                        self.pool.cvar.notify_one();
                        return Err(e.into());
                    }
                };
                if let Err(e) = Self::apply_pragmas(&conn) {
                    let mut guard = self.pool.state.lock().expect("pool mutex poisoned");
                    guard.created -= 1;
                    drop(guard);
                    self.pool.cvar.notify_one();
                    return Err(e.into());
                }
                return Ok(ManagedConnection {
                    conn: Some(conn),
                    pool: self.pool.clone(),
                });
            }
            guard = self.pool.cvar.wait(guard).expect("pool condvar poisoned");
        }
    }

    async fn run_blocking<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(Kernel) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let kernel = self.clone();
        self.blocking.run(move || job(kernel)).await
    }

    // ---- persons ----

    pub fn insert_person(
        &self,
        name: &str,
        discord_id: Option<i64>,
        access: i64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.prepare_cached("INSERT INTO person(name, discord_id, access) VALUES (?,?,?)")?
            .execute(params![name, discord_id, access])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_person(&self, id: i64) -> Result<Option<Person>> {
        let conn = self.conn()?;
        let person = conn
            .prepare_cached(
                "SELECT id, name, discord_id, access, watched_tiles_count, active_projects_count \
                 FROM person WHERE id = ?",
            )?
            .query_row([id], rows::map_person)
            .optional()?;
        Ok(person)
    }

    pub fn list_persons(&self) -> Result<Vec<Person>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, discord_id, access, watched_tiles_count, active_projects_count \
             FROM person ORDER BY id",
        )?;
        let persons = stmt
            .query_map([], rows::map_person)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(persons)
    }

    /// Recompute the cached per-person counts from current projects.
    pub fn recompute_person_totals(&self, person_id: i64) -> Result<Person> {
        let conn = self.conn()?;
        let watched: i64 = conn
            .prepare_cached(
                "SELECT COUNT(DISTINCT tp.tile_id) FROM tile_project tp \
                 JOIN project p ON p.id = tp.project_id \
                 WHERE p.owner_id = ? AND p.state = ?",
            )?
            .query_row(params![person_id, ProjectState::Active.as_i64()], |r| {
                r.get(0)
            })?;
        let active: i64 = conn
            .prepare_cached("SELECT COUNT(*) FROM project WHERE owner_id = ? AND state = ?")?
            .query_row(params![person_id, ProjectState::Active.as_i64()], |r| {
                r.get(0)
            })?;
        conn.prepare_cached(
            "UPDATE person SET watched_tiles_count = ?, active_projects_count = ? WHERE id = ?",
        )?
        .execute(params![watched, active, person_id])?;
        drop(conn);
        self.get_person(person_id)?
            .ok_or_else(|| anyhow!("person {person_id} vanished during recompute"))
    }

    pub async fn list_persons_async(&self) -> Result<Vec<Person>> {
        self.run_blocking(move |k| k.list_persons()).await
    }

    pub async fn recompute_person_totals_async(&self, person_id: i64) -> Result<Person> {
        self.run_blocking(move |k| k.recompute_person_totals(person_id))
            .await
    }

    // ---- projects ----

    /// Register a project: draws a random id in 1..=9999, creates the
    /// tile rows it overlaps, and links them. One transaction.
    pub fn insert_project(
        &self,
        owner_id: i64,
        name: &str,
        rect: Rectangle,
        state: ProjectState,
        now: i64,
    ) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut rng = rand::thread_rng();
        let mut project_id = 0i64;
        for _ in 0..128 {
            let candidate: i64 = rng.gen_range(1..=9_999);
            let taken: Option<i64> = tx
                .prepare_cached("SELECT id FROM project WHERE id = ?")?
                .query_row([candidate], |r| r.get(0))
                .optional()?;
            if taken.is_none() {
                project_id = candidate;
                break;
            }
        }
        if project_id == 0 {
            bail!("could not find a free project id after 128 draws");
        }
        tx.prepare_cached(
            "INSERT INTO project(id, owner_id, name, state, x, y, width, height, first_seen, last_check) \
             VALUES (?,?,?,?,?,?,?,?,?,?)",
        )?
        .execute(params![
            project_id,
            owner_id,
            name,
            state.as_i64(),
            rect.x,
            rect.y,
            rect.w,
            rect.h,
            now,
            now,
        ])?;
        for tile in rect.tiles() {
            link_tile(&tx, tile, project_id)?;
        }
        tx.commit()?;
        Ok(project_id)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let conn = self.conn()?;
        let project = conn
            .prepare_cached(&format!(
                "SELECT {} FROM project p JOIN person per ON per.id = p.owner_id WHERE p.id = ?",
                rows::PROJECT_COLUMNS
            ))?
            .query_row([id], rows::map_project)
            .optional()?;
        Ok(project)
    }

    /// Change a project's state, keeping tile heats consistent: a tile
    /// stays warm iff some non-inactive project still references it.
    pub fn set_project_state(&self, id: i64, state: ProjectState) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx
            .prepare_cached("UPDATE project SET state = ? WHERE id = ?")?
            .execute(params![state.as_i64(), id])?;
        if changed == 0 {
            return Ok(false);
        }
        let tile_ids: Vec<i64> = tx
            .prepare_cached("SELECT tile_id FROM tile_project WHERE project_id = ?")?
            .query_map([id], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        for tile_id in tile_ids {
            settle_tile_heat(&tx, tile_id)?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn register_tile_project(&self, tile: Tile, project_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        link_tile(&tx, tile, project_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn unregister_tile_project(&self, tile_id: i64, project_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.prepare_cached("DELETE FROM tile_project WHERE tile_id = ? AND project_id = ?")?
            .execute(params![tile_id, project_id])?;
        settle_tile_heat(&tx, tile_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Projects whose rectangle overlaps `tile_id`, excluding INACTIVE.
    pub fn lookup_overlapping_projects(&self, tile_id: i64) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM project p \
             JOIN tile_project tp ON tp.project_id = p.id \
             JOIN person per ON per.id = p.owner_id \
             WHERE tp.tile_id = ? AND p.state != ? \
             ORDER BY p.id",
            rows::PROJECT_COLUMNS
        ))?;
        let projects = stmt
            .query_map(
                params![tile_id, ProjectState::Inactive.as_i64()],
                rows::map_project,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    pub async fn lookup_overlapping_projects_async(&self, tile_id: i64) -> Result<Vec<Project>> {
        self.run_blocking(move |k| k.lookup_overlapping_projects(tile_id))
            .await
    }

    // ---- tiles ----

    pub fn get_tile(&self, id: i64) -> Result<Option<TileRecord>> {
        let conn = self.conn()?;
        let tile = conn
            .prepare_cached(
                "SELECT id, x, y, heat, last_checked, last_update, etag FROM tile WHERE id = ?",
            )?
            .query_row([id], rows::map_tile)
            .optional()?;
        Ok(tile)
    }

    pub fn upsert_tile(&self, rec: &TileRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "INSERT INTO tile(id, x, y, heat, last_checked, last_update, etag) \
             VALUES (?,?,?,?,?,?,?) \
             ON CONFLICT(id) DO UPDATE SET \
               heat = excluded.heat, last_checked = excluded.last_checked, \
               last_update = excluded.last_update, etag = excluded.etag",
        )?
        .execute(params![
            rec.id,
            rec.x,
            rec.y,
            rec.heat,
            rec.last_checked,
            rec.last_update,
            rec.etag,
        ])?;
        Ok(())
    }

    pub fn set_tile_heat(&self, id: i64, heat: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.prepare_cached("UPDATE tile SET heat = ? WHERE id = ?")?
            .execute(params![heat, id])?;
        Ok(())
    }

    /// 304 / failed-fetch path: only the check timestamp moves.
    pub fn mark_tile_checked(&self, id: i64, last_checked: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.prepare_cached("UPDATE tile SET last_checked = ? WHERE id = ?")?
            .execute(params![last_checked, id])?;
        Ok(())
    }

    /// Successful-fetch path: persist heat, validators, and check time.
    pub fn commit_tile_change(&self, rec: &TileRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "UPDATE tile SET heat = ?, last_checked = ?, last_update = ?, etag = ? WHERE id = ?",
        )?
        .execute(params![
            rec.heat,
            rec.last_checked,
            rec.last_update,
            rec.etag,
            rec.id
        ])?;
        Ok(())
    }

    pub async fn get_tile_async(&self, id: i64) -> Result<Option<TileRecord>> {
        self.run_blocking(move |k| k.get_tile(id)).await
    }

    pub async fn mark_tile_checked_async(&self, id: i64, last_checked: i64) -> Result<()> {
        self.run_blocking(move |k| k.mark_tile_checked(id, last_checked))
            .await
    }

    pub async fn commit_tile_change_async(&self, rec: TileRecord) -> Result<()> {
        self.run_blocking(move |k| k.commit_tile_change(&rec)).await
    }

    // ---- queue support ----

    /// Tiles eligible for temperature buckets (warm, fetched at least
    /// once), most recently updated first.
    pub fn tiles_for_redistribution(&self) -> Result<Vec<TileRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, x, y, heat, last_checked, last_update, etag FROM tile \
             WHERE heat > ? AND last_update > 0 \
             ORDER BY last_update DESC, id ASC",
        )?;
        let tiles = stmt
            .query_map([HEAT_INACTIVE], rows::map_tile)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tiles)
    }

    /// Write a batch of recomputed heats in one transaction.
    pub fn apply_heat_assignments(&self, assignments: &[(i64, i64)]) -> Result<()> {
        if assignments.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("UPDATE tile SET heat = ? WHERE id = ?")?;
            for &(tile_id, heat) in assignments {
                stmt.execute(params![heat, tile_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Least-recently-checked tile in a temperature bucket.
    pub fn coolest_tile_in_bucket(&self, heat: i64) -> Result<Option<TileRecord>> {
        let conn = self.conn()?;
        let tile = conn
            .prepare_cached(
                "SELECT id, x, y, heat, last_checked, last_update, etag FROM tile \
                 WHERE heat = ? ORDER BY last_checked ASC, id ASC LIMIT 1",
            )?
            .query_row([heat], rows::map_tile)
            .optional()?;
        Ok(tile)
    }

    /// Burning tile belonging to the oldest still-watched project.
    pub fn burning_tile_for_oldest_project(&self) -> Result<Option<TileRecord>> {
        let conn = self.conn()?;
        let tile = conn
            .prepare_cached(
                "SELECT t.id, t.x, t.y, t.heat, t.last_checked, t.last_update, t.etag \
                 FROM tile t \
                 JOIN tile_project tp ON tp.tile_id = t.id \
                 JOIN project p ON p.id = tp.project_id \
                 WHERE t.heat = ? AND p.state != ? \
                 ORDER BY p.first_seen ASC, t.id ASC LIMIT 1",
            )?
            .query_row(
                params![HEAT_BURNING, ProjectState::Inactive.as_i64()],
                rows::map_tile,
            )
            .optional()?;
        Ok(tile)
    }

    pub async fn tiles_for_redistribution_async(&self) -> Result<Vec<TileRecord>> {
        self.run_blocking(move |k| k.tiles_for_redistribution())
            .await
    }

    pub async fn apply_heat_assignments_async(&self, assignments: Vec<(i64, i64)>) -> Result<()> {
        self.run_blocking(move |k| k.apply_heat_assignments(&assignments))
            .await
    }

    pub async fn coolest_tile_in_bucket_async(&self, heat: i64) -> Result<Option<TileRecord>> {
        self.run_blocking(move |k| k.coolest_tile_in_bucket(heat))
            .await
    }

    pub async fn burning_tile_for_oldest_project_async(&self) -> Result<Option<TileRecord>> {
        self.run_blocking(move |k| k.burning_tile_for_oldest_project())
            .await
    }

    // ---- diffs ----

    /// Apply one diff's accumulative stats and append its history row,
    /// atomically.
    pub fn commit_diff(&self, project_id: i64, commit: &DiffCommit) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let streak = Streak::classify(commit.progress_pixels, commit.regress_pixels);
        tx.prepare_cached(
            "UPDATE project SET \
               total_progress = total_progress + ?1, \
               total_regress = total_regress + ?2, \
               max_completion_percent = MAX(max_completion_percent, ?3), \
               max_completion_pixels = CASE \
                 WHEN max_completion_time = 0 OR ?4 < max_completion_pixels THEN ?4 \
                 ELSE max_completion_pixels END, \
               max_completion_time = CASE \
                 WHEN max_completion_time = 0 OR ?4 < max_completion_pixels THEN ?5 \
                 ELSE max_completion_time END, \
               largest_regress_pixels = CASE \
                 WHEN ?2 > largest_regress_pixels THEN ?2 ELSE largest_regress_pixels END, \
               largest_regress_time = CASE \
                 WHEN ?2 > largest_regress_pixels THEN ?5 ELSE largest_regress_time END, \
               streak = ?6, \
               last_check = ?5, \
               last_snapshot = ?5, \
               last_log_message = ?7 \
             WHERE id = ?8",
        )?
        .execute(params![
            commit.progress_pixels,
            commit.regress_pixels,
            commit.completion_percent,
            commit.pixels_remaining,
            commit.timestamp,
            streak.as_i64(),
            commit.log_message,
            project_id,
        ])?;
        append_history_row(&tx, project_id, commit)?;
        tx.commit()?;
        Ok(())
    }

    /// Append a history row outside a diff commit (admin/backfill use).
    pub fn append_history(&self, project_id: i64, commit: &DiffCommit) -> Result<i64> {
        let conn = self.conn()?;
        append_history_row(&conn, project_id, commit)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn history_for_project(&self, project_id: i64, limit: i64) -> Result<Vec<HistoryChange>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, project_id, timestamp, status, pixels_remaining, pixels_target, \
                    completion_percent, progress_pixels, regress_pixels \
             FROM history_change WHERE project_id = ? \
             ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![project_id, limit], rows::map_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn commit_diff_async(&self, project_id: i64, commit: DiffCommit) -> Result<()> {
        self.run_blocking(move |k| k.commit_diff(project_id, &commit))
            .await
    }

    pub async fn get_project_async(&self, id: i64) -> Result<Option<Project>> {
        self.run_blocking(move |k| k.get_project(id)).await
    }
}

/// Ensure the tile row exists, link it to the project, and settle heat.
fn link_tile(conn: &Connection, tile: Tile, project_id: i64) -> Result<()> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO tile(id, x, y, heat, last_checked, last_update, etag) \
         VALUES (?,?,?,?,0,0,'')",
    )?
    .execute(params![tile.id(), tile.x, tile.y, HEAT_BURNING])?;
    conn.prepare_cached("INSERT OR IGNORE INTO tile_project(tile_id, project_id) VALUES (?,?)")?
        .execute(params![tile.id(), project_id])?;
    settle_tile_heat(conn, tile.id())?;
    Ok(())
}

/// Re-derive a tile's heat from its references: inactive when nothing
/// watches it, burning while never fetched, otherwise warm. Tiles
/// already sitting in a temperature bucket keep their slot; the next
/// redistribution pass settles exact bucket membership.
fn settle_tile_heat(conn: &Connection, tile_id: i64) -> Result<()> {
    let watchers: i64 = conn
        .prepare_cached(
            "SELECT COUNT(*) FROM tile_project tp \
             JOIN project p ON p.id = tp.project_id \
             WHERE tp.tile_id = ? AND p.state != ?",
        )?
        .query_row(params![tile_id, ProjectState::Inactive.as_i64()], |r| {
            r.get(0)
        })?;
    let (heat, last_checked): (i64, i64) = conn
        .prepare_cached("SELECT heat, last_checked FROM tile WHERE id = ?")?
        .query_row([tile_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
    let target = if watchers == 0 {
        HEAT_INACTIVE
    } else if last_checked == 0 {
        HEAT_BURNING
    } else if heat == HEAT_INACTIVE || heat == HEAT_BURNING {
        1
    } else {
        heat
    };
    if target != heat {
        conn.prepare_cached("UPDATE tile SET heat = ? WHERE id = ?")?
            .execute(params![target, tile_id])?;
    }
    Ok(())
}

fn append_history_row(conn: &Connection, project_id: i64, commit: &DiffCommit) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO history_change(project_id, timestamp, status, pixels_remaining, \
           pixels_target, completion_percent, progress_pixels, regress_pixels) \
         VALUES (?,?,?,?,?,?,?,?)",
    )?
    .execute(params![
        project_id,
        commit.timestamp,
        commit.status.as_i64(),
        commit.pixels_remaining,
        commit.pixels_target,
        commit.completion_percent,
        commit.progress_pixels,
        commit.regress_pixels,
    ])?;
    Ok(())
}

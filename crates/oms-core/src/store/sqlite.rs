//! SQLite-backed inventory

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use super::{glob_to_like, Inventory, StoreResult};
use crate::error::StoreError;
use crate::models::{
    CommandHistory, Group, GroupMode, Host, InstanceStatus, Job, JobStatus, NewHost, NewJob,
    NewTunnel, Page, PageData, PlayBook, Preload, PrivateKey, QuicklyCommand, Tag, TaskInstance,
    Tunnel,
};

const SCHEMA: &str = include_str!("schema.sql");

const HOST_COLUMNS: &str =
    "id, name, user, addr, port, password, private_key_id, legacy_key_file, group_id, status";
const TUNNEL_COLUMNS: &str = "id, mode, source, destination, status, error_msg, host_id";
const JOB_COLUMNS: &str = "id, name, type, spec, cmd, cmd_type, cmd_id, sudo, status, host_id";

/// Single-connection SQLite store.
///
/// Every statement runs under one mutex, which also serializes the status
/// writes coming from the scheduler, tunnel sweep and liveness checks.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    /// Fresh in-memory database
    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        add_missing_columns(&conn)?;
        tracing::debug!("inventory schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn host_rows(&self, sql: &str, param: &dyn rusqlite::ToSql) -> StoreResult<Vec<Host>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([param], host_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn load_relations(&self, conn: &Connection, host: &mut Host, preload: Preload) -> StoreResult<()> {
        if preload.tags {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.name FROM tag t JOIN host_tag ht ON ht.tag_id = t.id
                 WHERE ht.host_id = ?1 ORDER BY t.id",
            )?;
            host.tags = stmt
                .query_map([host.id], tag_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
        }
        if preload.group {
            if let Some(gid) = host.group_id {
                host.group = conn
                    .query_row(
                        "SELECT id, name, mode, params FROM host_group WHERE id = ?1",
                        [gid],
                        group_from_row,
                    )
                    .optional()?;
            }
        }
        if preload.tunnels {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TUNNEL_COLUMNS} FROM tunnel WHERE host_id = ?1 ORDER BY id"
            ))?;
            host.tunnels = stmt
                .query_map([host.id], tunnel_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
        }
        if preload.jobs {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM job WHERE host_id = ?1 ORDER BY id"
            ))?;
            host.jobs = stmt
                .query_map([host.id], job_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
        }
        Ok(())
    }

    fn write_host_tags(conn: &Connection, host_id: i64, tag_ids: &[i64]) -> StoreResult<()> {
        conn.execute("DELETE FROM host_tag WHERE host_id = ?1", [host_id])?;
        for tag_id in tag_ids {
            conn.execute(
                "INSERT OR IGNORE INTO host_tag (host_id, tag_id) VALUES (?1, ?2)",
                params![host_id, tag_id],
            )?;
        }
        Ok(())
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

/// Fixed-width UTC text so `start_time` compares lexicographically
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    let port: i64 = row.get(4)?;
    Ok(Host {
        id: row.get(0)?,
        name: row.get(1)?,
        user: row.get(2)?,
        addr: row.get(3)?,
        port: u16::try_from(port).unwrap_or(22),
        password: row.get(5)?,
        private_key_id: row.get(6)?,
        legacy_key_file: row.get(7)?,
        group_id: row.get(8)?,
        status: row.get(9)?,
        ..Default::default()
    })
}

fn tag_from_row(row: &Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
    })
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    let mode: u8 = row.get(2)?;
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        mode: GroupMode::try_from(mode).map_err(|e| conversion_error(2, e))?,
        params: row.get(3)?,
    })
}

fn tunnel_from_row(row: &Row<'_>) -> rusqlite::Result<Tunnel> {
    Ok(Tunnel {
        id: row.get(0)?,
        mode: parse_column(row, 1)?,
        source: row.get(2)?,
        destination: row.get(3)?,
        status: row.get(4)?,
        error_msg: row.get(5)?,
        host_id: row.get(6)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        job_type: parse_column(row, 2)?,
        spec: row.get(3)?,
        cmd: row.get(4)?,
        cmd_type: parse_column(row, 5)?,
        cmd_id: row.get(6)?,
        sudo: row.get(7)?,
        status: parse_column(row, 8)?,
        host_id: row.get(9)?,
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<TaskInstance> {
    let start = time_column(row, 2)?.ok_or(rusqlite::Error::InvalidColumnType(
        2,
        "start_time".to_string(),
        Type::Null,
    ))?;
    Ok(TaskInstance {
        id: row.get(0)?,
        job_id: row.get(1)?,
        start_time: start,
        end_time: time_column(row, 3)?,
        status: parse_column(row, 4)?,
    })
}

fn playbook_from_row(row: &Row<'_>) -> rusqlite::Result<PlayBook> {
    Ok(PlayBook {
        id: row.get(0)?,
        name: row.get(1)?,
        steps: row.get(2)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<CommandHistory> {
    Ok(CommandHistory {
        id: row.get(0)?,
        cmd: row.get(1)?,
        times: row.get(2)?,
    })
}

/// Turn unique-constraint failures into `Conflict`
fn map_conflict(err: rusqlite::Error, what: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict(format!("{what} already exists"))
        }
        _ => StoreError::Sqlite(err),
    }
}

fn require_changed(changed: usize, entity: &'static str, id: i64) -> StoreResult<()> {
    if changed == 0 {
        Err(StoreError::not_found(entity, id))
    } else {
        Ok(())
    }
}

/// Columns added after a table was first shipped
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[("job", "sudo", "INTEGER NOT NULL DEFAULT 0")];

fn add_missing_columns(conn: &Connection) -> rusqlite::Result<()> {
    for &(table, column, decl) in ADDED_COLUMNS {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let present = names.collect::<Result<Vec<_>, _>>()?.iter().any(|n| n == column);
        if !present {
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
            tracing::info!(table, column, "added inventory column");
        }
    }
    Ok(())
}

fn not_found_or(err: rusqlite::Error, entity: &'static str, id: i64) -> StoreError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => StoreError::not_found(entity, id),
        other => StoreError::Sqlite(other),
    }
}

impl Inventory for SqliteStore {
    fn get_host(&self, id: i64, preload: Preload) -> StoreResult<Host> {
        let conn = self.conn.lock();
        let mut host = conn
            .query_row(
                &format!("SELECT {HOST_COLUMNS} FROM host WHERE id = ?1"),
                [id],
                host_from_row,
            )
            .map_err(|e| not_found_or(e, "host", id))?;
        self.load_relations(&conn, &mut host, preload)?;
        Ok(host)
    }

    fn list_hosts(&self, preload: Preload) -> StoreResult<Vec<Host>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {HOST_COLUMNS} FROM host ORDER BY id"))?;
        let mut hosts = stmt
            .query_map([], host_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        for host in &mut hosts {
            self.load_relations(&conn, host, preload)?;
        }
        Ok(hosts)
    }

    fn page_hosts(&self, page: Page) -> StoreResult<PageData<Host>> {
        let page = page.normalized();
        let conn = self.conn.lock();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM host", [], |r| r.get(0))?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HOST_COLUMNS} FROM host ORDER BY id LIMIT ?1 OFFSET ?2"
        ))?;
        let mut data = stmt
            .query_map(params![page.limit(), page.offset()], host_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        for host in &mut data {
            self.load_relations(&conn, host, Preload { tags: true, group: true, ..Preload::NONE })?;
        }
        Ok(PageData {
            data,
            total,
            page_num: page.page_num,
        })
    }

    fn insert_host(&self, host: &NewHost) -> StoreResult<Host> {
        let port = host.validate()?;
        let id = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO host (name, user, addr, port, password, private_key_id, legacy_key_file, group_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    host.name,
                    host.user,
                    host.addr,
                    port,
                    host.password,
                    host.private_key_id,
                    host.legacy_key_file,
                    host.group_id
                ],
            )?;
            let id = tx.last_insert_rowid();
            Self::write_host_tags(&tx, id, &host.tag_ids)?;
            tx.commit()?;
            id
        };
        self.get_host(id, Preload { tags: true, ..Preload::NONE })
    }

    fn update_host(&self, id: i64, host: &NewHost) -> StoreResult<Host> {
        let port = host.validate()?;
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE host SET name = ?1, user = ?2, addr = ?3, port = ?4, password = ?5,
                 private_key_id = ?6, legacy_key_file = ?7, group_id = ?8 WHERE id = ?9",
                params![
                    host.name,
                    host.user,
                    host.addr,
                    port,
                    host.password,
                    host.private_key_id,
                    host.legacy_key_file,
                    host.group_id,
                    id
                ],
            )?;
            require_changed(changed, "host", id)?;
            Self::write_host_tags(&tx, id, &host.tag_ids)?;
            tx.commit()?;
        }
        self.get_host(id, Preload { tags: true, ..Preload::NONE })
    }

    fn delete_host(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM host WHERE id = ?1", [id])?;
        require_changed(changed, "host", id)
    }

    fn update_host_status(&self, id: i64, status: bool) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let current: bool = conn
            .query_row("SELECT status FROM host WHERE id = ?1", [id], |r| r.get(0))
            .map_err(|e| not_found_or(e, "host", id))?;
        if current == status {
            return Ok(false);
        }
        conn.execute(
            "UPDATE host SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(true)
    }

    fn hosts_by_tag(&self, tag_id: i64) -> StoreResult<Vec<Host>> {
        self.host_rows(
            "SELECT h.id, h.name, h.user, h.addr, h.port, h.password, h.private_key_id,
                    h.legacy_key_file, h.group_id, h.status
             FROM host h JOIN host_tag ht ON ht.host_id = h.id
             WHERE ht.tag_id = ?1 ORDER BY h.id",
            &tag_id,
        )
    }

    fn hosts_by_group(&self, group_id: i64) -> StoreResult<Vec<Host>> {
        self.host_rows(
            &format!("SELECT {HOST_COLUMNS} FROM host WHERE group_id = ?1 ORDER BY id"),
            &group_id,
        )
    }

    fn hosts_by_glob(&self, pattern: &str) -> StoreResult<Vec<Host>> {
        let like = glob_to_like(pattern);
        self.host_rows(
            &format!("SELECT {HOST_COLUMNS} FROM host WHERE addr LIKE ?1 ORDER BY id"),
            &like,
        )
    }

    fn hosts_by_regex(&self, pattern: &str) -> StoreResult<Vec<Host>> {
        let re = Regex::new(pattern)?;
        Ok(self
            .list_hosts(Preload::NONE)?
            .into_iter()
            .filter(|h| re.is_match(&h.addr))
            .collect())
    }

    fn hosts_by_addr(&self, addr: &str) -> StoreResult<Vec<Host>> {
        self.host_rows(
            &format!("SELECT {HOST_COLUMNS} FROM host WHERE addr = ?1 ORDER BY id"),
            &addr,
        )
    }

    fn get_tag(&self, id: i64) -> StoreResult<Tag> {
        let conn = self.conn.lock();
        conn.query_row("SELECT id, name FROM tag WHERE id = ?1", [id], tag_from_row)
            .map_err(|e| not_found_or(e, "tag", id))
    }

    fn list_tags(&self) -> StoreResult<Vec<Tag>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name FROM tag ORDER BY id")?;
        let rows = stmt.query_map([], tag_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_tag(&self, name: &str) -> StoreResult<Tag> {
        let conn = self.conn.lock();
        conn.execute("INSERT INTO tag (name) VALUES (?1)", [name])
            .map_err(|e| map_conflict(e, "tag"))?;
        Ok(Tag {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    fn delete_tag(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM tag WHERE id = ?1", [id])?;
        require_changed(changed, "tag", id)
    }

    fn get_group(&self, id: i64) -> StoreResult<Group> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, mode, params FROM host_group WHERE id = ?1",
            [id],
            group_from_row,
        )
        .map_err(|e| not_found_or(e, "group", id))
    }

    fn list_groups(&self) -> StoreResult<Vec<Group>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, mode, params FROM host_group ORDER BY id")?;
        let rows = stmt.query_map([], group_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_group(&self, name: &str, mode: GroupMode, params: &str) -> StoreResult<Group> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO host_group (name, mode, params) VALUES (?1, ?2, ?3)",
            params![name, u8::from(mode), params],
        )?;
        Ok(Group {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            mode,
            params: params.to_string(),
        })
    }

    fn delete_group(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM host_group WHERE id = ?1", [id])?;
        require_changed(changed, "group", id)
    }

    fn get_private_key(&self, id: i64) -> StoreResult<PrivateKey> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, key_file, passphrase FROM private_key WHERE id = ?1",
            [id],
            |r| {
                Ok(PrivateKey {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    key_file: r.get(2)?,
                    passphrase: r.get(3)?,
                })
            },
        )
        .map_err(|e| not_found_or(e, "private key", id))
    }

    fn list_private_keys(&self) -> StoreResult<Vec<PrivateKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name FROM private_key ORDER BY id")?;
        let rows = stmt.query_map([], |r| {
            Ok(PrivateKey {
                id: r.get(0)?,
                name: r.get(1)?,
                ..Default::default()
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_private_key(
        &self,
        name: &str,
        key_file: &str,
        passphrase: &str,
    ) -> StoreResult<PrivateKey> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO private_key (name, key_file, passphrase) VALUES (?1, ?2, ?3)",
            params![name, key_file, passphrase],
        )?;
        Ok(PrivateKey {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            key_file: key_file.to_string(),
            passphrase: passphrase.to_string(),
        })
    }

    fn delete_private_key(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM private_key WHERE id = ?1", [id])?;
        require_changed(changed, "private key", id)
    }

    fn get_tunnel(&self, id: i64) -> StoreResult<Tunnel> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {TUNNEL_COLUMNS} FROM tunnel WHERE id = ?1"),
            [id],
            tunnel_from_row,
        )
        .map_err(|e| not_found_or(e, "tunnel", id))
    }

    fn list_tunnels(&self) -> StoreResult<Vec<Tunnel>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {TUNNEL_COLUMNS} FROM tunnel ORDER BY id"))?;
        let rows = stmt.query_map([], tunnel_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_tunnel(&self, tunnel: &NewTunnel) -> StoreResult<Tunnel> {
        tunnel.validate()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tunnel (mode, source, destination, host_id) VALUES (?1, ?2, ?3, ?4)",
            params![
                tunnel.mode.as_str(),
                tunnel.source,
                tunnel.destination,
                tunnel.host_id
            ],
        )?;
        Ok(Tunnel {
            id: conn.last_insert_rowid(),
            mode: tunnel.mode,
            source: tunnel.source.clone(),
            destination: tunnel.destination.clone(),
            status: false,
            error_msg: String::new(),
            host_id: tunnel.host_id,
        })
    }

    fn delete_tunnel(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM tunnel WHERE id = ?1", [id])?;
        require_changed(changed, "tunnel", id)
    }

    fn update_tunnel_status(&self, id: i64, status: bool, error_msg: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tunnel SET status = ?1, error_msg = ?2 WHERE id = ?3",
            params![status, error_msg, id],
        )?;
        require_changed(changed, "tunnel", id)
    }

    fn get_job(&self, id: i64) -> StoreResult<Job> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM job WHERE id = ?1"),
            [id],
            job_from_row,
        )
        .map_err(|e| not_found_or(e, "job", id))
    }

    fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM job ORDER BY id"))?;
        let rows = stmt.query_map([], job_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_job(&self, job: &NewJob) -> StoreResult<Job> {
        job.validate()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO job (name, type, spec, cmd, cmd_type, cmd_id, sudo, status, host_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                job.name,
                job.job_type.as_str(),
                job.spec,
                job.cmd,
                job.cmd_type.as_str(),
                job.cmd_id,
                job.sudo,
                JobStatus::Ready.as_str(),
                job.host_id
            ],
        )?;
        Ok(Job {
            id: conn.last_insert_rowid(),
            name: job.name.clone(),
            job_type: job.job_type,
            spec: job.spec.clone(),
            cmd: job.cmd.clone(),
            cmd_type: job.cmd_type,
            cmd_id: job.cmd_id,
            sudo: job.sudo,
            status: JobStatus::Ready,
            host_id: job.host_id,
        })
    }

    fn update_job(&self, id: i64, job: &NewJob) -> StoreResult<Job> {
        job.validate()?;
        {
            let conn = self.conn.lock();
            let changed = conn.execute(
                "UPDATE job SET name = ?1, type = ?2, spec = ?3, cmd = ?4, cmd_type = ?5,
                 cmd_id = ?6, sudo = ?7, host_id = ?8 WHERE id = ?9",
                params![
                    job.name,
                    job.job_type.as_str(),
                    job.spec,
                    job.cmd,
                    job.cmd_type.as_str(),
                    job.cmd_id,
                    job.sudo,
                    job.host_id,
                    id
                ],
            )?;
            require_changed(changed, "job", id)?;
        }
        self.get_job(id)
    }

    fn delete_job(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM job WHERE id = ?1", [id])?;
        require_changed(changed, "job", id)
    }

    fn update_job_status(&self, id: i64, status: JobStatus) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE job SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        require_changed(changed, "job", id)
    }

    fn update_job_status_unless_stopped(&self, id: i64, status: JobStatus) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE job SET status = ?1 WHERE id = ?2 AND status != ?3",
            params![status.as_str(), id, JobStatus::Stop.as_str()],
        )?;
        if changed == 0 {
            // distinguish a stopped job from a missing one
            conn.query_row("SELECT 1 FROM job WHERE id = ?1", [id], |_| Ok(()))
                .map_err(|e| not_found_or(e, "job", id))?;
        }
        Ok(changed > 0)
    }

    fn insert_instance(&self, job_id: i64, start: DateTime<Utc>) -> StoreResult<TaskInstance> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO task_instance (job_id, start_time, status) VALUES (?1, ?2, ?3)",
            params![job_id, timestamp(start), InstanceStatus::Running.as_str()],
        )?;
        Ok(TaskInstance {
            id: conn.last_insert_rowid(),
            job_id,
            start_time: start,
            end_time: None,
            status: InstanceStatus::Running,
        })
    }

    fn finish_instance(&self, id: i64, status: InstanceStatus) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE task_instance SET status = ?1, end_time = ?2 WHERE id = ?3",
            params![status.as_str(), timestamp(Utc::now()), id],
        )?;
        require_changed(changed, "task instance", id)
    }

    fn list_instances(
        &self,
        job_id: Option<i64>,
        page: Page,
    ) -> StoreResult<PageData<TaskInstance>> {
        let page = page.normalized();
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM task_instance WHERE ?1 IS NULL OR job_id = ?1",
            [job_id],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, start_time, end_time, status FROM task_instance
             WHERE ?1 IS NULL OR job_id = ?1
             ORDER BY start_time DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let data = stmt
            .query_map(params![job_id, page.limit(), page.offset()], instance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PageData {
            data,
            total,
            page_num: page.page_num,
        })
    }

    fn clear_instances(&self, before: DateTime<Utc>, job_id: Option<i64>) -> StoreResult<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM task_instance WHERE start_time < ?1 AND (?2 IS NULL OR job_id = ?2)",
            params![timestamp(before), job_id],
        )?)
    }

    fn get_playbook(&self, id: i64) -> StoreResult<PlayBook> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, steps FROM playbook WHERE id = ?1",
            [id],
            playbook_from_row,
        )
        .map_err(|e| not_found_or(e, "playbook", id))
    }

    fn list_playbooks(&self) -> StoreResult<Vec<PlayBook>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, steps FROM playbook ORDER BY id")?;
        let rows = stmt.query_map([], playbook_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_playbook(&self, name: &str, steps: &str) -> StoreResult<PlayBook> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO playbook (name, steps) VALUES (?1, ?2)",
            params![name, steps],
        )?;
        Ok(PlayBook {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            steps: steps.to_string(),
        })
    }

    fn update_playbook(&self, id: i64, name: &str, steps: &str) -> StoreResult<PlayBook> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE playbook SET name = ?1, steps = ?2 WHERE id = ?3",
            params![name, steps, id],
        )?;
        require_changed(changed, "playbook", id)?;
        Ok(PlayBook {
            id,
            name: name.to_string(),
            steps: steps.to_string(),
        })
    }

    fn delete_playbook(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM playbook WHERE id = ?1", [id])?;
        require_changed(changed, "playbook", id)
    }

    fn list_quickly_commands(&self) -> StoreResult<Vec<QuicklyCommand>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, cmd FROM quickly_command ORDER BY id")?;
        let rows = stmt.query_map([], |r| {
            Ok(QuicklyCommand {
                id: r.get(0)?,
                name: r.get(1)?,
                cmd: r.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_quickly_command(&self, name: &str, cmd: &str) -> StoreResult<QuicklyCommand> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO quickly_command (name, cmd) VALUES (?1, ?2)",
            params![name, cmd],
        )
        .map_err(|e| map_conflict(e, "quickly command"))?;
        Ok(QuicklyCommand {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            cmd: cmd.to_string(),
        })
    }

    fn delete_quickly_command(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM quickly_command WHERE id = ?1", [id])?;
        require_changed(changed, "quickly command", id)
    }

    fn insert_or_update_command_history(&self, cmd: &str) -> StoreResult<CommandHistory> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing = tx
            .query_row(
                "SELECT id, cmd, times FROM command_history WHERE cmd = ?1",
                [cmd],
                history_from_row,
            )
            .optional()?;
        let record = match existing {
            Some(mut record) => {
                record.times += 1;
                tx.execute(
                    "UPDATE command_history SET times = ?1 WHERE id = ?2",
                    params![record.times, record.id],
                )?;
                record
            }
            None => {
                tx.execute(
                    "INSERT INTO command_history (cmd, times) VALUES (?1, 1)",
                    [cmd],
                )?;
                CommandHistory {
                    id: tx.last_insert_rowid(),
                    cmd: cmd.to_string(),
                    times: 1,
                }
            }
        };
        tx.commit()?;
        Ok(record)
    }

    fn search_command_history(
        &self,
        keyword: &str,
        limit: u32,
    ) -> StoreResult<Vec<CommandHistory>> {
        let limit = if limit == 0 { 10 } else { limit };
        let keyword = keyword.trim_end();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, cmd, times FROM command_history WHERE cmd LIKE ?1
             ORDER BY times DESC, id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![format!("{keyword}%"), limit], history_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn delete_command_history(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM command_history WHERE id = ?1", [id])?;
        require_changed(changed, "command history", id)
    }
}

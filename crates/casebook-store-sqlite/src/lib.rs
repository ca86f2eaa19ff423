use std::path::Path;

use anyhow::{anyhow, Context, Result};
use casebook_core::{
    Client, ClientId, Cursor, ProgressRecord, RecordStore, ScannedVisit, StoreError, Visit,
    VisitId, VisitPage,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// `visits.retired` is deliberately nullable: rows written before the column
// existed carry NULL, which the query layer cannot filter on. The backfill
// pipeline is what drives every NULL to an explicit 0.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS clients (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  address TEXT,
  phone TEXT
);

CREATE TABLE IF NOT EXISTS visits (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  client_id INTEGER NOT NULL,
  visited_on TEXT NOT NULL,
  assistance TEXT NOT NULL,
  note TEXT,
  retired INTEGER CHECK (retired IN (0, 1)),
  FOREIGN KEY (client_id) REFERENCES clients(id)
);

CREATE TABLE IF NOT EXISTS conference_users (
  email TEXT PRIMARY KEY,
  admin INTEGER NOT NULL DEFAULT 0 CHECK (admin IN (0, 1))
);

CREATE TABLE IF NOT EXISTS backfill_progress (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  cursor_after_chunk TEXT NOT NULL,
  processed_count INTEGER NOT NULL CHECK (processed_count >= 1),
  completed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_visits_client ON visits(client_id);
";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a SQLite-backed casework store and configure required runtime
    /// pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(());
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Report the currently applied schema version (0 when uninitialized).
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        current_schema_version(&self.conn)
    }

    /// Persist one client intake record.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn add_client(&mut self, client: &Client) -> Result<ClientId> {
        self.conn
            .execute(
                "INSERT INTO clients(first_name, last_name, address, phone)
                 VALUES (?1, ?2, ?3, ?4)",
                params![client.first_name, client.last_name, client.address, client.phone],
            )
            .context("failed to insert client")?;
        Ok(ClientId(self.conn.last_insert_rowid()))
    }

    /// Look up one client by store-assigned id.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_client(&self, id: ClientId) -> Result<Option<Client>> {
        let mut stmt = self.conn.prepare(
            "SELECT first_name, last_name, address, phone FROM clients WHERE id = ?1",
        )?;
        let client = stmt
            .query_row(params![id.0], |row| {
                Ok(Client {
                    first_name: row.get(0)?,
                    last_name: row.get(1)?,
                    address: row.get(2)?,
                    phone: row.get(3)?,
                })
            })
            .optional()?;
        Ok(client)
    }

    /// Overwrite one client's intake fields. Returns `false` when no client
    /// carries the id.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn update_client(&mut self, id: ClientId, client: &Client) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE clients SET first_name = ?1, last_name = ?2, address = ?3, phone = ?4
                 WHERE id = ?5",
                params![client.first_name, client.last_name, client.address, client.phone, id.0],
            )
            .context("failed to update client")?;
        Ok(changed > 0)
    }

    /// List every client on file, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_clients(&self) -> Result<Vec<(ClientId, Client)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, first_name, last_name, address, phone FROM clients ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                ClientId(row.get(0)?),
                Client {
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    address: row.get(3)?,
                    phone: row.get(4)?,
                },
            ))
        })?;

        let mut clients = Vec::new();
        for row in rows {
            clients.push(row?);
        }
        Ok(clients)
    }

    /// Persist one visit with an explicit `retired` value (new visits never
    /// leave the attribute absent).
    ///
    /// # Errors
    /// Returns an error when the client does not exist or the insert fails.
    pub fn add_visit(&mut self, visit: &Visit) -> Result<VisitId> {
        self.conn
            .execute(
                "INSERT INTO visits(client_id, visited_on, assistance, note, retired)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    visit.client_id.0,
                    visit.visited_on,
                    visit.assistance,
                    visit.note,
                    i64::from(visit.retired.unwrap_or(false)),
                ],
            )
            .context("failed to insert visit")?;
        Ok(VisitId(self.conn.last_insert_rowid()))
    }

    /// Persist one visit the way rows looked before the `retired` attribute
    /// existed: the column is left NULL. Used to seed data the backfill
    /// pipeline has to repair.
    ///
    /// # Errors
    /// Returns an error when the client does not exist or the insert fails.
    pub fn add_legacy_visit(&mut self, visit: &Visit) -> Result<VisitId> {
        self.conn
            .execute(
                "INSERT INTO visits(client_id, visited_on, assistance, note, retired)
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                params![visit.client_id.0, visit.visited_on, visit.assistance, visit.note],
            )
            .context("failed to insert legacy visit")?;
        Ok(VisitId(self.conn.last_insert_rowid()))
    }

    /// List all visits logged against one client, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_visits(&self, client_id: ClientId) -> Result<Vec<(VisitId, Visit)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client_id, visited_on, assistance, note, retired
             FROM visits WHERE client_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![client_id.0], |row| {
            Ok((
                VisitId(row.get(0)?),
                Visit {
                    client_id: ClientId(row.get(1)?),
                    visited_on: row.get(2)?,
                    assistance: row.get(3)?,
                    note: row.get(4)?,
                    retired: row.get::<_, Option<i64>>(5)?.map(|value| value != 0),
                },
            ))
        })?;

        let mut visits = Vec::new();
        for row in rows {
            visits.push(row?);
        }
        Ok(visits)
    }

    /// Count visits still missing an explicit `retired` value. Zero after a
    /// completed backfill chain.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_visits_missing_retired(&self) -> Result<u64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM visits WHERE retired IS NULL", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to count unmigrated visits")?;
        Ok(count.unsigned_abs())
    }

    /// Register one authorized conference user.
    ///
    /// # Errors
    /// Returns an error when the email is empty or the upsert fails.
    pub fn add_user(&mut self, email: &str, admin: bool) -> Result<()> {
        if email.trim().is_empty() {
            return Err(anyhow!("email MUST be provided for every user"));
        }

        self.conn
            .execute(
                "INSERT INTO conference_users(email, admin) VALUES (?1, ?2)
                 ON CONFLICT(email) DO UPDATE SET admin = excluded.admin",
                params![email, i64::from(admin)],
            )
            .context("failed to upsert conference user")?;
        Ok(())
    }

    /// Whether any conference user is registered at all.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn has_users(&self) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conference_users)",
            [],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    /// Whether the email belongs to any registered conference user.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn is_authorized(&self, email: &str) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conference_users WHERE email = ?1)",
            params![email],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    /// Whether the email belongs to a registered admin.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn is_admin(&self, email: &str) -> Result<bool> {
        let admin = self
            .conn
            .query_row(
                "SELECT admin FROM conference_users WHERE email = ?1",
                params![email],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(admin == Some(1))
    }

    /// Load the append-only backfill progress log, oldest chunk first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_progress(&self) -> Result<Vec<ProgressRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT cursor_after_chunk, processed_count, completed_at
             FROM backfill_progress ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next()? {
            let cursor_raw: String = row.get(0)?;
            let processed: i64 = row.get(1)?;
            let completed_raw: String = row.get(2)?;

            let cursor_after_chunk = Cursor::decode(&cursor_raw)
                .map_err(|err| anyhow!("stored progress cursor is invalid: {err}"))?;
            entries.push(ProgressRecord {
                cursor_after_chunk,
                processed_count: processed.unsigned_abs(),
                completed_at: parse_rfc3339(&completed_raw)?,
            });
        }

        Ok(entries)
    }

    fn scan_visits_page(&self, start: Cursor, limit: usize) -> Result<VisitPage> {
        let after = i64::try_from(start.position())
            .map_err(|_| anyhow!("cursor position {} exceeds store key range", start.position()))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut stmt = self.conn.prepare(
            "SELECT id, retired FROM visits WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit], |row| {
            Ok(ScannedVisit {
                id: VisitId(row.get(0)?),
                retired: row.get::<_, Option<i64>>(1)?.map(|value| value != 0),
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }

        let cursor_after = records
            .last()
            .map_or(start, |record| Cursor::from_position(record.id.0.unsigned_abs()));

        Ok(VisitPage { records, cursor_after })
    }
}

impl RecordStore for SqliteStore {
    fn scan_visits(&mut self, start: Cursor, limit: usize) -> Result<VisitPage, StoreError> {
        self.scan_visits_page(start, limit).map_err(|err| StoreError(err.to_string()))
    }

    // COALESCE keeps an explicit 1 intact while defaulting NULL to 0; the
    // statement is a no-op on an already-migrated row, which is what makes
    // duplicate work-item delivery harmless.
    fn write_retired_default(&mut self, id: VisitId) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE visits SET retired = COALESCE(retired, 0) WHERE id = ?1",
                params![id.0],
            )
            .map_err(|err| StoreError(format!("failed to rewrite visit {id}: {err}")))?;
        Ok(())
    }

    fn append_progress(&mut self, entry: &ProgressRecord) -> Result<(), StoreError> {
        let completed_at = rfc3339(entry.completed_at)
            .map_err(|err| StoreError(format!("failed to format progress timestamp: {err}")))?;
        let processed = i64::try_from(entry.processed_count)
            .map_err(|_| StoreError("processed_count exceeds store range".to_string()))?;

        self.conn
            .execute(
                "INSERT INTO backfill_progress(cursor_after_chunk, processed_count, completed_at)
                 VALUES (?1, ?2, ?3)",
                params![entry.cursor_after_chunk.encode(), processed, completed_at],
            )
            .map_err(|err| StoreError(format!("failed to append progress record: {err}")))?;
        Ok(())
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

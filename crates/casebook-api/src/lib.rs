use std::path::PathBuf;

use casebook_core::{
    process_chunk, start_backfill, summarize_progress, ChunkReport, Client, ClientId, Cursor,
    PipelineError, ProgressRecord, ProgressSummary, Visit, VisitId, WorkScheduler,
};
use casebook_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Permanent failures must not be redelivered by the work scheduler;
    /// everything else is worth retrying.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Forbidden(_)
                | Self::Pipeline(
                    PipelineError::MalformedCursor(_) | PipelineError::InvalidChunkSize
                )
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AddClientRequest {
    pub first_name: String,
    pub last_name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClientRecord {
    pub id: ClientId,
    pub client: Client,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AddVisitRequest {
    pub client_id: ClientId,
    pub visited_on: String,
    pub assistance: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VisitRecord {
    pub id: VisitId,
    pub visit: Visit,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StartMigrationResult {
    pub actor: String,
    pub scheduled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProgressReport {
    pub summary: ProgressSummary,
    pub remaining_unmigrated: u64,
    pub entries: Vec<ProgressRecord>,
}

/// Operation layer over one casework database. Every call opens the store
/// fresh and migrates it forward, so callers never hold a connection.
#[derive(Debug, Clone)]
pub struct CaseworkApi {
    db_path: PathBuf,
}

impl CaseworkApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, ApiError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn require_authorized(store: &SqliteStore, actor: &str) -> Result<(), ApiError> {
        if store.is_authorized(actor)? {
            return Ok(());
        }
        Err(ApiError::Forbidden(format!("{actor} is not a registered conference user")))
    }

    /// Register one conference user. Any caller may create the first user
    /// (bootstrap); after that only admins may add or update users.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for non-admin callers, or an internal
    /// error when persistence fails.
    pub fn add_user(&self, actor: &str, email: &str, admin: bool) -> Result<(), ApiError> {
        let mut store = self.open_store()?;
        if store.has_users()? && !store.is_admin(actor)? {
            return Err(ApiError::Forbidden(format!("{actor} must be an admin to add users")));
        }

        store.add_user(email, admin)?;
        Ok(())
    }

    /// Persist one client intake record.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for unregistered actors, or an
    /// internal error when persistence fails.
    pub fn add_client(&self, actor: &str, input: AddClientRequest) -> Result<ClientRecord, ApiError> {
        let mut store = self.open_store()?;
        Self::require_authorized(&store, actor)?;

        let client = Client {
            first_name: input.first_name,
            last_name: input.last_name,
            address: input.address,
            phone: input.phone,
        };
        let id = store.add_client(&client)?;
        Ok(ClientRecord { id, client })
    }

    /// Look up one client.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for unregistered actors, or an
    /// internal error when the lookup fails.
    pub fn get_client(&self, actor: &str, id: ClientId) -> Result<Option<ClientRecord>, ApiError> {
        let store = self.open_store()?;
        Self::require_authorized(&store, actor)?;
        Ok(store.get_client(id)?.map(|client| ClientRecord { id, client }))
    }

    /// Overwrite one client's intake fields. `Ok(None)` means no client
    /// carries the id.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for unregistered actors, or an
    /// internal error when persistence fails.
    pub fn edit_client(
        &self,
        actor: &str,
        id: ClientId,
        input: AddClientRequest,
    ) -> Result<Option<ClientRecord>, ApiError> {
        let mut store = self.open_store()?;
        Self::require_authorized(&store, actor)?;

        let client = Client {
            first_name: input.first_name,
            last_name: input.last_name,
            address: input.address,
            phone: input.phone,
        };
        if store.update_client(id, &client)? {
            Ok(Some(ClientRecord { id, client }))
        } else {
            Ok(None)
        }
    }

    /// List every client on file.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for unregistered actors, or an
    /// internal error when the read fails.
    pub fn list_clients(&self, actor: &str) -> Result<Vec<ClientRecord>, ApiError> {
        let store = self.open_store()?;
        Self::require_authorized(&store, actor)?;
        let clients = store
            .list_clients()?
            .into_iter()
            .map(|(id, client)| ClientRecord { id, client })
            .collect();
        Ok(clients)
    }

    /// Log one visit against a client. New visits always carry an explicit
    /// `retired = false`; only rows that predate the attribute lack it.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for unregistered actors, or an
    /// internal error when persistence fails.
    pub fn add_visit(&self, actor: &str, input: AddVisitRequest) -> Result<VisitRecord, ApiError> {
        let mut store = self.open_store()?;
        Self::require_authorized(&store, actor)?;

        let visit = Visit {
            client_id: input.client_id,
            visited_on: input.visited_on,
            assistance: input.assistance,
            note: input.note,
            retired: Some(false),
        };
        let id = store.add_visit(&visit)?;
        Ok(VisitRecord { id, visit })
    }

    /// List all visits logged against one client.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for unregistered actors, or an
    /// internal error when the read fails.
    pub fn list_visits(&self, actor: &str, client_id: ClientId) -> Result<Vec<VisitRecord>, ApiError> {
        let store = self.open_store()?;
        Self::require_authorized(&store, actor)?;
        let visits = store
            .list_visits(client_id)?
            .into_iter()
            .map(|(id, visit)| VisitRecord { id, visit })
            .collect();
        Ok(visits)
    }

    /// Migration Initiator entry point: admin-gated probe-and-schedule.
    ///
    /// The authorization check runs before any visit query; a forbidden
    /// outcome schedules nothing. At most one work item is enqueued per call.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for non-admin actors, or propagates
    /// pipeline/store failures (nothing scheduled in that case).
    pub fn start_migration(
        &self,
        actor: &str,
        scheduler: &mut dyn WorkScheduler,
        chunk_size: usize,
    ) -> Result<StartMigrationResult, ApiError> {
        let mut store = self.open_store()?;
        if !store.is_admin(actor)? {
            return Err(ApiError::Forbidden(format!(
                "{actor} must be an admin to start a backfill"
            )));
        }

        let report = start_backfill(&mut store, scheduler, chunk_size)?;
        Ok(StartMigrationResult { actor: actor.to_string(), scheduled: report.scheduled })
    }

    /// Chunk Processor entry point, reached through the work scheduler's
    /// delivery callback with the raw cursor token.
    ///
    /// # Errors
    /// Returns a permanent [`PipelineError::MalformedCursor`] for an
    /// undecodable token, or propagates store/scheduler failures so the
    /// scheduler redelivers the same item.
    pub fn resume_migration(
        &self,
        cursor_token: &str,
        scheduler: &mut dyn WorkScheduler,
        chunk_size: usize,
    ) -> Result<ChunkReport, ApiError> {
        let resume_cursor = Cursor::decode(cursor_token)?;
        let mut store = self.open_store()?;
        let report = process_chunk(
            &mut store,
            scheduler,
            casebook_core::WorkItem { resume_cursor },
            chunk_size,
            OffsetDateTime::now_utc(),
        )?;
        Ok(report)
    }

    /// Read-only progress listing for the operator-facing report.
    ///
    /// # Errors
    /// Returns an internal error when the log cannot be read.
    pub fn progress_report(&self) -> Result<ProgressReport, ApiError> {
        let store = self.open_store()?;
        let entries = store.list_progress()?;
        let summary = summarize_progress(&entries);
        let remaining_unmigrated = store.count_visits_missing_retired()?;
        Ok(ProgressReport { summary, remaining_unmigrated, entries })
    }

    /// Seed `count` visits in the pre-attribute shape (no `retired` value).
    /// Operator/test tooling for exercising the backfill.
    ///
    /// # Errors
    /// Returns [`ApiError::Forbidden`] for non-admin actors, or an internal
    /// error when persistence fails.
    pub fn seed_legacy_visits(
        &self,
        actor: &str,
        input: AddVisitRequest,
        count: usize,
    ) -> Result<Vec<VisitId>, ApiError> {
        let mut store = self.open_store()?;
        if !store.is_admin(actor)? {
            return Err(ApiError::Forbidden(format!(
                "{actor} must be an admin to seed legacy visits"
            )));
        }

        let visit = Visit {
            client_id: input.client_id,
            visited_on: input.visited_on,
            assistance: input.assistance,
            note: input.note,
            retired: None,
        };

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(store.add_legacy_visit(&visit)?);
        }
        Ok(ids)
    }
}

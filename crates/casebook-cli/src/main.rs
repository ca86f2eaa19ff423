use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Result;
use casebook_api::{AddClientRequest, AddVisitRequest, CaseworkApi};
use casebook_core::{
    ChunkReport, ClientId, SchedulerError, WorkItem, WorkScheduler, DEFAULT_CHUNK_SIZE,
};
use casebook_store_sqlite::SqliteStore;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "casebook")]
#[command(about = "Conference casework CLI")]
struct Cli {
    #[arg(long, default_value = "./casebook.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Client {
        #[command(subcommand)]
        command: ClientCommand,
    },
    Visit {
        #[command(subcommand)]
        command: VisitCommand,
    },
    Backfill {
        #[command(subcommand)]
        command: BackfillCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Init,
    SchemaVersion,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Add(UserAddArgs),
}

#[derive(Debug, Args)]
struct UserAddArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    email: String,
    #[arg(long, default_value_t = false)]
    admin: bool,
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    Add(ClientAddArgs),
    Edit(ClientEditArgs),
    Show(ClientShowArgs),
    List(ClientListArgs),
}

#[derive(Debug, Args)]
struct ClientAddArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Debug, Args)]
struct ClientEditArgs {
    #[arg(long)]
    id: i64,
    #[command(flatten)]
    fields: ClientAddArgs,
}

#[derive(Debug, Args)]
struct ClientShowArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct ClientListArgs {
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Subcommand)]
enum VisitCommand {
    Add(VisitAddArgs),
    List(VisitListArgs),
    SeedLegacy(SeedLegacyArgs),
}

#[derive(Debug, Args)]
struct VisitAddArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    client_id: i64,
    #[arg(long)]
    visited_on: String,
    #[arg(long)]
    assistance: String,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
struct VisitListArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    client_id: i64,
}

#[derive(Debug, Args)]
struct SeedLegacyArgs {
    #[command(flatten)]
    visit: VisitAddArgs,
    #[arg(long, default_value_t = 1)]
    count: usize,
}

#[derive(Debug, Subcommand)]
enum BackfillCommand {
    Run(BackfillRunArgs),
    Progress,
}

#[derive(Debug, Args)]
struct BackfillRunArgs {
    #[arg(long)]
    actor: String,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

/// In-process work queue for the synchronous backfill driver. Items are
/// drained in submission order until the chain reports completion.
#[derive(Debug, Default)]
struct LocalQueue {
    pending: VecDeque<WorkItem>,
}

impl WorkScheduler for LocalQueue {
    fn submit(&mut self, item: WorkItem) -> Result<(), SchedulerError> {
        self.pending.push_back(item);
        Ok(())
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => run_db(&command, &cli.db),
        Command::User { command } => run_user(command, &CaseworkApi::new(cli.db)),
        Command::Client { command } => run_client(command, &CaseworkApi::new(cli.db)),
        Command::Visit { command } => run_visit(command, &CaseworkApi::new(cli.db)),
        Command::Backfill { command } => run_backfill(&command, &CaseworkApi::new(cli.db)),
    }
}

fn run_db(command: &DbCommand, db: &Path) -> Result<()> {
    let mut store = SqliteStore::open(db)?;
    match command {
        DbCommand::Init => {
            store.migrate()?;
            emit_json(serde_json::json!({
                "db": db,
                "schema_version": store.schema_version()?
            }))
        }
        DbCommand::SchemaVersion => emit_json(serde_json::json!({
            "schema_version": store.schema_version()?
        })),
    }
}

fn run_user(command: UserCommand, api: &CaseworkApi) -> Result<()> {
    match command {
        UserCommand::Add(args) => {
            api.add_user(&args.actor, &args.email, args.admin)?;
            emit_json(serde_json::json!({
                "email": args.email,
                "admin": args.admin
            }))
        }
    }
}

fn run_client(command: ClientCommand, api: &CaseworkApi) -> Result<()> {
    match command {
        ClientCommand::Add(args) => {
            let record = api.add_client(
                &args.actor,
                AddClientRequest {
                    first_name: args.first_name,
                    last_name: args.last_name,
                    address: args.address,
                    phone: args.phone,
                },
            )?;
            emit_json(serde_json::to_value(&record)?)
        }
        ClientCommand::Edit(args) => {
            let edited = api.edit_client(
                &args.fields.actor,
                ClientId(args.id),
                AddClientRequest {
                    first_name: args.fields.first_name,
                    last_name: args.fields.last_name,
                    address: args.fields.address,
                    phone: args.fields.phone,
                },
            )?;
            match edited {
                Some(record) => emit_json(serde_json::to_value(&record)?),
                None => anyhow::bail!("no client with id {}", args.id),
            }
        }
        ClientCommand::Show(args) => match api.get_client(&args.actor, ClientId(args.id))? {
            Some(record) => emit_json(serde_json::to_value(&record)?),
            None => anyhow::bail!("no client with id {}", args.id),
        },
        ClientCommand::List(args) => {
            let clients = api.list_clients(&args.actor)?;
            emit_json(serde_json::json!({ "clients": clients }))
        }
    }
}

fn run_visit(command: VisitCommand, api: &CaseworkApi) -> Result<()> {
    match command {
        VisitCommand::Add(args) => {
            let record = api.add_visit(
                &args.actor,
                AddVisitRequest {
                    client_id: ClientId(args.client_id),
                    visited_on: args.visited_on,
                    assistance: args.assistance,
                    note: args.note,
                },
            )?;
            emit_json(serde_json::to_value(&record)?)
        }
        VisitCommand::List(args) => {
            let visits = api.list_visits(&args.actor, ClientId(args.client_id))?;
            emit_json(serde_json::json!({
                "client_id": args.client_id,
                "visits": visits
            }))
        }
        VisitCommand::SeedLegacy(args) => {
            let seeded = api.seed_legacy_visits(
                &args.visit.actor,
                AddVisitRequest {
                    client_id: ClientId(args.visit.client_id),
                    visited_on: args.visit.visited_on,
                    assistance: args.visit.assistance,
                    note: args.visit.note,
                },
                args.count,
            )?;
            emit_json(serde_json::json!({
                "client_id": args.visit.client_id,
                "seeded": seeded.len()
            }))
        }
    }
}

fn run_backfill(command: &BackfillCommand, api: &CaseworkApi) -> Result<()> {
    match command {
        BackfillCommand::Run(args) => run_backfill_run(args, api),
        BackfillCommand::Progress => {
            let report = api.progress_report()?;
            emit_json(serde_json::to_value(&report)?)
        }
    }
}

/// Drive the whole chain to completion in-process. Each queued item is
/// delivered exactly once; a failed delivery aborts the run and leaves
/// progress where it was, which a later run resumes past harmlessly.
fn run_backfill_run(args: &BackfillRunArgs, api: &CaseworkApi) -> Result<()> {
    let mut queue = LocalQueue::default();
    let start = api.start_migration(&args.actor, &mut queue, args.chunk_size)?;

    let mut invocations: u64 = 0;
    let mut chunks = Vec::new();
    while let Some(item) = queue.pending.pop_front() {
        invocations += 1;
        let report =
            api.resume_migration(&item.resume_cursor.encode(), &mut queue, args.chunk_size)?;
        if let ChunkReport::Continued { cursor_after, processed } = &report {
            chunks.push(serde_json::json!({
                "cursor_after": cursor_after,
                "processed": processed
            }));
        }
    }

    let progress = api.progress_report()?;
    emit_json(serde_json::json!({
        "scheduled": start.scheduled,
        "invocations": invocations,
        "chunks": chunks,
        "total_processed": progress.summary.total_processed,
        "remaining_unmigrated": progress.remaining_unmigrated
    }))
}

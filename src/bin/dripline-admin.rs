//! Dripline Admin - operator inspection and dead-letter requeue.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};

use dripline::{
    PostgresBackend, admin, observability::init_logging, workers::DEFAULT_CONSUMER_GROUP,
};

#[derive(Parser, Debug)]
#[command(name = "dripline-admin", about = "Inspect and repair a dripline deployment")]
struct Args {
    /// PostgreSQL connection string.
    #[arg(long, env = "DRIPLINE_DATABASE_URL")]
    database_url: String,
    /// Consumer group to report on.
    #[arg(long, env = "DRIPLINE_CONSUMER_GROUP", default_value = DEFAULT_CONSUMER_GROUP)]
    group: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Staged work, stream backlog and dead-letter counts.
    Status,
    /// List dead-lettered messages.
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Publish a dead-lettered message again at the tail of its stream.
    RequeueDeadLetter { id: i64 },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging("dripline=warn,dripline_admin=info");
    let args = Args::parse();

    let backend = PostgresBackend::connect(&args.database_url, 2)
        .await
        .context("failed to connect to database")?;

    let result = match args.command {
        Command::Status => admin::status_report(&backend, &args.group, Utc::now())
            .await
            .map(Some),
        Command::DeadLetters { limit } => admin::dead_letters_report(&backend, limit)
            .await
            .map(Some),
        Command::RequeueDeadLetter { id } => admin::requeue(&backend, id).await,
    };
    backend.close().await;

    match result.context("admin command failed")? {
        Some(output) => {
            print!("{output}");
            if !output.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        None => bail!("no dead letter with that id"),
    }
}

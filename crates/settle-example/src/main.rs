//! Example: operating a fictional managed-database platform with settle.
//!
//! Databases are backed by ordinary JSON files on the local filesystem,
//! standing in for real cloud resources, and move through their lifecycle
//! on wall-clock time: a freshly created database is invisible to reads
//! for a couple of seconds, reports `CREATING` while it provisions, then
//! settles on `AVAILABLE`. Run with `RUST_LOG=info` to see what settle
//! does under the hood.
//!
//! ```sh
//! cargo run -p settle-example -- create
//! cargo run -p settle-example -- status
//! cargo run -p settle-example -- delete --wait
//! ```

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use settle::{
    backoff::{Backoff, Deadline},
    retry,
    wait::StateChange,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "dbctl", about = "Operate a fictional managed database")]
struct Cli {
    /// Directory where database records are written.
    #[arg(long, default_value = "databases")]
    data_dir: PathBuf,

    /// Name of the database.
    #[arg(long, default_value = "main")]
    name: String,

    /// Database engine recorded on creation.
    #[arg(long, default_value = "postgres")]
    engine: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a database and wait for it to become available.
    Create,
    /// Report the database's current status.
    Status,
    /// Delete the database.
    Delete {
        /// Block until describe calls stop finding the database.
        #[clap(long, short, default_value = "false")]
        wait: bool,
    },
}

// ---------------------------------------------------------------------------
// The fictional platform
// ---------------------------------------------------------------------------

/// Seconds after creation before reads see the database at all.
const VISIBILITY_LAG_SECS: u64 = 2;
/// Seconds a new database spends in `CREATING`.
const PROVISION_SECS: u64 = 6;
/// Seconds a deleted database spends in `DELETING` before it disappears.
const TEARDOWN_SECS: u64 = 4;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct DatabaseRecord {
    name: String,
    engine: String,
    created_at_epoch_secs: u64,
    deleting_since_epoch_secs: Option<u64>,
}

/// A managed-database service backed by JSON files in a local directory.
struct Platform {
    data_dir: PathBuf,
}

impl Platform {
    fn record_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.json"))
    }

    /// Submits a create. The database only becomes visible to
    /// [`Platform::describe`] once the visibility lag has passed.
    fn launch(&self, name: &str, engine: &str) -> Result<(), settle::Error> {
        std::fs::create_dir_all(&self.data_dir).map_err(anyhow::Error::from)?;
        let record = DatabaseRecord {
            name: name.to_owned(),
            engine: engine.to_owned(),
            created_at_epoch_secs: now_epoch(),
            deleting_since_epoch_secs: None,
        };
        let contents = serde_json::to_string_pretty(&record).map_err(anyhow::Error::from)?;
        std::fs::write(self.record_path(name), contents).map_err(anyhow::Error::from)?;
        log::info!("  submitted create for database '{name}'");
        Ok(())
    }

    /// Marks the database for deletion. The platform rejects the request
    /// while a create is still in flight.
    fn terminate(&self, name: &str) -> Result<(), settle::Error> {
        let (mut record, status) = self.describe(name)?;
        if status == "CREATING" {
            return Err(settle::Error::other("another operation is in progress"));
        }
        if record.deleting_since_epoch_secs.is_none() {
            record.deleting_since_epoch_secs = Some(now_epoch());
            let contents = serde_json::to_string_pretty(&record).map_err(anyhow::Error::from)?;
            std::fs::write(self.record_path(name), contents).map_err(anyhow::Error::from)?;
        }
        log::info!("  submitted delete for database '{name}'");
        Ok(())
    }

    /// One describe call, deriving the status from the record's age.
    fn describe(&self, name: &str) -> Result<(DatabaseRecord, String), settle::Error> {
        let path = self.record_path(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(settle::Error::not_found());
            }
            Err(error) => return Err(anyhow::Error::from(error).into()),
        };
        let record: DatabaseRecord =
            serde_json::from_str(&contents).map_err(anyhow::Error::from)?;
        let age = now_epoch().saturating_sub(record.created_at_epoch_secs);
        if age < VISIBILITY_LAG_SECS {
            return Err(settle::Error::not_found());
        }
        if let Some(deleting_since) = record.deleting_since_epoch_secs {
            if now_epoch().saturating_sub(deleting_since) >= TEARDOWN_SECS {
                std::fs::remove_file(&path).map_err(anyhow::Error::from)?;
                return Err(settle::Error::not_found());
            }
            return Ok((record, "DELETING".to_owned()));
        }
        let status = if age < PROVISION_SECS {
            "CREATING"
        } else {
            "AVAILABLE"
        };
        Ok((record, status.to_owned()))
    }
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn endpoint(record: &DatabaseRecord) -> String {
    format!("{}.{}.fictional.example:5432", record.name, record.engine)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let platform = Platform {
        data_dir: cli.data_dir.clone(),
    };

    match cli.command {
        Command::Create => {
            platform.launch(&cli.name, &cli.engine)?;

            // One budget covers both the visibility wait and the status wait.
            let budget = Deadline::new(Duration::from_secs(60));
            let record = retry::retry_while_not_found(budget.remaining(), || {
                let outcome = platform.describe(&cli.name).map(|(record, _)| record);
                async move { outcome }
            })
            .await?;
            log::info!("  database '{}' is visible", record.name);

            let settled = StateChange::new(["CREATING"], ["AVAILABLE"], budget.remaining())
                .with_backoff(Backoff::default().with_poll_interval(Duration::from_secs(1)))
                .with_continuous_target(2)
                .wait(|| {
                    let outcome = platform.describe(&cli.name);
                    async move { outcome }
                })
                .await?;
            if let Some(record) = settled.into_value() {
                println!(
                    "Database '{}' is available at {}",
                    record.name,
                    endpoint(&record)
                );
            }
        }
        Command::Status => match platform.describe(&cli.name) {
            Ok((record, status)) => {
                println!("{}: {status} (engine {})", record.name, record.engine)
            }
            Err(error) if error.is_not_found() => println!("{}: not found", cli.name),
            Err(error) => return Err(error.into()),
        },
        Command::Delete { wait } => {
            // Deletes conflict with an in-flight create; keep asking until
            // the platform accepts the request.
            retry::retry_when_message_contains(
                Duration::from_secs(60),
                "operation is in progress",
                || {
                    let outcome = platform.terminate(&cli.name);
                    async move { outcome }
                },
            )
            .await?;

            if wait {
                StateChange::until_gone(["DELETING"], Duration::from_secs(60))
                    .wait(|| {
                        let outcome = platform.describe(&cli.name);
                        async move { outcome }
                    })
                    .await?;
                println!("Database '{}' is gone.", cli.name);
            } else {
                println!("Deletion of '{}' is underway.", cli.name);
            }
        }
    }
    Ok(())
}

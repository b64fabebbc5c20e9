use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rollcall_core::{Descriptor, EventId, Settings, StudentId};
use rollcall_store::{EventUpdate, NewEvent, Store, StudentUpdate};
use serde::Serialize;
use std::path::{Path, PathBuf};

mod commands;

use commands::AttendanceFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered students
    Student {
        #[command(subcommand)]
        command: StudentCommand,
    },
    /// Enroll a student from face descriptor samples
    Enroll {
        /// Student ID
        student: String,
        /// JSON file: array of descriptor arrays (null for frames without a face)
        #[arg(long)]
        samples: PathBuf,
        /// Samples required for a reference descriptor (default: from settings)
        #[arg(long)]
        min_samples: Option<usize>,
    },
    /// Manage events
    Event {
        #[command(subcommand)]
        command: EventCommand,
    },
    /// Identify a descriptor against enrolled students
    Match {
        /// JSON file containing one descriptor array
        #[arg(long)]
        descriptor: PathBuf,
        /// Acceptance distance (default: from settings)
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// List attendance records
    Attendance {
        #[arg(long, conflicts_with_all = ["student", "from", "to"])]
        event: Option<String>,
        #[arg(long, conflicts_with_all = ["from", "to"])]
        student: Option<String>,
        /// Range start, RFC 3339 (inclusive)
        #[arg(long, requires = "to")]
        from: Option<DateTime<Utc>>,
        /// Range end, RFC 3339 (inclusive)
        #[arg(long, requires = "from")]
        to: Option<DateTime<Utc>>,
    },
    /// Record attendance manually; an existing record is left unchanged
    Record {
        student: String,
        event: String,
        #[arg(long)]
        confidence: f32,
        /// Recognition time, RFC 3339 (default: now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Show database and settings summary
    Status,
}

#[derive(Subcommand)]
enum StudentCommand {
    /// Register a student (untrained until enrolled)
    Add {
        id: String,
        name: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// List students
    List,
    /// Change a student's name or email; the enrollment is kept
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Remove a student; attendance history is kept
    Remove { id: String },
}

#[derive(Subcommand)]
enum EventCommand {
    /// Create an event
    Add {
        name: String,
        /// Start time, RFC 3339
        #[arg(long)]
        start: DateTime<Utc>,
        /// Event ID (default: generated UUID)
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Make this the active event
        #[arg(long)]
        activate: bool,
    },
    /// List events, newest first
    List,
    /// Rename an event or move its start; existing records keep their status
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        /// New start time, RFC 3339
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Remove an event; attendance history is kept
    Remove { id: String },
    /// Make an event the active one
    Activate { id: String },
    /// Show the active event
    Active,
}

#[derive(Serialize)]
struct Removed {
    id: String,
    removed: bool,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load().context("failed to load settings")?;
    let store = Store::open(&settings.db_path)
        .await
        .with_context(|| format!("failed to open {}", settings.db_path.display()))?;

    match cli.command {
        Commands::Student { command } => match command {
            StudentCommand::Add { id, name, email } => {
                print_json(&commands::add_student(&store, id, name, email).await?)?;
            }
            StudentCommand::List => print_json(&commands::list_students(&store).await?)?,
            StudentCommand::Update { id, name, email } => {
                let update = StudentUpdate { name, email };
                let student = store.update_student(&StudentId::from(id), update).await?;
                print_json(&commands::StudentView::from(student))?;
            }
            StudentCommand::Remove { id } => {
                let removed = store.delete_student(&StudentId::from(id.as_str())).await?;
                print_json(&Removed { id, removed })?;
            }
        },
        Commands::Enroll {
            student,
            samples,
            min_samples,
        } => {
            let samples = commands::parse_samples(&read_file(&samples)?, settings.descriptor_len)?;
            let min_samples = min_samples.unwrap_or(settings.enroll_min_samples);
            let report =
                commands::enroll(&store, &StudentId::from(student), samples, min_samples).await?;
            print_json(&report)?;
        }
        Commands::Event { command } => match command {
            EventCommand::Add {
                name,
                start,
                id,
                description,
                activate,
            } => {
                let new = NewEvent {
                    id: id.map(EventId::from),
                    name,
                    start_time: start,
                    description,
                };
                print_json(&commands::add_event(&store, new, activate).await?)?;
            }
            EventCommand::List => print_json(&store.list_events().await?)?,
            EventCommand::Update {
                id,
                name,
                start,
                description,
            } => {
                let update = EventUpdate {
                    name,
                    start_time: start,
                    description,
                };
                print_json(&store.update_event(&EventId::from(id), update).await?)?;
            }
            EventCommand::Remove { id } => {
                let removed = store.delete_event(&EventId::from(id.as_str())).await?;
                print_json(&Removed { id, removed })?;
            }
            EventCommand::Activate { id } => {
                print_json(&store.set_active_event(&EventId::from(id)).await?)?;
            }
            EventCommand::Active => print_json(&store.active_event().await?)?,
        },
        Commands::Match {
            descriptor,
            threshold,
        } => {
            let live = Descriptor::from_json(&read_file(&descriptor)?, settings.descriptor_len)
                .context("invalid descriptor")?;
            let threshold = threshold.unwrap_or(settings.match_threshold);
            print_json(&commands::match_descriptor(&store, &live, threshold).await?)?;
        }
        Commands::Attendance {
            event,
            student,
            from,
            to,
        } => {
            let filter = match (event, student, from, to) {
                (Some(event), _, _, _) => AttendanceFilter::Event(EventId::from(event)),
                (_, Some(student), _, _) => AttendanceFilter::Student(StudentId::from(student)),
                (_, _, Some(from), Some(to)) => AttendanceFilter::Between(from, to),
                _ => AttendanceFilter::All,
            };
            print_json(&commands::attendance(&store, filter).await?)?;
        }
        Commands::Record {
            student,
            event,
            confidence,
            at,
        } => {
            let report = commands::record(
                &store,
                StudentId::from(student),
                EventId::from(event),
                confidence,
                at,
            )
            .await?;
            print_json(&report)?;
        }
        Commands::Status => print_json(&commands::status(&store, &settings).await?)?,
    }

    store.close().await?;
    Ok(())
}

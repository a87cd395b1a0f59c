use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use image::DynamicImage;
use rollcall_core::{
    AttendanceEvent, DateRange, EnrollmentError, EnrollmentStore, EventType, Ledger, MatchPolicy, SessionController,
    SessionError,
};
use rollcall_hw::Webcam;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::CommandEngine;

/// Exit code for outcomes the user fixes by simply trying again.
const EXIT_RETRY: u8 = 2;

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Face-recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from the webcam or an image file
    Enroll {
        /// Unique person id (letters, digits, '-', '_', '.')
        #[arg(long)]
        id: String,
        /// Display name (required for new enrollments)
        #[arg(long)]
        name: Option<String>,
        /// Use this image instead of capturing from the webcam
        #[arg(long)]
        image: Option<PathBuf>,
        /// Replace the reference face of an already enrolled id
        #[arg(long)]
        force: bool,
    },
    /// Recognize a face and record the next check-in or check-out
    Check {
        #[arg(long)]
        image: Option<PathBuf>,
        /// Only record if the next event is of this kind
        #[arg(long = "as", value_enum)]
        direction: Option<Direction>,
    },
    /// Recognize a face without recording anything
    Identify {
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// List enrolled people
    People,
    /// Remove an enrolled person (attendance history is kept)
    Remove { id: String },
    /// Show the attendance log with summary counters
    Log {
        #[arg(long)]
        person: Option<String>,
        /// First day to include (YYYY-MM-DD, local time)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day to include (YYYY-MM-DD, local time)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// List people currently checked in
    Present,
    /// Export the attendance log as a JSON array
    Export {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show configuration and store status
    Status,
    /// List V4L2 capture devices
    Devices,
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    In,
    Out,
}

impl From<Direction> for EventType {
    fn from(d: Direction) -> Self {
        match d {
            Direction::In => EventType::CheckIn,
            Direction::Out => EventType::CheckOut,
        }
    }
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = Config::load().context("failed to load configuration")?;
    tracing::debug!(?cfg, "configuration loaded");

    match cli.command {
        Commands::Enroll {
            id,
            name,
            image,
            force,
        } => {
            let mut session = open_session(&cfg)?;
            let exists = session.people().get(&id).is_some();
            let action = match plan_enroll(&id, exists, force, name) {
                Ok(action) => action,
                Err(e) => return enroll_failed(e),
            };

            let frame = acquire(&cfg, image.as_deref())?;
            let result = match action {
                EnrollAction::New(name) => session.enroll(&id, &name, &frame),
                EnrollAction::Refresh(name) => session.reenroll(&id, name.as_deref(), &frame),
            };
            let person = match result {
                Ok(person) => person,
                Err(e) => return enroll_failed(e),
            };
            println!(
                "Enrolled {} ({}), {}-dim embedding",
                person.name,
                person.id,
                person.reference_embedding.dim()
            );
        }
        Commands::Check { image, direction } => {
            let mut session = open_session(&cfg)?;
            let frame = acquire(&cfg, image.as_deref())?;
            let result = match direction {
                Some(d) => session.process_frame_as(&frame, d.into()),
                None => session.process_frame(&frame),
            };
            match result {
                Ok(event) => {
                    let name = session
                        .people()
                        .get(&event.person_id)
                        .map_or(event.person_id.as_str(), |p| p.name.as_str());
                    println!(
                        "{} recorded for {} at {}",
                        label(event.event_type),
                        name,
                        local_time(&event)
                    );
                }
                Err(e) => return retry_or_fail(e),
            }
        }
        Commands::Identify { image } => {
            let mut session = open_session(&cfg)?;
            let frame = acquire(&cfg, image.as_deref())?;
            match session.identify(&frame) {
                Ok(m) if m.matched => println!(
                    "{} ({}), similarity {:.3}",
                    m.person_name.unwrap_or_default(),
                    m.person_id.unwrap_or_default(),
                    m.similarity
                ),
                Ok(m) => return retry_or_fail(SessionError::NoMatch {
                    best_similarity: m.similarity,
                }),
                Err(e) => return retry_or_fail(e),
            }
        }
        Commands::People => {
            let people = EnrollmentStore::load(cfg.people_dir())?;
            if people.is_empty() {
                println!("No people enrolled");
            }
            for p in people.lookup_all() {
                println!(
                    "{:<16} {:<24} enrolled {}  dim={} model={}",
                    p.id,
                    p.name,
                    p.enrolled_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                    p.reference_embedding.dim(),
                    p.reference_embedding.model_version.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Remove { id } => {
            let mut people = EnrollmentStore::open(cfg.people_dir())?;
            if people.remove(&id)? {
                println!("Removed {id}");
            } else {
                bail!("no enrolled person with id {id}");
            }
        }
        Commands::Log { person, from, to } => {
            let people = EnrollmentStore::load(cfg.people_dir())?;
            let ledger = Ledger::open_read_only(cfg.ledger_path())?;
            print_log(&people, &ledger, person.as_deref(), DateRange::days(from, to, &Local))?;
        }
        Commands::Present => {
            let people = EnrollmentStore::load(cfg.people_dir())?;
            let ledger = Ledger::open_read_only(cfg.ledger_path())?;
            let present = ledger.present();
            if present.is_empty() {
                println!("Nobody is checked in");
            }
            for id in present {
                let name = people.get(&id).map_or("(removed)", |p| p.name.as_str());
                println!("{id:<16} {name}");
            }
        }
        Commands::Export { output } => {
            let ledger = Ledger::open_read_only(cfg.ledger_path())?;
            let events = ledger.query(None, None)?.collect::<Result<Vec<_>, _>>()?;
            let json = serde_json::to_string_pretty(&events)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json + "\n")
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Exported {} records to {}", events.len(), path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Status => {
            let people = EnrollmentStore::load(cfg.people_dir())?;
            let ledger = Ledger::open_read_only(cfg.ledger_path())?;
            let status = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "data_dir": cfg.data_dir,
                "camera_device": cfg.camera_device,
                "engine_command": cfg.engine_command,
                "similarity_threshold": cfg.similarity_threshold,
                "people": people.len(),
                "records": ledger.len(),
                "present": ledger.present().len(),
                "summary": ledger.summary(Local::now().date_naive(), &Local)?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Devices => {
            let devices = Webcam::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{:<14} {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, PartialEq)]
enum EnrollAction {
    New(String),
    Refresh(Option<String>),
}

/// Decide what `enroll` will do before a frame is captured.
fn plan_enroll(
    id: &str,
    exists: bool,
    force: bool,
    name: Option<String>,
) -> Result<EnrollAction, EnrollmentError> {
    match (exists, name) {
        (true, _) if !force => Err(EnrollmentError::DuplicateId(id.to_string())),
        (true, name) => Ok(EnrollAction::Refresh(name)),
        (false, Some(name)) => Ok(EnrollAction::New(name)),
        (false, None) => Err(EnrollmentError::EmptyName),
    }
}

fn enroll_failed(err: EnrollmentError) -> Result<ExitCode> {
    if err.is_recoverable() {
        eprintln!("{err}");
        Ok(ExitCode::from(EXIT_RETRY))
    } else {
        Err(err.into())
    }
}

fn open_session(cfg: &Config) -> Result<SessionController<CommandEngine>> {
    let engine = CommandEngine::new(cfg.engine_command.clone())?;
    let people = EnrollmentStore::open(cfg.people_dir())?;
    let ledger = Ledger::open(cfg.ledger_path())?;
    Ok(SessionController::new(
        engine,
        people,
        ledger,
        MatchPolicy {
            threshold: cfg.similarity_threshold,
        },
    ))
}

/// Load `path`, or capture a frame from the configured webcam.
fn acquire(cfg: &Config, path: Option<&Path>) -> Result<DynamicImage> {
    if let Some(path) = path {
        return image::open(path).with_context(|| format!("failed to read image {}", path.display()));
    }

    let camera = Webcam::open(&cfg.camera_device, cfg.camera_width, cfg.camera_height)
        .with_context(|| format!("failed to access webcam {}", cfg.camera_device))?;
    let frame = camera.capture(cfg.warmup_frames, cfg.capture_attempts)?;
    tracing::debug!(
        width = frame.width(),
        height = frame.height(),
        seq = frame.sequence,
        dark_skipped = frame.dark_skipped,
        "frame captured"
    );
    Ok(frame.image)
}

fn retry_or_fail(err: SessionError) -> Result<ExitCode> {
    if err.is_recoverable() {
        eprintln!("{err}");
        Ok(ExitCode::from(EXIT_RETRY))
    } else {
        Err(err.into())
    }
}

fn label(ty: EventType) -> &'static str {
    match ty {
        EventType::CheckIn => "Check-In",
        EventType::CheckOut => "Check-Out",
    }
}

fn local_time(event: &AttendanceEvent) -> String {
    event
        .timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn print_log(
    people: &EnrollmentStore,
    ledger: &Ledger,
    person: Option<&str>,
    range: DateRange,
) -> Result<()> {
    let summary = ledger.summary(Local::now().date_naive(), &Local)?;
    println!(
        "Total Records: {}   Unique People: {}   Today's Records: {}",
        summary.total_records, summary.unique_people, summary.today_records
    );

    if ledger.is_empty() {
        println!("No attendance records found");
        return Ok(());
    }

    println!();
    println!("{:<24} {:<10} {}", "Name", "Type", "Time");
    for event in ledger.query(person, Some(range))? {
        let event = event?;
        let name = people
            .get(&event.person_id)
            .map_or(event.person_id.as_str(), |p| p.name.as_str());
        println!("{:<24} {:<10} {}", name, label(event.event_type), local_time(&event));
    }
    Ok(())
}

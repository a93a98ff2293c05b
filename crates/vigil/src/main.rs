use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use image::GrayImage;
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vigil_core::{
    Annotation, Identity, Pipeline, RecognitionEvent, RecognitionObserver, SeetaDetector,
};
use vigil_hw::Camera;

mod audit;
mod config;
mod engine;
mod store;

use audit::AuditLog;
use config::Config;
use engine::{CameraOpener, Engine};
use store::{PersonFields, SqliteStore, StoredPerson};

#[derive(Parser)]
#[command(name = "vigil", about = "Face enrollment and live face recognition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a photo, or from the camera with --camera
    Enroll {
        #[command(flatten)]
        person: PersonArgs,
        /// Photo containing the person's face
        #[arg(conflicts_with = "camera", required_unless_present = "camera")]
        image: Option<PathBuf>,
        /// Capture the face from the camera instead of a photo
        #[arg(long)]
        camera: bool,
    },
    /// List enrolled persons
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Replace the details of an enrolled person
    Update {
        #[command(flatten)]
        person: PersonArgs,
    },
    /// Remove an enrolled person
    Delete {
        /// Registration number
        identity: String,
    },
    /// Recognize the faces in a photo
    Recognize {
        image: PathBuf,
    },
    /// Run live recognition on the camera until Ctrl-C
    Watch,
    /// List V4L2 capture devices
    Devices,
}

#[derive(Args)]
struct PersonArgs {
    /// Registration number
    identity: String,
    #[arg(short, long)]
    last_name: String,
    #[arg(short, long)]
    first_name: String,
    #[arg(short, long)]
    age: Option<u32>,
    #[arg(short, long)]
    email: Option<String>,
    #[arg(short, long)]
    phone: Option<String>,
}

impl PersonArgs {
    fn split(self) -> (Identity, PersonFields) {
        let fields = PersonFields {
            last_name: self.last_name,
            first_name: self.first_name,
            age: self.age,
            email: self.email,
            phone: self.phone,
        };
        (Identity::new(self.identity.trim()), fields)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Enroll { person, image, .. } => {
            let mut engine = open_engine(&config)?;
            let (identity, fields) = person.split();
            let report = match image {
                Some(path) => engine.enroll_file(&identity, fields, &path)?,
                None => {
                    let frame = engine::capture_still(&camera_opener(&config))?;
                    engine.enroll_image(&identity, fields, &frame)?
                }
            };
            println!("Enrolled {identity} ({} persons enrolled)", report.entries);
        }
        Commands::List { json } => {
            let engine = open_engine(&config)?;
            print_persons(&engine.list()?, json)?;
        }
        Commands::Update { person } => {
            let mut engine = open_engine(&config)?;
            let (identity, fields) = person.split();
            engine.update(&identity, fields)?;
            println!("Updated {identity}");
        }
        Commands::Delete { identity } => {
            let mut engine = open_engine(&config)?;
            let identity = Identity::new(identity.trim());
            let report = engine.delete(&identity)?;
            println!("Deleted {identity} ({} persons enrolled)", report.entries);
        }
        Commands::Recognize { image } => {
            let engine = open_engine(&config)?;
            let report = engine.recognize_file(&image)?;
            let audit = AuditLog::new(&config.audit_log).with_persons(&engine.list()?);
            let mut history = History::new(audit);
            for event in &report.events {
                history.on_event(event);
            }
            if report.annotations.is_empty() {
                println!("No face detected in {}", image.display());
            } else {
                for annotation in &report.annotations {
                    println!(
                        "{:>4},{:<4} {}x{}  {}  ({}%)",
                        annotation.rect.x,
                        annotation.rect.y,
                        annotation.rect.width,
                        annotation.rect.height,
                        annotation.outcome.label(),
                        annotation.confidence
                    );
                }
                println!("{} person(s) recognized", report.recognized());
            }
        }
        Commands::Watch => watch(&config).await?,
    }

    Ok(())
}

fn open_engine(config: &Config) -> Result<Engine<SqliteStore>> {
    let detector = SeetaDetector::load(&config.model_path, config.detect_params())?;
    let pipeline = Pipeline::new(Box::new(detector), config.lbph, config.policy())?;
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open person store {}", config.db_path.display()))?;
    Ok(Engine::new(store, pipeline)?)
}

fn camera_opener(config: &Config) -> CameraOpener {
    CameraOpener {
        device: config.camera_path().map(str::to_string),
        width: config.frame_width,
        height: config.frame_height,
        warmup: config.warmup(),
    }
}

async fn watch(config: &Config) -> Result<()> {
    let engine = open_engine(config)?;
    let audit = AuditLog::new(&config.audit_log).with_persons(&engine.list()?);
    let history = History::new(audit);
    let mut handle = engine::start_stream(
        engine.pipeline(),
        camera_opener(config),
        history,
        engine.clock(),
    )
    .await?;
    println!("Watching, press Ctrl-C to stop");

    let finished = tokio::select! {
        summary = handle.wait() => Some(summary),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
    };
    let summary = match finished {
        Some(summary) => summary?,
        None => {
            tracing::info!("stop requested");
            handle.stop();
            handle.wait().await?
        }
    };

    println!(
        "Stopped ({:?}): {} frames, {} skipped, {} recognitions",
        summary.reason, summary.frames, summary.skipped, summary.events
    );
    Ok(())
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for device in devices {
        println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
    }
}

#[derive(Serialize)]
struct PersonRow<'a> {
    identity: &'a Identity,
    #[serde(flatten)]
    fields: &'a PersonFields,
    has_template: bool,
}

fn print_persons(persons: &[StoredPerson], json: bool) -> Result<()> {
    if json {
        let rows: Vec<PersonRow<'_>> = persons
            .iter()
            .map(|p| PersonRow {
                identity: &p.identity,
                fields: &p.fields,
                has_template: p.template.is_some(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if persons.is_empty() {
        println!("No persons enrolled");
        return Ok(());
    }
    for p in persons {
        let age = p.fields.age.map(|a| a.to_string()).unwrap_or_default();
        println!(
            "{:<12} {:<16} {:<16} {:>3}  {:<24} {}",
            p.identity.as_str(),
            p.fields.last_name,
            p.fields.first_name,
            age,
            p.fields.email.as_deref().unwrap_or(""),
            p.fields.phone.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Prints each recognition and appends it to the audit log.
struct History {
    audit: AuditLog,
}

impl History {
    fn new(audit: AuditLog) -> Self {
        Self { audit }
    }
}

impl RecognitionObserver for History {
    fn on_frame(&mut self, _frame: &GrayImage, annotations: &[Annotation]) {
        if !annotations.is_empty() {
            tracing::debug!(faces = annotations.len(), "frame analyzed");
        }
    }

    fn on_event(&mut self, event: &RecognitionEvent) {
        println!("{} ({}%)", self.audit.line(event), event.confidence);
        if let Err(e) = self.audit.append(event) {
            tracing::warn!(error = %e, "failed to record recognition");
        }
    }
}

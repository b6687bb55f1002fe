use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use peptaide_core::cycles::{self, CycleAction, CycleSettings};
use peptaide_core::import::{import_history, read_import_csv, ImportTarget};
use peptaide_core::snapshot::MissingFlag;
use peptaide_core::*;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "peptaide")]
#[command(about = "Dose logging with effective-dose estimates", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one administration
    Log {
        #[command(flatten)]
        dose: DoseArgs,
    },

    /// Compute an administration without recording it
    Simulate {
        #[command(flatten)]
        dose: DoseArgs,
    },

    /// Soft-delete an event
    Delete { event_id: Uuid },

    /// Restore a soft-deleted event
    Restore { event_id: Uuid },

    /// List cycle instances
    Cycles {
        #[arg(long)]
        substance: Option<String>,
    },

    /// Manual cycle operations
    Cycle {
        #[command(subcommand)]
        action: CycleCommand,
    },

    /// Import historical administrations from a CSV file (ts,formulation_id,dose)
    Import { csv: PathBuf },

    /// Write the demo reference catalog to the data directory
    SeedDemo {
        /// Overwrite an existing catalog
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct DoseArgs {
    /// Formulation id from the reference catalog
    #[arg(long)]
    formulation: String,

    /// Administration time (RFC 3339), defaults to now
    #[arg(long)]
    at: Option<String>,

    /// Print the event as JSON
    #[arg(long)]
    json: bool,

    /// Dose text, e.g. "0.3mL", "250mcg" or "2 sprays"
    #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
    dose: Vec<String>,
}

#[derive(Subcommand)]
enum CycleCommand {
    /// Open a new cycle now
    Start {
        #[arg(long)]
        substance: String,
    },
    /// Complete the active cycle now
    End {
        #[arg(long)]
        substance: String,
    },
    /// Mark the active cycle abandoned
    Abandon {
        #[arg(long)]
        substance: String,
    },
    /// Complete the active cycle if it has gone quiet for the gap threshold
    Settle {
        #[arg(long)]
        substance: String,
    },
}

/// File-backed collaborators for one data directory
struct Stores {
    config: Config,
    catalog: ReferenceCatalog,
    events: JsonlEventLog,
    cycles: CycleLedger,
}

impl Stores {
    fn open(config: Config) -> Result<Self> {
        let catalog = ReferenceCatalog::load_or_demo(&config.catalog_path())?;
        let errors = catalog.validate();
        if !errors.is_empty() {
            eprintln!("Catalog validation errors:");
            for error in &errors {
                eprintln!("  - {}", error);
            }
            return Err(Error::CatalogValidation("Invalid catalog".into()));
        }

        let events =
            JsonlEventLog::new(config.events_path()).with_lock_timeout(config.lock_timeout());
        let cycles =
            CycleLedger::new(config.cycles_path()).with_lock_timeout(config.lock_timeout());
        Ok(Self {
            config,
            catalog,
            events,
            cycles,
        })
    }

    fn recorder(&self) -> EventRecorder<'_> {
        EventRecorder::new(
            &self.catalog,
            &self.catalog,
            &self.cycles,
            &self.events,
            self.config.profile.user_id.clone(),
            self.config.profile_defaults(),
        )
    }
}

fn main() -> Result<()> {
    // Initialize logging
    peptaide_core::logging::init();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }
    tracing::debug!("Using data directory {:?}", config.data.data_dir);

    match cli.command {
        Commands::Log { dose } => cmd_log(config, dose, false),
        Commands::Simulate { dose } => cmd_log(config, dose, true),
        Commands::Delete { event_id } => cmd_delete(config, event_id, true),
        Commands::Restore { event_id } => cmd_delete(config, event_id, false),
        Commands::Cycles { substance } => cmd_cycles(config, substance),
        Commands::Cycle { action } => cmd_cycle(config, action),
        Commands::Import { csv } => cmd_import(config, csv),
        Commands::SeedDemo { force } => cmd_seed_demo(config, force),
    }
}

fn parse_ts(raw: Option<&str>) -> Result<DateTime<Utc>> {
    match raw {
        Some(s) => Ok(DateTime::parse_from_rfc3339(s)
            .map_err(|e| Error::Parse(format!("Invalid timestamp \"{}\": {}", s, e)))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

fn cmd_log(config: Config, args: DoseArgs, dry_run: bool) -> Result<()> {
    let stores = Stores::open(config)?;
    let recorder = stores.recorder();

    let request = LogRequest::new(
        args.formulation.clone(),
        args.dose.join(" "),
        parse_ts(args.at.as_deref())?,
    );
    let prepared = recorder.prepare(&request)?;

    if dry_run {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&prepared.event)?);
        } else {
            display_event(&prepared.event);
            display_plan(prepared.cycle_action);
            println!("\n[Dry run - nothing written]");
        }
        return Ok(());
    }

    let recorded = recorder.commit(prepared)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&recorded.event)?);
        return Ok(());
    }

    display_event(&recorded.event);
    if let Some(closed) = &recorded.completed_cycle {
        println!("  Completed cycle #{}", closed.cycle_number);
    }
    match &recorded.cycle {
        Some(c) => println!("  Cycle: #{} ({:?})", c.cycle_number, recorded.cycle_action),
        None => println!("  Cycle: none"),
    }
    println!("\n✓ Event logged: {}", recorded.event.id);
    Ok(())
}

fn display_event(event: &AdministrationEvent) {
    println!();
    println!("  {} @ {}", event.formulation_id, event.ts.to_rfc3339());
    println!("  Input: {} ({:?})", event.input_text, event.input_kind);

    match event.dose_mass_mg {
        Some(mg) => println!("  Dose: {:.4} mg", mg),
        None => println!("  Dose: mass unknown"),
    }
    if let Some(ml) = event.dose_volume_ml {
        println!("  Volume: {:.4} mL", ml);
    }

    for (compartment, model) in &event.model_snapshot.compartments {
        match event.percentiles(*compartment) {
            Some(p) => println!(
                "  Effective {}: p05 {:.4} / p50 {:.4} / p95 {:.4} mg",
                compartment, p.p05, p.p50, p.p95
            ),
            None => {
                let reason = if model.missing.is_empty() {
                    "not estimated".to_string()
                } else {
                    model
                        .missing
                        .iter()
                        .map(missing_label)
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                println!("  Effective {}: unknown ({})", compartment, reason);
            }
        }
    }

    if let Some(cost) = event.cost_usd {
        println!("  Cost: ${:.2}", cost);
    }
}

fn missing_label(flag: &MissingFlag) -> &'static str {
    match flag {
        MissingFlag::MissingBaseBioavailabilityDistribution => "base distribution not found",
        MissingFlag::MissingBaseBioavailabilitySpec => "no bioavailability spec",
        MissingFlag::MissingMultiplierDistribution => "multiplier not found",
    }
}

fn display_plan(action: CycleAction) {
    let text = match action {
        CycleAction::StartFirstCycle => "would start a new cycle",
        CycleAction::SuggestNewCycle => "would close the active cycle and start the next",
        CycleAction::ContinueActiveCycle => "would continue the active cycle",
        CycleAction::NoAction => "no cycle change",
    };
    println!("  Cycle: {}", text);
}

fn cmd_delete(config: Config, event_id: Uuid, delete: bool) -> Result<()> {
    let stores = Stores::open(config)?;
    let recorder = stores.recorder();

    if delete {
        recorder.delete_event(event_id, Utc::now())?;
        println!("✓ Deleted event {}", event_id);
    } else {
        recorder.restore_event(event_id)?;
        println!("✓ Restored event {}", event_id);
    }
    Ok(())
}

fn cmd_cycles(config: Config, substance: Option<String>) -> Result<()> {
    let stores = Stores::open(config)?;
    let cycles = stores.cycles.list_cycles(substance.as_deref())?;

    if cycles.is_empty() {
        println!("No cycles recorded.");
        return Ok(());
    }

    for c in cycles {
        let end = c
            .end_ts
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  #{:<3} {:<10} {}  {}",
            c.substance_id,
            c.cycle_number,
            format!("{:?}", c.status).to_lowercase(),
            c.start_ts.to_rfc3339(),
            end
        );
    }
    Ok(())
}

fn cmd_cycle(config: Config, action: CycleCommand) -> Result<()> {
    let stores = Stores::open(config)?;
    let now = Utc::now();

    match action {
        CycleCommand::Start { substance } => {
            let c = cycles::start_cycle_now(&stores.cycles, &substance, now)?;
            println!("✓ Started cycle #{} for {}", c.cycle_number, substance);
        }
        CycleCommand::End { substance } => {
            let c = cycles::end_cycle_now(&stores.cycles, &substance, now)?;
            println!("✓ Completed cycle #{} for {}", c.cycle_number, substance);
        }
        CycleCommand::Abandon { substance } => {
            let c = cycles::abandon_cycle(&stores.cycles, &substance, now)?;
            println!("✓ Abandoned cycle #{} for {}", c.cycle_number, substance);
        }
        CycleCommand::Settle { substance } => {
            let rule = stores.catalog.cycle_rule(&substance)?;
            let settings =
                CycleSettings::resolve(rule.as_ref(), &stores.config.profile_defaults())?;
            let last_event_ts = stores.events.last_event_ts(&substance)?;
            match cycles::settle_active_cycle(
                &stores.cycles,
                &substance,
                last_event_ts,
                settings.gap_days,
                now,
            )? {
                Some(c) => println!("✓ Completed quiet cycle #{} for {}", c.cycle_number, substance),
                None => println!("No quiet active cycle for {}", substance),
            }
        }
    }
    Ok(())
}

fn cmd_import(config: Config, csv: PathBuf) -> Result<()> {
    let stores = Stores::open(config)?;
    let rows = read_import_csv(&csv)?;
    let target = ImportTarget {
        reference: &stores.catalog,
        inventory: &stores.catalog,
        cycles: &stores.cycles,
        events: &stores.events,
    };
    let report = import_history(&target, &rows, &stores.config.profile_defaults(), Utc::now())?;

    for row in &report.rows {
        println!(
            "line {}: {} cycle #{}",
            row.line, row.substance_id, row.cycle_number
        );
    }
    println!(
        "✓ Imported {} events into {} cycles",
        report.rows.len(),
        report.cycles.len()
    );
    Ok(())
}

fn cmd_seed_demo(config: Config, force: bool) -> Result<()> {
    let path = config.catalog_path();
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "catalog already exists at {} (use --force to overwrite)",
            path.display()
        )));
    }

    build_demo_catalog().save(&path)?;
    println!("✓ Wrote demo catalog to {}", path.display());
    Ok(())
}

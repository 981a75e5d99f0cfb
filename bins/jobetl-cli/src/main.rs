use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobetl_core::{EtlEvent, EventRx, FormulaRegistry, ProfileSpec, Shard};
use jobetl_io::profile::{EtlProfile, OutputMode};
use jobetl_tx::{IntegrationPaths, SourceTemplate, SourceTemplates};
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "jobetl", version, about = "Job summary ETL")]
struct Args {
    /// ETL profile YAML; may be given several times
    #[arg(short, long = "profile", global = true)]
    profiles: Vec<PathBuf>,

    /// Log filter directive, e.g. `info` or `jobetl_io=debug`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log at info level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log at debug level
    #[arg(short, long, global = true)]
    debug: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load every pending document of the profile's datasets
    Process {
        /// Only these datasets; the others count as done
        #[arg(long, value_delimiter = ',')]
        datasets: Vec<String>,
        /// Number of cooperating processes
        #[arg(long, requires = "shard_index")]
        shard_total: Option<u64>,
        /// This process's share, `0..shard_total`
        #[arg(long, requires = "shard_total")]
        shard_index: Option<u64>,
        /// Do not record processed documents in the source
        #[arg(long)]
        no_mark: bool,
    },
    /// Create the output tables
    CreateTables {
        /// `sql` executes the DDL, `stdout` prints it
        #[arg(long, default_value = "stdout")]
        mode: OutputMode,
    },
    /// Print HTML documentation of the output tables
    Docs,
    /// Write aggregation and table definition files
    Aggregate,
    /// Write analytics engine integration files
    Integrate {
        /// Directory holding `roles.json` (default: profile root)
        #[arg(long)]
        config_dir: Option<PathBuf>,
        /// Output directory (default: profile root)
        #[arg(long)]
        build_dir: Option<PathBuf>,
        #[arg(long)]
        group_by_template: Option<PathBuf>,
        #[arg(long)]
        statistic_template: Option<PathBuf>,
    },
    /// Run the datasets' regression fixtures
    Regression {
        /// Rewrite the expected output of failing fixtures
        #[arg(long)]
        regenerate: bool,
    },
    /// Print the tool and profile versions
    Version,
}

impl Args {
    fn filter(&self) -> EnvFilter {
        let level = match (&self.log_level, self.debug, self.verbose, self.quiet) {
            (Some(level), ..) => level.as_str(),
            (None, true, _, _) => "debug",
            (None, false, true, _) => "info",
            (None, false, false, true) => "error",
            _ => return EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        };
        EnvFilter::new(level)
    }
}

/// Log dataset completions published on the event channel.
async fn consume_events(mut rx: EventRx) {
    while let Some(event) = rx.recv().await {
        match event {
            EtlEvent::AfterProcess { dataset, details, log } => {
                info!(dataset = %dataset, logged = log.is_some(), "{}", details.render());
            }
            EtlEvent::AfterProcessAll(stats) => match serde_json::to_string(&stats) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "could not serialize totals"),
            },
            EtlEvent::Message { .. } | EtlEvent::Error { .. } => {}
        }
    }
}

fn load_profile(
    path: &Path,
    command: &Command,
    events: Option<jobetl_core::EventTx>,
    cancel: &CancellationToken,
) -> Result<EtlProfile> {
    let mut spec = ProfileSpec::load(path)?;
    if let Command::Process {
        shard_total,
        shard_index,
        no_mark,
        ..
    } = command
    {
        if let (Some(total), Some(index)) = (shard_total, shard_index) {
            spec.processor.shard = Some(Shard::new(*total, *index)?);
        }
        if *no_mark {
            spec.processor.mark_processed = false;
        }
    }
    let profile = EtlProfile::new(spec, FormulaRegistry::new(), events)
        .with_context(|| format!("loading profile {}", path.display()))?;
    Ok(profile.with_shutdown(cancel.child_token()))
}

async fn run(profile: &EtlProfile, command: &Command) -> Result<()> {
    match command {
        Command::Process { datasets, .. } => {
            let names = (!datasets.is_empty()).then_some(datasets.as_slice());
            let report = profile.process_datasets(names).await?;
            if report.failed() {
                bail!("profile {} finished with failed datasets", profile.name());
            }
        }
        Command::CreateTables { mode } => {
            if let Some(ddl) = profile.create_output_tables(*mode).await? {
                println!("{ddl};");
            }
        }
        Command::Docs => {
            for page in profile.documentation() {
                println!("{page}");
            }
        }
        Command::Aggregate => {
            for path in profile.aggregate()? {
                println!("{}", path.display());
            }
        }
        Command::Integrate {
            config_dir,
            build_dir,
            group_by_template,
            statistic_template,
        } => {
            let mut paths = IntegrationPaths::under(&profile.spec().root);
            if let Some(dir) = config_dir {
                paths.config_dir = dir.clone();
            }
            if let Some(dir) = build_dir {
                paths.build_dir = dir.clone();
            }
            let templates = SourceTemplates {
                group_by: group_by_template.as_deref().map(SourceTemplate::load).transpose()?,
                statistic: statistic_template.as_deref().map(SourceTemplate::load).transpose()?,
            };
            for path in profile.integrate(Some(paths), &templates)? {
                println!("{}", path.display());
            }
        }
        Command::Regression { regenerate } => {
            let results = profile.regression_tests(*regenerate)?;
            let failed = results.iter().filter(|r| !r.passed).count();
            println!(
                "{}: {} regression tests, {} failed",
                profile.name(),
                results.len(),
                failed
            );
            if failed > 0 && !regenerate {
                bail!("{failed} regression tests failed");
            }
        }
        Command::Version => {
            println!("{} {}", profile.name(), profile.version());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::registry()
        .with(args.filter())
        .with(tracing_subscriber::fmt::layer())
        .init();

    if matches!(args.command, Command::Version) {
        println!("jobetl {}", env!("CARGO_PKG_VERSION"));
    }
    if args.profiles.is_empty() {
        if matches!(args.command, Command::Version) {
            return Ok(());
        }
        bail!("no profile given, use --profile <path>");
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing in-flight documents");
                cancel.cancel();
            }
        });
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let consumer = tokio::spawn(consume_events(rx));

    let mut result = Ok(());
    for path in &args.profiles {
        let profile = load_profile(path, &args.command, Some(tx.clone()), &cancel)?;
        if let Err(e) = run(&profile, &args.command).await {
            tracing::error!(profile = %profile.name(), error = %e, "command failed");
            result = Err(e);
        }
    }
    drop(tx);
    consumer.await?;
    result
}

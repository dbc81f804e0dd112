//! natal-pipeline: offline data preparation and training.
//!
//! | Env | Description |
//! |-----|-------------|
//! | NATAL_CONFIG | Config file (default `config/natal.toml`) |
//! | NATAL_DATA_DIR, NATAL_MAX_RECORDS, NATAL_USE_REMOTE | Override config keys |
//! | ASTRO_DB_* | Remote database, see `natal_core::remote` |
//! | RUST_LOG | Log filter (default `info`) |

use clap::{Parser, Subcommand};
use natal_core::PipelineConfig;
use natal_pipeline::{Pipeline, StageOutcome};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "natal-pipeline",
    version,
    about = "Clean birth records, derive chart features, encode and train the occupation model"
)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true, env = "NATAL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding every stage's input and output
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Consult the remote database (requires ASTRO_DB_BASE_URL)
    #[arg(long, global = true)]
    remote: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Normalize and filter raw person records
    Clean,
    /// Keep the first `max_records` cleaned records
    Reduce,
    /// Cast charts and write feature records
    Features,
    /// Fit the encoding schema and write the training matrix
    Prepare,
    /// Train and evaluate the classifier
    Train,
    /// Copy artifacts and a manifest to a directory
    Export {
        #[arg(short, long, default_value = "export")]
        out: PathBuf,
    },
    /// Run every stage from clean to train
    Run,
    /// Print the effective configuration as TOML
    InitConfig,
}

fn print_outcome(o: &StageOutcome) {
    println!(
        "{:<9} {:>6} records  from {}  -> {}",
        o.stage,
        o.records,
        o.source,
        o.output.display()
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if cli.remote {
        config.use_remote = true;
    }

    if let Command::InitConfig = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let pipeline = Pipeline::new(config)?;
    match cli.command {
        Command::Clean => print_outcome(&pipeline.clean().await?),
        Command::Reduce => print_outcome(&pipeline.reduce().await?),
        Command::Features => print_outcome(&pipeline.features().await?),
        Command::Prepare => print_outcome(&pipeline.prepare().await?),
        Command::Train => {
            let (outcome, report) = pipeline.train().await?;
            print_outcome(&outcome);
            print!("{report}");
        }
        Command::Run => {
            let (outcomes, report) = pipeline.run().await?;
            outcomes.iter().for_each(print_outcome);
            print!("{report}");
        }
        Command::Export { out } => {
            let manifest = pipeline.export(&out)?;
            println!("exported {} file(s) to {}", manifest.files.len(), out.display());
        }
        Command::InitConfig => {}
    }
    Ok(())
}

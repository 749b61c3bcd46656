use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use concord::config::Config;
use concord::log::{self, LogLevel};
use concord::{clog, Error, FileStore, Result, Run, Task};

/// Concord - task coordination for cooperating workers
#[derive(Parser, Debug)]
#[command(name = "concord")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONCORD_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.concord/concord.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Store file (defaults to store_path from the config, or ~/.concord/store.json)
    #[arg(short = 's', long)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Submit tasks from a JSON file (one task or an array)
    Submit {
        file: PathBuf,
    },

    /// Show tasks, workers, budget and open conflicts
    Status,

    /// Classify in-flight tasks without acting on them
    Scan,

    /// Run one monitor and escalation cycle
    Escalate,

    /// Show the budget, optionally setting a new ceiling
    Budget {
        /// New ceiling in cost units
        #[arg(long, conflicts_with = "clear")]
        ceiling: Option<u64>,

        /// Remove the ceiling
        #[arg(long)]
        clear: bool,
    },

    /// Acknowledge the near-limit budget checkpoint
    Checkpoint,

    /// Resolve a recorded conflict by evidence weight (all open ones if no id)
    Arbitrate {
        conflict: Option<String>,
    },

    /// Merge the outputs of a finished run into the final report
    Synthesize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Submission {
    Many(Vec<Task>),
    One(Box<Task>),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    log::init(cli.debug);
    let config = Config::load()?;
    if !cli.debug {
        if let Some(level) = config.log_level.as_deref().and_then(LogLevel::parse) {
            log::set_level(level);
        }
    }

    let store_path = match &cli.store {
        Some(path) => path.clone(),
        None => config.store_path()?,
    };
    clog!("concord {:?} (store {})", cli.command, store_path.display());
    let run = Run::new(Arc::new(FileStore::open(&store_path)?), config)?;

    match cli.command {
        Command::Submit { file } => {
            let text = std::fs::read_to_string(&file)?;
            let tasks = match serde_json::from_str(&text)? {
                Submission::Many(tasks) => tasks,
                Submission::One(task) => vec![*task],
            };
            print_json(&run.submit_all(tasks)?)
        }
        Command::Status => print_json(&run.status()?),
        Command::Scan => print_json(&run.monitor().scan()?),
        Command::Escalate => print_json(&run.tick()?),
        Command::Budget { ceiling, clear } => {
            if clear {
                print_json(&run.set_ceiling(None)?)
            } else if ceiling.is_some() {
                print_json(&run.set_ceiling(ceiling)?)
            } else {
                print_json(&run.budget()?)
            }
        }
        Command::Checkpoint => print_json(&run.acknowledge_checkpoint()?),
        Command::Arbitrate { conflict } => match conflict {
            Some(id) => print_json(&run.arbitrate(&id)?),
            None => print_json(&run.arbitrate_all()?),
        },
        Command::Synthesize => match run.synthesize() {
            Ok(report) => {
                print_json(&report)?;
                if !report.succeeded() {
                    std::process::exit(2);
                }
                Ok(())
            }
            Err(Error::IncompleteRun { pending }) => {
                eprintln!(
                    "run is not finished: {} task(s) still pending or in flight",
                    pending.len()
                );
                print_json(&pending)?;
                std::process::exit(3);
            }
            Err(e) => Err(e),
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

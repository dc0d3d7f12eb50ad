pub mod report;

use std::{
    io::{BufRead, Write},
    path::PathBuf,
};

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{level_filters::LevelFilter, warn};

use crate::{
    engine::{
        start_engine,
        storage::{
            entities::DomainBudget,
            store::{BehaviorStore, ExportDocument, JsonStore, StoreData},
        },
        telemetry::{Backend, HttpBackend},
    },
    utils::{
        dir::create_application_default_path,
        logging::{enable_logging, CLI_PREFIX, SERVE_PREFIX},
    },
};

use report::{print_budgets, print_stats};

const DEFAULT_BACKEND_URL: &str = "http://localhost:5000";

#[derive(Parser, Debug)]
#[command(name = "Tabwatch", version)]
#[command(about = "Monitors browsing behavior and enforces soft time limits", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(
        long,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
    /// This option is for debugging purposes only.
    #[arg(long = "log-console")]
    log_console: bool,
    #[arg(long = "log-filter")]
    log: Option<LevelFilter>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run the tracking engine, reading host events from stdin")]
    Serve {
        #[arg(long, default_value = DEFAULT_BACKEND_URL)]
        backend_url: String,
    },
    #[command(about = "Show today's stats and the most used domains")]
    Stats,
    #[command(about = "Export all captured data as a JSON document")]
    Export {
        #[arg(long, help = "Write to a file instead of stdout")]
        out: Option<PathBuf>,
    },
    #[command(about = "Import a previously exported JSON document, replacing the current store")]
    Import { file: PathBuf },
    #[command(about = "Delete all captured data, keeping budgets and settings")]
    Clear {
        #[arg(long, help = "Skip the confirmation prompt")]
        yes: bool,
    },
    #[command(about = "Manage distraction and productive time budgets")]
    Budget {
        #[command(subcommand)]
        command: BudgetCommand,
        #[arg(long, default_value = DEFAULT_BACKEND_URL)]
        backend_url: String,
    },
    #[command(about = "Toggle a behavior flag")]
    Set {
        flag: BehaviorFlag,
        state: FlagState,
    },
}

#[derive(Subcommand, Debug)]
enum BudgetCommand {
    #[command(about = "Add a budget for a site")]
    Add {
        url: String,
        #[arg(help = "Time limit in seconds")]
        limit_seconds: u64,
        #[arg(long, value_enum, default_value_t = BudgetList::Distraction)]
        list: BudgetList,
    },
    #[command(about = "List configured budgets")]
    List,
    #[command(about = "Remove every budget matching a site")]
    Remove {
        url: String,
        #[arg(long, value_enum, default_value_t = BudgetList::Distraction)]
        list: BudgetList,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BudgetList {
    Distraction,
    Productive,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BehaviorFlag {
    TrackingPaused,
    FocusMode,
    NotificationsEnabled,
    StrictMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FlagState {
    On,
    Off,
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let dir = args
        .dir
        .clone()
        .map_or_else(create_application_default_path, Ok)?;
    let prefix = match args.commands {
        Commands::Serve { .. } => SERVE_PREFIX,
        _ => CLI_PREFIX,
    };
    enable_logging(prefix, &dir, args.log, args.log_console)?;

    let store = JsonStore::new(dir.clone())?;

    match args.commands {
        Commands::Serve { backend_url } => start_engine(dir, backend_url).await,
        Commands::Stats => {
            let data = store.load().await?;
            print_stats(&data);
            Ok(())
        }
        Commands::Export { out } => export_data(&store, out).await,
        Commands::Import { file } => import_data(&store, &file).await,
        Commands::Clear { yes } => clear_data(&store, yes).await,
        Commands::Budget {
            command,
            backend_url,
        } => run_budget_command(&store, command, &backend_url).await,
        Commands::Set { flag, state } => set_flag(&store, flag, state).await,
    }
}

async fn export_data(store: &JsonStore, out: Option<PathBuf>) -> Result<()> {
    let document = store.export(Utc::now()).await?;
    let serialized = serde_json::to_string_pretty(&document)?;
    match out {
        Some(path) => {
            tokio::fs::write(&path, serialized).await?;
            println!("Exported to {}", path.display());
        }
        None => println!("{serialized}"),
    }
    Ok(())
}

async fn import_data(store: &JsonStore, file: &PathBuf) -> Result<()> {
    let contents = tokio::fs::read_to_string(file).await?;
    let document: ExportDocument = serde_json::from_str(&contents)?;
    store.import(document).await?;
    println!("Imported {}", file.display());
    Ok(())
}

async fn clear_data(store: &JsonStore, yes: bool) -> Result<()> {
    if !yes && !confirm("Delete all captured data? Budgets and settings are kept.")? {
        println!("Aborted");
        return Ok(());
    }
    store.clear().await?;
    println!("Captured data cleared");
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

async fn run_budget_command(
    store: &JsonStore,
    command: BudgetCommand,
    backend_url: &str,
) -> Result<()> {
    match command {
        BudgetCommand::Add {
            url,
            limit_seconds,
            list,
        } => {
            let budget = DomainBudget { url, limit_seconds };
            let data = store
                .update(Box::new(move |data| {
                    budgets_mut(data, list).push(budget);
                }))
                .await?;
            push_budgets(&data, list, backend_url).await;
            print_current(&data, list);
            Ok(())
        }
        BudgetCommand::Remove { url, list } => {
            let domain = crate::utils::domain::extract_domain(&url);
            let data = store
                .update(Box::new(move |data| {
                    budgets_mut(data, list).retain(|budget| budget.domain() != domain);
                }))
                .await?;
            push_budgets(&data, list, backend_url).await;
            print_current(&data, list);
            Ok(())
        }
        BudgetCommand::List => {
            let data = store.load().await?;
            print_budgets("Distraction budgets", &data.distraction_urls);
            print_budgets("Productive budgets", &data.productive_urls);
            Ok(())
        }
    }
}

fn budgets_mut(data: &mut StoreData, list: BudgetList) -> &mut Vec<DomainBudget> {
    match list {
        BudgetList::Distraction => &mut data.distraction_urls,
        BudgetList::Productive => &mut data.productive_urls,
    }
}

fn print_current(data: &StoreData, list: BudgetList) {
    match list {
        BudgetList::Distraction => print_budgets("Distraction budgets", &data.distraction_urls),
        BudgetList::Productive => print_budgets("Productive budgets", &data.productive_urls),
    }
}

/// Keeps the backend's copy of the budget lists in sync, best effort.
async fn push_budgets(data: &StoreData, list: BudgetList, backend_url: &str) {
    let backend = HttpBackend::new(backend_url.to_owned());
    let result = match list {
        BudgetList::Distraction => {
            backend
                .push_distraction_urls(data.distraction_urls.clone())
                .await
        }
        BudgetList::Productive => {
            backend
                .push_productive_urls(data.productive_urls.clone())
                .await
        }
    };
    if let Err(e) = result {
        warn!("Budget list upload failed, continuing: {e}");
    }
}

async fn set_flag(store: &JsonStore, flag: BehaviorFlag, state: FlagState) -> Result<()> {
    let enabled = state == FlagState::On;
    store
        .update(Box::new(move |data| {
            let slot = match flag {
                BehaviorFlag::TrackingPaused => &mut data.tracking_paused,
                BehaviorFlag::FocusMode => &mut data.focus_mode,
                BehaviorFlag::NotificationsEnabled => &mut data.notifications_enabled,
                BehaviorFlag::StrictMode => &mut data.strict_mode,
            };
            *slot = enabled;
        }))
        .await?;
    println!("{flag:?} is now {state:?}");
    Ok(())
}

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod check;
mod codec;
mod compare;
mod config;
mod correlate;
mod crypto;
mod db;
mod driver;
mod error;
mod graph;
mod history;
mod inventory;
mod orchestrator;
mod provisioner;
mod state;
mod validate;

#[cfg(test)]
mod test_support;

use compare::StateSource;
use config::{split_list, CompareSource, MigrationConfig};
use driver::{NodeProcessDriver, ProcessDriver};
use error::Result;

fn cli() -> Command {
    Command::new("ledger-migrator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Moves a tree of ledger nodes from the old storage layout to the new one")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging and executable output"),
        )
        .subcommand(
            Command::new("migrate")
                .about("Generate new nodes for every unmigrated old node")
                .arg(
                    Arg::new("address")
                        .short('a')
                        .long("address")
                        .help("Base address for generated nodes, incremented per node"),
                )
                .arg(
                    Arg::new("observers")
                        .short('o')
                        .long("observers")
                        .help("Comma-separated observer addresses"),
                )
                .arg(
                    Arg::new("keep-open")
                        .short('m')
                        .long("keep-open")
                        .action(ArgAction::SetTrue)
                        .help("Keep node stores open for the whole run"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Report nodes that cannot be migrated as they are")
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory for the checking_*.json reports (default: current)"),
                ),
        )
        .subcommand(
            Command::new("compare")
                .about("Compare old and new state of every migrated node")
                .arg(
                    Arg::new("threads")
                        .long("threads")
                        .value_parser(value_parser!(usize))
                        .help("Number of comparison workers"),
                )
                .arg(
                    Arg::new("source")
                        .long("source")
                        .value_parser(["store", "process"])
                        .help("Read state from the stores or the running executables"),
                ),
        )
        .subcommand(Command::new("validate").about("Exercise every migrated channel through the new executables"))
        .subcommand(
            Command::new("correlate")
                .about("Periodically compare trust lines reported by the old and new handlers")
                .arg(
                    Arg::new("period")
                        .long("period")
                        .value_parser(value_parser!(u64))
                        .help("Seconds between passes"),
                ),
        )
}

/// Environment settings with the subcommand's flags applied on top.
fn build_config(args: &ArgMatches) -> MigrationConfig {
    let mut config = MigrationConfig::from_env();
    if let Ok(Some(address)) = args.try_get_one::<String>("address") {
        config.base_address = Some(address.clone());
    }
    if let Ok(Some(observers)) = args.try_get_one::<String>("observers") {
        config.observers = split_list(observers);
    }
    if let Ok(Some(&true)) = args.try_get_one::<bool>("keep-open") {
        config.keep_open = true;
    }
    if let Ok(Some(&threads)) = args.try_get_one::<usize>("threads") {
        config.threads = threads.max(1);
    }
    if let Ok(Some(source)) = args.try_get_one::<String>("source") {
        if let Some(source) = CompareSource::parse(source) {
            config.compare_source = source;
        }
    }
    if let Ok(Some(&period)) = args.try_get_one::<u64>("period") {
        config.loop_period = Duration::from_secs(period);
    }
    config
}

fn driver_for(client: &Path, config: &MigrationConfig, verbose: bool) -> NodeProcessDriver {
    NodeProcessDriver::new(client, config.command_timeout).verbose(verbose)
}

async fn run(matches: &ArgMatches, verbose: bool) -> Result<()> {
    let (name, args) = match matches.subcommand() {
        Some(sub) => sub,
        None => return Ok(()),
    };
    let config = build_config(args);
    log::info!("Old infrastructure: {}", config.old_infrastructure_path.display());
    log::info!("New infrastructure: {}", config.new_infrastructure_path.display());

    match name {
        "migrate" => {
            let driver = driver_for(&config.migration_client_path, &config, verbose);
            let state = orchestrator::migrate(&config, &driver).await?;
            println!(
                "Migrated {}/{} nodes ({} skipped, {} failed)",
                state.summary.succeeded, state.summary.total, state.summary.skipped, state.summary.failed
            );
        }
        "check" => {
            let out_dir = args
                .get_one::<PathBuf>("out")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("."));
            let report = check::check(&config, &out_dir)?;
            println!("Checked {} nodes, {} errors", report.checked, report.state.errors.len());
        }
        "compare" => {
            let source = match config.compare_source {
                CompareSource::Store => StateSource::Store,
                CompareSource::Process => {
                    let old: Arc<dyn ProcessDriver> = Arc::new(driver_for(&config.old_client_path, &config, verbose));
                    let new: Arc<dyn ProcessDriver> = Arc::new(driver_for(&config.new_client_path, &config, verbose));
                    StateSource::Process { old, new }
                }
            };
            let report = compare::compare(&config, source).await?;
            println!(
                "Compared {}/{} nodes, {} with discrepancies",
                report.compared,
                report.total,
                report.verdicts.iter().filter(|v| !v.passed).count()
            );
        }
        "validate" => {
            let driver = driver_for(&config.new_client_path, &config, verbose);
            let report = validate::validate(&config, &driver).await?;
            println!(
                "Validated {}/{} nodes, {} failed",
                report.succeeded, report.total, report.failed
            );
        }
        "correlate" => correlate::run(&config).await?,
        other => log::warn!("Unknown command {}", other),
    }
    Ok(())
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let hours = (secs / 3600.0).floor();
    let minutes = ((secs - hours * 3600.0) / 60.0).floor();
    let seconds = secs - hours * 3600.0 - minutes * 60.0;
    format!("{:02}:{:02}:{:05.2}", hours as u64, minutes as u64, seconds)
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let matches = cli().get_matches();
    let verbose = matches.get_flag("verbose");
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let started = Instant::now();
    let outcome = run(&matches, verbose).await;
    println!("Finished in {}", format_elapsed(started.elapsed()));
    if let Err(e) = outcome {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

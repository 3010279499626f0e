use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::{info, LevelFilter};

use cmpsim::sim::config::HierarchyConfig;
use cmpsim::sim::factory::build_hierarchy;
use cmpsim::sim::trace::{load_trace, SyntheticTraffic};

#[derive(Parser)]
#[command(version, about)]
struct CmpsimArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(help = "Memory trace; synthetic traffic from [traffic] when omitted")]
    trace: Option<PathBuf>,
    #[arg(long, help = "Override sim.max_cycles")]
    max_cycles: Option<u64>,
    #[arg(long, help = "Log level (off, error, warn, info, debug, trace); overrides RUST_LOG")]
    log: Option<LevelFilter>,
    #[arg(long, help = "Write statistics JSON here instead of stdout")]
    stats: Option<PathBuf>,
}

pub fn main() -> anyhow::Result<()> {
    let argv = CmpsimArgs::parse();
    let mut logger = env_logger::Builder::from_default_env();
    if let Some(level) = argv.log {
        logger.filter_level(level);
    }
    logger.init();

    let text = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;
    let mut config: HierarchyConfig = text
        .parse()
        .with_context(|| format!("invalid config {}", argv.config_path.display()))?;
    if let Some(max_cycles) = argv.max_cycles {
        config.sim.max_cycles = max_cycles;
    }

    let mut hierarchy = build_hierarchy(&config).context("failed to build hierarchy")?;
    info!("{} stages, heartbeat every {} cycles", hierarchy.num_stages(), config.sim.heartbeat_interval);
    let summary = match &argv.trace {
        Some(path) => {
            let records = load_trace(path)
                .with_context(|| format!("failed to load trace {}", path.display()))?;
            info!("loaded {} trace records", records.len());
            hierarchy.run(records, None)?
        }
        None => {
            info!("no trace given, generating {} requests", config.traffic.requests);
            hierarchy.run(SyntheticTraffic::new(config.traffic.clone()), None)?
        }
    };

    let report = serde_json::json!({
        "summary": summary,
        "stages": hierarchy.stats(),
    });
    let rendered = serde_json::to_string_pretty(&report)?;
    match &argv.stats {
        Some(path) => fs::write(path, rendered)
            .with_context(|| format!("failed to write stats to {}", path.display()))?,
        None => println!("{}", rendered),
    }
    Ok(())
}

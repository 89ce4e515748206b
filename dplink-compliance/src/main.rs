//! DPLink compliance exerciser — entry point.
//!
//! ```text
//! dplink-compliance train                 Run a training sequence
//! dplink-compliance pattern --kind tps2   Inject a test pattern
//! dplink-compliance power --off           Receiver power control
//! dplink-compliance --gen-config          Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dplink_compliance::config::{ComplianceConfig, parse_rate};
use dplink_compliance::sim::simulated_link;
use dplink_core::{
    DetectReason, LaneCount, LinkSettings, LinkTrainer, PatternKind, TrainOptions,
};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "dplink-compliance", about = "DPLink link-layer compliance exerciser")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "dplink-compliance.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect and train against the simulated sink.
    Train,
    /// Inject a training or custom test pattern.
    Pattern {
        /// Pattern kind: "tps1", "tps2", "tps3", "custom".
        #[arg(long, default_value = "tps1")]
        kind: String,
    },
    /// Receiver power control.
    Power {
        /// Power the receiver down (D3) instead of up (D0).
        #[arg(long)]
        off: bool,
    },
}

// ── Main ─────────────────────────────────────────────────────────

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ComplianceConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = ComplianceConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("dplink-compliance v{}", env!("CARGO_PKG_VERSION"));

    let (mut link, _sink) = simulated_link(&config.sink);
    link.detect(DetectReason::Manual)?;

    match cli.command.unwrap_or(Command::Train) {
        Command::Train => {
            let rate = parse_rate(&config.link.rate).ok_or("unknown link rate in config")?;
            let lanes = LaneCount::try_from(config.link.lanes)?;
            let mut requested = LinkSettings::new(rate, lanes);
            requested.spread = config.link.spread;

            let opts = TrainOptions {
                requested,
                skip_video_pattern: rate != dplink_core::LinkRate::Rbr,
                fresh_phy: true,
            };
            match LinkTrainer::train(&mut link, opts) {
                Ok(outcome) => {
                    println!(
                        "trained at {} after {} attempt(s), {} fallback step(s)",
                        outcome.settings, outcome.attempts, outcome.fallback_steps
                    );
                }
                Err(e) => {
                    println!("training failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Pattern { kind } => {
            let pattern = match kind.as_str() {
                "tps1" => PatternKind::Training1,
                "tps2" => PatternKind::Training2,
                "tps3" => PatternKind::Training3,
                "custom" => PatternKind::Custom80([0xAA; 10]),
                other => return Err(format!("unknown pattern kind: {other}").into()),
            };
            LinkTrainer::set_test_pattern(&mut link, pattern)?;
            println!("pattern {kind} driven");
        }
        Command::Power { off } => {
            LinkTrainer::set_power(&mut link, !off)?;
            println!("receiver powered {}", if off { "down (D3)" } else { "up (D0)" });
        }
    }

    Ok(())
}

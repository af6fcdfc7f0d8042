//! FEC recovery over simulated links of varying quality

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use fpvlink_core::FecProfile;
use fpvlink_sim::{scenarios, SimulationPresets};

#[derive(Parser, Debug)]
#[command(name = "link_sim", about = "Simulates erasure-coded video over lossy radio links")]
struct Args {
    /// Blocks to send per preset
    #[arg(short, long, default_value_t = 500)]
    blocks: u32,

    /// Data fragments per block
    #[arg(short = 'k', long, default_value_t = 8)]
    data: u8,

    /// Total fragments per block
    #[arg(short = 'n', long, default_value_t = 12)]
    total: u8,

    #[arg(long, default_value_t = 1024)]
    fragment_size: usize,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let profile = FecProfile::new(args.data, args.total)?;

    println!("{}", "fpvlink Link Simulation".bright_blue().bold());
    println!("{}", "=======================".bright_blue());
    println!(
        "{} blocks of {}/{} fragments, {} bytes each",
        args.blocks,
        profile.data_fragments(),
        profile.total_fragments(),
        args.fragment_size
    );

    let style = ProgressStyle::with_template("{prefix:>8} [{bar:40}] {pos}/{len}")?.progress_chars("=> ");
    for (name, mut conditions) in SimulationPresets::all() {
        conditions.seed = args.seed;
        println!("{}", format!("\n>>> {} conditions", name).bright_green().bold());
        println!("Packet Loss: {}%", (conditions.packet_loss * 100.0) as u32);
        println!("Corruption: {}%", (conditions.corruption * 100.0) as u32);

        let progress = ProgressBar::new(args.blocks as u64).with_style(style.clone()).with_prefix(name);
        let report = scenarios::fec_recovery(profile, conditions, args.blocks, args.fragment_size, &progress)?;

        let ratio = format!("{:.1}%", report.delivery_ratio() * 100.0);
        let ratio = if report.delivery_ratio() >= 0.95 {
            ratio.bright_green()
        } else if report.delivery_ratio() >= 0.75 {
            ratio.bright_yellow()
        } else {
            ratio.bright_red()
        };
        println!("Delivered: {}/{} ({})", report.delivered, report.blocks, ratio);
        println!("Rebuilt from parity: {}", report.recovered_with_parity);
        println!("Lost: {}", report.lost);
        println!(
            "Frames: {} sent, {} dropped, {} rejected",
            report.frames_sent, report.frames_dropped, report.frames_rejected
        );
        if report.mismatched > 0 {
            println!("{}", format!("Corrupted blocks delivered: {}", report.mismatched).bright_red().bold());
        }
    }

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use replaycast::codec::FRAME_RATE;
use replaycast::replay::{load_replay_file, pack_checksum, verify_checksum};

#[derive(Debug, Parser)]
#[command(name = "replaycast")]
#[command(about = "Offline replay-to-video transcoder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a replay file, verify its checksum, and print a summary.
    Inspect { replay: PathBuf },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { replay } => run_inspect(&replay),
    }
}

fn run_inspect(replay_path: &Path) -> Result<()> {
    let pack = load_replay_file(replay_path)?;
    let ticks = pack.total_ticks();

    println!(
        "OK: {} (room {}, {} ticks, {:.2}s at {} fps)",
        replay_path.display(),
        pack.room_id,
        ticks,
        f64::from(ticks) / f64::from(FRAME_RATE),
        FRAME_RATE
    );
    println!(
        "Players: {} vs {} ({} / {})",
        pack.nicknames[0], pack.nicknames[1], pack.partial_public_ips[0], pack.partial_public_ips[1]
    );
    println!("Chat events: {}", pack.chats.len());
    if verify_checksum(&pack) {
        println!("Checksum: ok");
    } else {
        println!(
            "Checksum: MISMATCH (stored {}, recomputed {}) - conversion would still proceed",
            pack.hash,
            pack_checksum(&pack)?
        );
    }
    Ok(())
}

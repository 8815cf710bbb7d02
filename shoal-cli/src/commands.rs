//! CLI command implementations

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Subcommand;
use shoal_core::config::ShoalConfig;
use shoal_core::engine::{
    AddTorrentParams, EngineEvent, EngineHandle, EngineSnapshot, SessionState, SessionStatus,
    spawn_engine,
};
use shoal_core::torrent::parsing::parse_torrent_bytes;
use shoal_core::torrent::{Bitfield, InfoHash, TorrentCreator, TorrentMetadata};
use shoal_core::{Result, ShoalError};
use tokio::fs;
use tokio::sync::broadcast::error::RecvError;

/// Interval between progress lines while downloading.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Print the contents of a .torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Create a .torrent from a file or directory
    Create {
        /// File or directory to share
        path: PathBuf,
        /// Tracker announce URL (repeat for fallbacks)
        #[arg(short, long, required = true)]
        announce: Vec<String>,
        /// Piece length in bytes
        #[arg(long, default_value_t = shoal_core::torrent::DEFAULT_PIECE_SIZE)]
        piece_length: u32,
        /// Where to write the .torrent
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Download a torrent, optionally staying on to seed
    Download {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Directory the torrent's files are placed under
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Snapshot file used to resume without rehashing
        #[arg(long)]
        state: Option<PathBuf>,
        /// Keep seeding after the download completes (until Ctrl-C)
        #[arg(long)]
        seed: bool,
        /// Download only these files, by the index `info` prints (e.g. 0,2)
        #[arg(long, value_delimiter = ',')]
        files: Vec<usize>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Info { torrent } => show_info(&torrent).await,
        Commands::Create {
            path,
            announce,
            piece_length,
            output,
        } => create_torrent(&path, announce, piece_length, &output).await,
        Commands::Download {
            torrent,
            output,
            state,
            seed,
            files,
        } => download(&torrent, output, state, seed, files).await,
    }
}

/// Print a torrent's descriptor
///
/// # Errors
/// - `ShoalError::Io` - Torrent file unreadable
/// - `ShoalError::Torrent` - Not a valid torrent
pub async fn show_info(torrent: &Path) -> Result<()> {
    let metadata = read_torrent(torrent).await?;
    println!("{}", describe(&metadata));
    Ok(())
}

/// Hash a file or directory into a new .torrent
///
/// # Errors
/// - `ShoalError::Torrent` - Source unreadable, empty, or bad piece length
/// - `ShoalError::Io` - Output could not be written
pub async fn create_torrent(
    path: &Path,
    announce: Vec<String>,
    piece_length: u32,
    output: &Path,
) -> Result<()> {
    let creator = TorrentCreator::with_piece_size(piece_length);
    let created = if fs::metadata(path).await?.is_dir() {
        creator.create_from_directory(path, announce).await?
    } else {
        creator.create_from_file(path, announce).await?
    };

    fs::write(output, &created.bytes).await?;
    println!("Created {}", output.display());
    println!("{}", describe(&created.metadata));
    Ok(())
}

/// Run the engine on one torrent, printing progress until it completes
///
/// With `seed`, keeps serving peers after completion until Ctrl-C. With a
/// `state` file, the verified pieces of an earlier run are trusted and the
/// file is rewritten on exit. A non-empty `files` limits the download to
/// those files; otherwise a selection saved in `state` is reused.
///
/// # Errors
/// - `ShoalError::Torrent` - Invalid torrent or engine failure
/// - `ShoalError::Snapshot` - State file unreadable or unwritable
pub async fn download(
    torrent: &Path,
    output: PathBuf,
    state: Option<PathBuf>,
    seed: bool,
    files: Vec<usize>,
) -> Result<()> {
    let metadata = read_torrent(torrent).await?;
    let previous = match &state {
        Some(path) if fs::try_exists(path).await? => Some(EngineSnapshot::load(path).await?),
        _ => None,
    };

    let mut params = AddTorrentParams::new(metadata, output).with_torrent_path(torrent);
    if let Some(verified) = previous
        .as_ref()
        .and_then(|snapshot| resume_bitfield(snapshot, &params.metadata))
    {
        params = params.with_resume(verified);
    }
    if let Some(selection) = file_selection(files, previous.as_ref(), &params.metadata) {
        params = params.with_file_selection(selection);
    }

    let engine = spawn_engine(ShoalConfig::from_env()).await?;
    let mut events = engine.subscribe();
    let info_hash = engine.add_torrent(params).await?;
    println!(
        "Downloading {} ({}) on port {}",
        torrent.display(),
        info_hash,
        engine.listen_addr().await?.port()
    );

    let outcome = watch_session(&engine, &mut events, info_hash, seed).await;

    if let Some(path) = &state {
        engine.snapshot().await?.save(path).await?;
        println!("Saved state to {}", path.display());
    }
    engine.shutdown().await?;
    outcome
}

/// Prints progress until the session completes (or Ctrl-C when seeding).
async fn watch_session(
    engine: &EngineHandle,
    events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    info_hash: InfoHash,
    seed: bool,
) -> Result<()> {
    let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let status = engine.session(info_hash).await?;
    if status.is_complete() && !seed {
        println!("{}", format_status(&status));
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("Interrupted");
                return Ok(());
            }
            _ = progress.tick() => {
                println!("{}", format_status(&engine.session(info_hash).await?));
            }
            event = events.recv() => match event {
                Ok(EngineEvent::StateChanged { state: SessionState::Seeding, .. }) => {
                    println!("{}", format_status(&engine.session(info_hash).await?));
                    if !seed {
                        return Ok(());
                    }
                    println!("Seeding; press Ctrl-C to stop");
                }
                Ok(EngineEvent::Error { info_hash, message }) => {
                    return Err(ShoalError::SessionFailed { info_hash, reason: message });
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

async fn read_torrent(path: &Path) -> Result<TorrentMetadata> {
    let bytes = fs::read(path).await?;
    Ok(parse_torrent_bytes(&bytes)?)
}

/// Verified set recorded for this torrent in an earlier run, if usable.
fn resume_bitfield(snapshot: &EngineSnapshot, metadata: &TorrentMetadata) -> Option<Bitfield> {
    let torrent = snapshot.find(metadata.info_hash)?;
    let verified = torrent.verified_bitfield()?;
    (verified.len() == metadata.piece_count()).then_some(verified)
}

/// Files named on the command line, else those saved for this torrent.
fn file_selection(
    files: Vec<usize>,
    snapshot: Option<&EngineSnapshot>,
    metadata: &TorrentMetadata,
) -> Option<Vec<usize>> {
    if !files.is_empty() {
        return Some(files);
    }
    snapshot?.find(metadata.info_hash)?.selected_files.clone()
}

fn describe(metadata: &TorrentMetadata) -> String {
    let mut lines = vec![
        format!("Name:         {}", metadata.name),
        format!("Info hash:    {}", metadata.info_hash),
        format!("Total size:   {} bytes", metadata.total_length),
        format!(
            "Pieces:       {} x {} bytes",
            metadata.piece_count(),
            metadata.piece_length
        ),
    ];
    for (tier, urls) in metadata.announce_tiers.iter().enumerate() {
        lines.push(format!("Tier {tier}:       {}", urls.join(", ")));
    }
    if metadata.multi_file {
        lines.push(format!("Files ({}):", metadata.files.len()));
        for (index, file) in metadata.files.iter().enumerate() {
            lines.push(format!(
                "  [{index}] {} ({} bytes)",
                file.path.join("/"),
                file.length
            ));
        }
    }
    lines.join("\n")
}

fn format_status(status: &SessionStatus) -> String {
    format!(
        "[{}] {:5.1}% {}/{} pieces  down {}  up {}  peers {}  ratio {:.2}",
        status.state,
        status.progress() * 100.0,
        status.pieces_verified,
        status.pieces_wanted,
        status.download_rate_formatted(),
        status.upload_rate_formatted(),
        status.connected_peers,
        status.ratio()
    )
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use walkdir::WalkDir;

use waveprint::audio;
use waveprint::config::AppConfig;
use waveprint::db::models::NewTrack;
use waveprint::engine::{Engine, EngineConfig, QueryOptions, TrackMatch};
use waveprint::fingerprint::{self, Fingerprint};
use waveprint::SUPPORTED_EXTENSIONS;

#[derive(Parser)]
#[command(name = "waveprint", version, about = "Perceptual audio similarity search")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index audio files and directories
    Ingest {
        /// Files or directories to index
        paths: Vec<String>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Rank indexed tracks by acoustic similarity to a clip
    Query {
        /// Query audio file
        file: PathBuf,

        /// Minimum shared bands for a candidate (defaults from config)
        #[arg(long)]
        threshold: Option<usize>,

        /// Number of results
        #[arg(short = 'n', long)]
        top: Option<usize>,

        /// Compare against every indexed fingerprint (slow, exhaustive)
        #[arg(long)]
        search_all: bool,

        /// Use every query fingerprint instead of the configured cap
        #[arg(long)]
        all_signatures: bool,
    },

    /// Delete every indexed track, fingerprint and hash bin
    Reset,

    /// List indexed tracks
    List {
        /// Substring filter over artist, title and path
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Show index statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(waveprint::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let engine_config = EngineConfig {
        fingerprint: config.fingerprint.clone(),
        index: config.index.clone(),
    };
    let mut engine =
        Engine::open(&db_path, engine_config).context("Failed to open database")?;

    match cli.command {
        Commands::Ingest { paths, jobs } => {
            let jobs = if jobs > 0 { jobs } else { config.resolve_workers() };
            ingest(&mut engine, &paths, jobs)?;
        }
        Commands::Query {
            file,
            threshold,
            top,
            search_all,
            all_signatures,
        } => {
            let opts = QueryOptions {
                threshold,
                top,
                search_all,
                all_signatures,
                cancel: None,
            };
            let matches = engine
                .find_similar_from_file(&file, &opts)
                .with_context(|| format!("Query failed for {}", file.display()))?;
            print_matches(&matches);
        }
        Commands::Reset => {
            engine.reset()?;
            println!("Index cleared.");
        }
        Commands::List { filter } => {
            let tracks = engine.list_tracks(filter.as_deref())?;
            print_tracks(&tracks);
        }
        Commands::Stats => {
            let stats = engine.index_stats()?;
            println!("Tracks:       {}", stats.tracks);
            println!("Fingerprints: {}", stats.fingerprints);
            println!("Hash bins:    {}", stats.hash_bins);
        }
    }

    Ok(())
}

/// Walk the given paths and index every supported audio file.
///
/// Decoding and fingerprinting run on a rayon pool in chunks; inserts go
/// through the engine sequentially (single writer). Chunked processing
/// keeps memory bounded and makes progress resumable.
fn ingest(engine: &mut Engine, paths: &[String], jobs: usize) -> Result<()> {
    let files = collect_audio_files(paths);
    if files.is_empty() {
        println!("No audio files found.");
        return Ok(());
    }

    log::info!("Indexing {} files with {} workers", files.len(), jobs);

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .unwrap();

    let sample_rate = engine.config().fingerprint.sample_rate;
    let fp_config = engine.config().fingerprint.clone();

    let mut indexed: u64 = 0;
    let mut skipped: u64 = 0;
    let mut failed: u64 = 0;

    let chunk_size = jobs * 2;
    for chunk in files.chunks(chunk_size) {
        let extracted: Vec<_> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|path| {
                    let result = extract_file(path, sample_rate, &fp_config);
                    pb.inc(1);
                    (path, result)
                })
                .collect()
        });

        for (path, result) in extracted {
            match result {
                Ok((track, fingerprints)) => {
                    match engine.insert_fingerprinted(track, &fingerprints) {
                        Ok(outcome) if outcome.fingerprints == 0 => skipped += 1,
                        Ok(_) => indexed += 1,
                        Err(e) => {
                            log::error!("Failed to index {}: {}", path.display(), e);
                            failed += 1;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Failed to decode {}: {}", path.display(), e);
                    failed += 1;
                }
            }
        }

        pb.set_message(format!("{} indexed, {} failed", indexed, failed));
    }

    pb.finish_with_message(format!(
        "Done: {} indexed, {} too short, {} failed",
        indexed, skipped, failed
    ));
    Ok(())
}

/// Decode one file and extract its fingerprints (runs on the worker pool).
fn extract_file(
    path: &Path,
    sample_rate: u32,
    fp_config: &waveprint::config::FingerprintConfig,
) -> Result<(NewTrack, Vec<Fingerprint>)> {
    let pcm = audio::load_samples(path, sample_rate)?;
    let (_, fingerprints) = fingerprint::create_fingerprints(&pcm, fp_config);
    let duration_ms = pcm.len() as i64 * 1000 / sample_rate as i64;

    let track = NewTrack {
        album_id: None,
        artist: None,
        title: path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned()),
        file_path: path.to_string_lossy().into_owned(),
        duration_ms,
        tags: Default::default(),
    };
    Ok((track, fingerprints))
}

/// Gather every supported audio file under the given arguments, sorted for
/// a stable ingest order. Plain file arguments are accepted as-is.
fn collect_audio_files(paths: &[String]) -> Vec<PathBuf> {
    fn supported(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
    }

    let mut files: Vec<PathBuf> = paths
        .iter()
        .flat_map(|root| WalkDir::new(root).follow_links(true))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| supported(path))
        .collect();
    files.sort();
    files
}

/// Print a ranked result table.
fn print_matches(matches: &[TrackMatch]) {
    if matches.is_empty() {
        println!("No matches.");
        return;
    }

    println!(
        "{:>4} {:>6} {:>8} {:>7} {:>6}  {}",
        "Rank", "Sim", "MinHam", "Votes", "Cands", "Track"
    );
    println!("{}", "-".repeat(80));

    for (rank, m) in matches.iter().enumerate() {
        let label = match (&m.track.artist, &m.track.title) {
            (Some(artist), Some(title)) => format!("{} - {}", artist, title),
            (None, Some(title)) => title.clone(),
            _ => m.track.file_path.clone(),
        };
        println!(
            "{:>4} {:>5.1}% {:>8} {:>7} {:>6}  {}",
            rank + 1,
            m.stats.similarity * 100.0,
            m.stats.min_hamming_distance,
            m.stats.total_table_votes,
            m.stats.candidate_count,
            label,
        );
    }
}

/// Print the track listing.
fn print_tracks(tracks: &[waveprint::db::models::Track]) {
    if tracks.is_empty() {
        println!("No tracks indexed.");
        return;
    }

    println!("{:>6} {:>9}  {}", "Id", "Duration", "Track");
    println!("{}", "-".repeat(80));
    for t in tracks {
        let secs = t.duration_ms as f64 / 1000.0;
        let label = match (&t.artist, &t.title) {
            (Some(artist), Some(title)) => format!("{} - {}", artist, title),
            (None, Some(title)) => title.clone(),
            _ => t.file_path.clone(),
        };
        println!("{:>6} {:>8.1}s  {}", t.id, secs, label);
    }
    println!();
    println!("{} tracks", tracks.len());
}

//! Repository facade.
//!
//! An [`Engine`] owns the index store, the permutation table and the
//! fingerprinting configuration, and exposes the public ingestion and query
//! operations. Ingestion is single-writer (`&mut self`); queries are
//! read-only and may run in parallel.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::audio::{self, DecodeError};
use crate::config::{ConfigError, FingerprintConfig, IndexConfig};
use crate::db::models::{IndexedFingerprint, NewTrack, Track};
use crate::db::{Database, StoreError};
use crate::fingerprint::{self, Fingerprint};
use crate::minhash::permutations::{PermutationError, Permutations};
use crate::minhash::Sketcher;
use crate::query::{self, CancelToken, QueryError, QueryParams, QueryStats};

#[derive(Error, Debug)]
pub enum EngineError {
    /// The clip yields fewer STFT frames than one fingerprint tile.
    #[error("clip is too short to fingerprint")]
    AudioTooShort,
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The database was built with different parameters or permutations.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<QueryError> for EngineError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Store(s) => EngineError::Store(s),
            QueryError::Cancelled => EngineError::Cancelled,
        }
    }
}

impl From<PermutationError> for EngineError {
    fn from(e: PermutationError) -> Self {
        match e {
            PermutationError::Io(io) => EngineError::Store(StoreError::Read(io.to_string())),
            other => EngineError::SchemaMismatch(other.to_string()),
        }
    }
}

/// Full engine configuration: extraction plus index layout.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub fingerprint: FingerprintConfig,
    pub index: IndexConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fingerprint.validate()?;
        self.index.validate()
    }
}

/// Per-query knobs. Defaults fall back to the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Override of the configured vote threshold.
    pub threshold: Option<usize>,
    /// Bypass LSH lookups and compare against every indexed fingerprint.
    pub search_all: bool,
    /// Keep all query fingerprints instead of capping at
    /// `max_signature_count`. Unbounded clips cost proportionally more.
    pub all_signatures: bool,
    /// Override of the configured result cap.
    pub top: Option<usize>,
    pub cancel: Option<CancelToken>,
}

/// Result of indexing one clip.
#[derive(Debug)]
pub struct IngestOutcome {
    pub track_id: i64,
    /// Zero for clips shorter than one tile; the track exists but cannot
    /// match any query.
    pub fingerprints: usize,
}

/// One ranked query result.
#[derive(Debug, Clone)]
pub struct TrackMatch {
    pub track: Track,
    pub stats: QueryStats,
}

/// Index store counters, for display.
#[derive(Debug)]
pub struct IndexStats {
    pub tracks: i64,
    pub fingerprints: i64,
    pub hash_bins: i64,
}

pub struct Engine {
    db: Database,
    permutations: Permutations,
    config: EngineConfig,
}

impl Engine {
    /// Open (or create) a database and its permutation table.
    ///
    /// The permutation file lives next to the database and is part of its
    /// identity; an existing table with different dimensions is a schema
    /// mismatch.
    pub fn open(db_path: &Path, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let db = Database::open(db_path)?;
        let permutations = Permutations::load_or_generate(
            &permutation_path(db_path),
            config.index.signature_length(),
            config.fingerprint.signature_bits(),
            config.index.permutation_seed,
        )?;
        let engine = Self {
            db,
            permutations,
            config,
        };
        engine.check_schema()?;
        Ok(engine)
    }

    /// In-memory engine with freshly generated permutations. Used by tests;
    /// nothing is persisted.
    pub fn open_in_memory(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let db = Database::open_in_memory()?;
        let permutations = Permutations::generate(
            config.index.signature_length(),
            config.fingerprint.signature_bits(),
            config.index.permutation_seed,
        );
        Ok(Self {
            db,
            permutations,
            config,
        })
    }

    fn check_schema(&self) -> Result<(), EngineError> {
        let expected = self.config.fingerprint.signature_bits();
        if let Some(stored) = self.db.signature_length()? {
            if stored != expected {
                return Err(EngineError::SchemaMismatch(format!(
                    "stored signatures are {stored} bits, configuration expects {expected}"
                )));
            }
        }
        let tables = self.config.index.hash_tables;
        if let Some(stored) = self.db.hash_table_count()? {
            if stored != tables {
                return Err(EngineError::SchemaMismatch(format!(
                    "index was built with {stored} hash tables, configuration expects {tables}"
                )));
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fingerprint a clip and index it. All writes happen in one
    /// transaction; on failure the track stays out of the queryable set.
    ///
    /// A clip shorter than one tile still inserts the track, with zero
    /// fingerprints. Callers treat that as "not indexable", not an error.
    pub fn ingest_track(
        &mut self,
        track: NewTrack,
        pcm: &[f32],
    ) -> Result<IngestOutcome, EngineError> {
        let (_, fingerprints) = fingerprint::create_fingerprints(pcm, &self.config.fingerprint);
        self.insert_fingerprinted(track, &fingerprints)
    }

    /// Index a clip whose fingerprints were already extracted (e.g. on a
    /// worker pool). Sketching and all store writes happen here, behind the
    /// single writer.
    pub fn insert_fingerprinted(
        &mut self,
        track: NewTrack,
        fingerprints: &[Fingerprint],
    ) -> Result<IngestOutcome, EngineError> {
        if fingerprints.is_empty() {
            log::warn!("{}: too short to fingerprint, indexing metadata only", track.file_path);
            let track_id = self.db.insert_track(&track)?;
            return Ok(IngestOutcome {
                track_id,
                fingerprints: 0,
            });
        }

        let sketcher = Sketcher::new(&self.permutations);
        let l = self.config.index.hash_tables;
        let b = self.config.index.hash_keys_per_table;

        let indexed: Vec<IndexedFingerprint> = fingerprints
            .iter()
            .map(|fp| {
                let signature = sketcher.compute_signature(&fp.bits);
                IndexedFingerprint {
                    song_order: fp.song_order as i64,
                    signature: fp.bits.clone(),
                    band_keys: sketcher.group_to_bands(&signature, l, b),
                }
            })
            .collect();

        let track_id = self.db.insert_indexed_track(&track, &indexed)?;
        log::debug!(
            "indexed track {} with {} fingerprints",
            track_id,
            indexed.len()
        );
        Ok(IngestOutcome {
            track_id,
            fingerprints: indexed.len(),
        })
    }

    /// Rank indexed tracks by acoustic similarity to a mono PCM clip.
    pub fn find_similar_from_samples(
        &self,
        pcm: &[f32],
        opts: &QueryOptions,
    ) -> Result<Vec<TrackMatch>, EngineError> {
        let index = &self.config.index;
        let threshold = opts.threshold.unwrap_or(index.threshold_tables);
        if threshold > index.hash_tables {
            return Err(EngineError::InvalidConfig(ConfigError::ThresholdOutOfRange {
                threshold,
                tables: index.hash_tables,
            }));
        }

        let (_, mut fingerprints) =
            fingerprint::create_fingerprints(pcm, &self.config.fingerprint);
        if fingerprints.is_empty() {
            return Err(EngineError::AudioTooShort);
        }
        if !opts.all_signatures && fingerprints.len() > index.max_signature_count {
            log::debug!(
                "query clip produced {} fingerprints, truncating to {}",
                fingerprints.len(),
                index.max_signature_count
            );
            fingerprints.truncate(index.max_signature_count);
        }

        let sketcher = Sketcher::new(&self.permutations);
        let params = QueryParams {
            hash_tables: index.hash_tables,
            hash_keys_per_table: index.hash_keys_per_table,
            threshold,
            search_all: opts.search_all,
            top: opts.top.unwrap_or(index.top_candidates),
            ordering_blend: index.ordering_blend,
            cancel: opts.cancel.as_ref(),
        };
        let ranked = query::query(&self.db, &sketcher, &fingerprints, &params)?;

        let ids: Vec<i64> = ranked.iter().map(|(id, _)| *id).collect();
        let tracks: std::collections::HashMap<i64, Track> = self
            .db
            .read_tracks_by_id(&ids)?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        Ok(ranked
            .into_iter()
            .filter_map(|(id, stats)| {
                let track = tracks.get(&id).cloned();
                if track.is_none() {
                    log::warn!("ranked track {id} has no metadata row");
                }
                track.map(|track| TrackMatch { track, stats })
            })
            .collect())
    }

    /// Decode a file, resample to the configured rate, and query.
    pub fn find_similar_from_file(
        &self,
        path: &Path,
        opts: &QueryOptions,
    ) -> Result<Vec<TrackMatch>, EngineError> {
        let pcm = audio::load_samples(path, self.config.fingerprint.sample_rate)?;
        self.find_similar_from_samples(&pcm, opts)
    }

    /// Clear every indexed track. The permutation table survives, so a
    /// re-ingested corpus produces identical rankings.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        self.db.reset()?;
        log::info!("database reset");
        Ok(())
    }

    pub fn count_tracks(&self) -> Result<i64, EngineError> {
        Ok(self.db.count_tracks()?)
    }

    pub fn list_tracks(&self, filter: Option<&str>) -> Result<Vec<Track>, EngineError> {
        Ok(self.db.read_tracks(filter)?)
    }

    pub fn index_stats(&self) -> Result<IndexStats, EngineError> {
        Ok(IndexStats {
            tracks: self.db.count_tracks()?,
            fingerprints: self.db.count_fingerprints()?,
            hash_bins: self.db.count_hash_bins()?,
        })
    }
}

/// The permutation table lives next to the database file.
fn permutation_path(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "waveprint.db".to_string());
    name.push_str(".perms");
    db_path.with_file_name(name)
}

use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

/// Invalid engine parameters. Raised at call entry, never mid-operation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("fingerprint length {0} is not a power of two")]
    TileNotPowerOfTwo(usize),
    #[error("frequency bins ({bins}) must equal fingerprint length ({frames}) for a square tile")]
    NonSquareTile { frames: usize, bins: usize },
    #[error("window_size and overlap must be nonzero")]
    ZeroWindow,
    #[error("frequency range [{start}, {end}] must be positive and increasing")]
    FrequencyRange { start: f32, end: f32 },
    #[error("top_wavelets {top} exceeds tile coefficient count {max}")]
    TopWaveletsOutOfRange { top: usize, max: usize },
    #[error("hash_tables and hash_keys_per_table must be nonzero")]
    ZeroBands,
    #[error("threshold_tables {threshold} exceeds hash table count {tables}")]
    ThresholdOutOfRange { threshold: usize, tables: usize },
}

/// Parameters of the fingerprint extraction pipeline.
///
/// These are part of the database's identity: fingerprints produced with a
/// different configuration are not comparable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Expected PCM rate of the mono input stream.
    pub sample_rate: u32,
    /// STFT window length in samples.
    pub window_size: usize,
    /// STFT hop in samples.
    pub overlap: usize,
    /// Tile width in spectrogram frames. Must be a power of two.
    pub fingerprint_length: usize,
    /// Frequency bins of the log-spaced grid. Must equal `fingerprint_length`.
    pub frequency_bins: usize,
    /// Lower edge of the log frequency grid in Hz.
    pub start_frequency: f32,
    /// Upper edge of the log frequency grid in Hz.
    pub end_frequency: f32,
    /// Base of the logarithmic frequency grid.
    pub log_base: f32,
    /// Number of wavelet coefficients retained per tile.
    pub top_wavelets: usize,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            sample_rate: 5512,
            window_size: 2048,
            overlap: 64,
            fingerprint_length: 32,
            frequency_bins: 32,
            start_frequency: 318.0,
            end_frequency: 2000.0,
            log_base: 2.0,
            top_wavelets: 200,
        }
    }
}

impl FingerprintConfig {
    /// Length in bits of one encoded fingerprint (two bits per coefficient).
    pub fn signature_bits(&self) -> usize {
        2 * self.fingerprint_length * self.frequency_bins
    }

    /// Number of wavelet coefficients in one tile.
    pub fn tile_coefficients(&self) -> usize {
        self.fingerprint_length * self.frequency_bins
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 || self.overlap == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if !self.fingerprint_length.is_power_of_two() {
            return Err(ConfigError::TileNotPowerOfTwo(self.fingerprint_length));
        }
        if self.frequency_bins != self.fingerprint_length {
            return Err(ConfigError::NonSquareTile {
                frames: self.fingerprint_length,
                bins: self.frequency_bins,
            });
        }
        if self.start_frequency <= 0.0 || self.end_frequency <= self.start_frequency {
            return Err(ConfigError::FrequencyRange {
                start: self.start_frequency,
                end: self.end_frequency,
            });
        }
        if self.top_wavelets > self.tile_coefficients() {
            return Err(ConfigError::TopWaveletsOutOfRange {
                top: self.top_wavelets,
                max: self.tile_coefficients(),
            });
        }
        Ok(())
    }
}

/// Parameters of the MinHash/LSH index layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Number of LSH bands (hash tables).
    pub hash_tables: usize,
    /// Signature elements per band.
    pub hash_keys_per_table: usize,
    /// Minimum bands a candidate must share with a query fingerprint.
    pub threshold_tables: usize,
    /// Query-side cap on fingerprints per clip when count optimization is on.
    pub max_signature_count: usize,
    /// Maximum ranked tracks returned by a query.
    pub top_candidates: usize,
    /// Blend weight of the minimum Hamming distance in the ordering value.
    /// Zero is a supported fallback.
    pub ordering_blend: f64,
    /// Seed for permutation generation. None draws from OS entropy.
    pub permutation_seed: Option<u64>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            hash_tables: 25,
            hash_keys_per_table: 4,
            threshold_tables: 4,
            max_signature_count: 5,
            top_candidates: 200,
            ordering_blend: 0.4,
            permutation_seed: None,
        }
    }
}

impl IndexConfig {
    /// MinHash signature length K = L * B.
    pub fn signature_length(&self) -> usize {
        self.hash_tables * self.hash_keys_per_table
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hash_tables == 0 || self.hash_keys_per_table == 0 {
            return Err(ConfigError::ZeroBands);
        }
        if self.threshold_tables > self.hash_tables {
            return Err(ConfigError::ThresholdOutOfRange {
                threshold: self.threshold_tables,
                tables: self.hash_tables,
            });
        }
        Ok(())
    }
}

/// Optional on-disk settings for the CLI. Anything missing from the TOML
/// file (or the whole file) falls back to its default.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Database location; the XDG data directory is used when unset.
    pub db_path: Option<PathBuf>,
    /// Worker threads for batch ingest; 0 picks half the cores.
    pub workers: usize,
    /// Fingerprint extraction parameters.
    pub fingerprint: FingerprintConfig,
    /// MinHash/LSH index parameters.
    pub index: IndexConfig,
}

impl AppConfig {
    /// Read `config.toml` from the XDG config directory. A broken or
    /// unreadable file is reported once and otherwise treated as absent.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no config file at {}", path.display());
                return Self::default();
            }
            Err(e) => {
                log::warn!("ignoring unreadable config {}: {e}", path.display());
                return Self::default();
            }
        };
        match toml::from_str(&contents) {
            Ok(config) => {
                log::info!("using config {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("ignoring invalid config {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Worker count for batch work; zero means half the cores, at least one.
    pub fn resolve_workers(&self) -> usize {
        match self.workers {
            0 => std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(1))
                .unwrap_or(1),
            n => n,
        }
    }

    fn config_path() -> Option<PathBuf> {
        let dirs = ProjectDirs::from("", "", crate::APP_NAME)?;
        Some(dirs.config_dir().join("config.toml"))
    }
}

/// Default database location under the XDG data directory. Without a
/// resolvable home the working directory serves instead.
pub fn default_db_path() -> PathBuf {
    match ProjectDirs::from("", "", crate::APP_NAME) {
        Some(dirs) => {
            let dir = dirs.data_dir();
            std::fs::create_dir_all(dir).ok();
            dir.join("waveprint.db")
        }
        None => PathBuf::from("waveprint.db"),
    }
}

//! Random permutation table backing the MinHash sketcher.
//!
//! The table is part of the database's identity: regenerating it invalidates
//! every stored signature. It is persisted as a plain text file with one
//! permutation per line, space-separated, alongside the database file.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PermutationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed permutation file, line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("permutation table is {rows}x{width}, index expects {expected_rows}x{expected_width}")]
    Dimensions {
        rows: usize,
        width: usize,
        expected_rows: usize,
        expected_width: usize,
    },
}

/// An immutable table of `K` random permutations of `[0, F)`.
///
/// Loaded once per process and shared read-only across queries.
#[derive(Debug, Clone)]
pub struct Permutations {
    width: usize,
    rows: Vec<Vec<u32>>,
}

impl Permutations {
    /// Generate `count` uniform random permutations of `[0, width)`.
    ///
    /// A fixed seed makes generation deterministic; otherwise the rows are
    /// drawn from OS entropy. These are LSH hash families, not secrets.
    pub fn generate(count: usize, width: usize, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let rows = (0..count)
            .map(|_| {
                let mut row: Vec<u32> = (0..width as u32).collect();
                row.shuffle(&mut rng);
                row
            })
            .collect();

        Self { width, rows }
    }

    /// Load a permutation table from its text representation.
    pub fn load(path: &Path) -> Result<Self, PermutationError> {
        let contents = fs::read_to_string(path)?;
        let mut rows: Vec<Vec<u32>> = Vec::new();
        let mut width = 0usize;

        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row: Vec<u32> = line
                .split_whitespace()
                .map(|tok| {
                    tok.parse::<u32>().map_err(|e| PermutationError::Malformed {
                        line: idx + 1,
                        message: e.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?;

            if rows.is_empty() {
                width = row.len();
            } else if row.len() != width {
                return Err(PermutationError::Malformed {
                    line: idx + 1,
                    message: format!("expected {} entries, found {}", width, row.len()),
                });
            }
            check_is_permutation(&row, idx + 1)?;
            rows.push(row);
        }

        Ok(Self { width, rows })
    }

    /// Write the table next to the database it belongs to.
    pub fn save(&self, path: &Path) -> Result<(), PermutationError> {
        let mut out = String::with_capacity(self.rows.len() * self.width * 5);
        for row in &self.rows {
            let mut first = true;
            for v in row {
                if !first {
                    out.push(' ');
                }
                out.push_str(&v.to_string());
                first = false;
            }
            out.push('\n');
        }
        fs::write(path, out)?;
        Ok(())
    }

    /// Load the table if the file exists, generate and persist it otherwise.
    ///
    /// A loaded table whose dimensions disagree with the configured index is
    /// a schema mismatch, fatal to the caller.
    pub fn load_or_generate(
        path: &Path,
        count: usize,
        width: usize,
        seed: Option<u64>,
    ) -> Result<Self, PermutationError> {
        if path.exists() {
            let table = Self::load(path)?;
            if table.rows.len() != count || table.width != width {
                return Err(PermutationError::Dimensions {
                    rows: table.rows.len(),
                    width: table.width,
                    expected_rows: count,
                    expected_width: width,
                });
            }
            log::debug!("Loaded {} permutations from {}", count, path.display());
            return Ok(table);
        }

        let table = Self::generate(count, width, seed);
        table.save(path)?;
        log::info!(
            "Generated {} permutations of [0, {}) at {}",
            count,
            width,
            path.display()
        );
        Ok(table)
    }

    /// Signature length K.
    pub fn count(&self) -> usize {
        self.rows.len()
    }

    /// Fingerprint bit length F.
    pub fn width(&self) -> usize {
        self.width
    }

    /// The p-th permutation of `[0, width)`.
    pub fn row(&self, p: usize) -> &[u32] {
        &self.rows[p]
    }
}

fn check_is_permutation(row: &[u32], line: usize) -> Result<(), PermutationError> {
    let mut seen = vec![false; row.len()];
    for &v in row {
        let idx = v as usize;
        if idx >= row.len() || seen[idx] {
            return Err(PermutationError::Malformed {
                line,
                message: format!("row is not a permutation of [0, {})", row.len()),
            });
        }
        seen[idx] = true;
    }
    Ok(())
}

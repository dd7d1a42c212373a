//! Similarity query engine.
//!
//! Gathers candidate fingerprints through per-band LSH lookups, filters by
//! table-vote threshold, scores candidates by Hamming distance over the
//! stored bit vectors, and folds the evidence into per-track statistics
//! ordered by a composite score.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use thiserror::Error;

use crate::db::models::HashBin;
use crate::db::{Database, StoreError};
use crate::fingerprint::{hamming_distance, Fingerprint};
use crate::minhash::Sketcher;

/// Candidate counts above this are scored on the rayon pool. Aggregation
/// stays sequential either way, so parallel and sequential runs produce
/// bit-identical stats.
const PARALLEL_CANDIDATES: usize = 256;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("query cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag. Checked between query fingerprints and
/// before the ranking phase; a cancelled query returns no partial results.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Accumulated match evidence for one candidate track.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStats {
    /// Band collisions summed over every scored candidate fingerprint.
    pub total_table_votes: u64,
    /// Hamming distances summed over every scored candidate fingerprint.
    pub hamming_distance: u64,
    /// Best (smallest) per-fingerprint Hamming distance.
    pub min_hamming_distance: u32,
    /// Number of candidate fingerprints that survived the threshold.
    pub candidate_count: u32,
    /// Best per-fingerprint similarity, `1 - hamming / F`.
    pub similarity: f32,
}

impl QueryStats {
    fn new() -> Self {
        Self {
            total_table_votes: 0,
            hamming_distance: 0,
            min_hamming_distance: u32::MAX,
            candidate_count: 0,
            similarity: 0.0,
        }
    }

    /// Composite ordering value, smaller is better: average match quality
    /// weighted by collision strength, blended with the best sub-match.
    pub fn ordering_value(&self, blend: f64) -> f64 {
        let votes = self.total_table_votes.max(1) as f64;
        self.hamming_distance as f64 / votes + blend * self.min_hamming_distance as f64
    }
}

/// Parameters of one query run. `hash_tables` and `hash_keys_per_table`
/// must match the layout the database was indexed with.
pub struct QueryParams<'a> {
    pub hash_tables: usize,
    pub hash_keys_per_table: usize,
    /// Minimum distinct band collisions for a candidate to be scored.
    /// Values of 0 or 1 keep every candidate.
    pub threshold: usize,
    /// Compare against every indexed fingerprint instead of LSH lookups.
    pub search_all: bool,
    /// Maximum number of ranked tracks returned.
    pub top: usize,
    /// Weight of `min_hamming_distance` in the ordering value.
    pub ordering_blend: f64,
    pub cancel: Option<&'a CancelToken>,
}

/// Rank indexed tracks against the query fingerprints.
///
/// Returns `(track_id, stats)` pairs ordered best-first. Aggregation over
/// candidates is associative and commutative, and ties are broken by lower
/// `min_hamming_distance`, then lower track id, so the output is
/// deterministic for a given store.
pub fn query(
    db: &Database,
    sketcher: &Sketcher<'_>,
    query_fingerprints: &[Fingerprint],
    params: &QueryParams<'_>,
) -> Result<Vec<(i64, QueryStats)>, QueryError> {
    let mut per_track: HashMap<i64, QueryStats> = HashMap::new();

    for q in query_fingerprints {
        if params.cancel.map_or(false, CancelToken::is_cancelled) {
            return Err(QueryError::Cancelled);
        }

        let signature = sketcher.compute_signature(&q.bits);
        let band_keys = sketcher.group_to_bands(
            &signature,
            params.hash_tables,
            params.hash_keys_per_table,
        );

        let candidates = if params.search_all {
            db.read_all_hash_bins()?
        } else {
            db.lookup_by_hash_bins(&band_keys)?
        };

        let voted = filter_by_votes(&candidates, &band_keys, params.threshold);
        if voted.is_empty() {
            continue;
        }

        let ids: Vec<i64> = voted.iter().map(|(id, _)| *id).collect();
        let rows = db.read_fingerprints_by_id(&ids)?;

        let hammings: Vec<u32> = if rows.len() > PARALLEL_CANDIDATES {
            rows.par_iter()
                .map(|row| hamming_distance(&row.signature, &q.bits))
                .collect()
        } else {
            rows.iter()
                .map(|row| hamming_distance(&row.signature, &q.bits))
                .collect()
        };

        let votes_by_id: HashMap<i64, u32> = voted.into_iter().collect();
        let bits = q.bits.len() as f32;

        // Sequential fold keeps stats identical regardless of how the
        // Hamming pass was scheduled.
        for (row, hamming) in rows.iter().zip(hammings) {
            let votes = votes_by_id[&row.id];
            let stats = per_track.entry(row.track_id).or_insert_with(QueryStats::new);
            stats.total_table_votes += u64::from(votes);
            stats.hamming_distance += u64::from(hamming);
            stats.min_hamming_distance = stats.min_hamming_distance.min(hamming);
            stats.candidate_count += 1;
            stats.similarity = stats.similarity.max(1.0 - hamming as f32 / bits);
        }
    }

    if params.cancel.map_or(false, CancelToken::is_cancelled) {
        return Err(QueryError::Cancelled);
    }

    let mut ranked: Vec<(i64, QueryStats)> = per_track.into_iter().collect();
    ranked.sort_by(|a, b| {
        a.1.ordering_value(params.ordering_blend)
            .total_cmp(&b.1.ordering_value(params.ordering_blend))
            .then(a.1.min_hamming_distance.cmp(&b.1.min_hamming_distance))
            .then(a.0.cmp(&b.0))
    });
    ranked.truncate(params.top);
    Ok(ranked)
}

/// Count distinct band collisions per candidate fingerprint and apply the
/// threshold. A row collides when its bin equals the query's band key for
/// the row's own hash table. Returns `(fingerprint_id, votes)` sorted by
/// fingerprint id for a deterministic read order.
fn filter_by_votes(
    candidates: &HashMap<i64, Vec<HashBin>>,
    band_keys: &[u64],
    threshold: usize,
) -> Vec<(i64, u32)> {
    let mut voted: Vec<(i64, u32)> = Vec::with_capacity(candidates.len());
    let mut seen = vec![false; band_keys.len()];
    for (&fingerprint_id, rows) in candidates {
        seen.fill(false);
        let mut votes = 0u32;
        for row in rows {
            if row.hash_table < band_keys.len()
                && band_keys[row.hash_table] == row.bin
                && !seen[row.hash_table]
            {
                seen[row.hash_table] = true;
                votes += 1;
            }
        }
        if threshold > 1 && (votes as usize) < threshold {
            continue;
        }
        voted.push((fingerprint_id, votes));
    }
    voted.sort_unstable_by_key(|&(id, _)| id);
    voted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{IndexedFingerprint, NewTrack};
    use crate::minhash::permutations::Permutations;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, HashSet};

    const BITS: usize = 128;
    const TABLES: usize = 8;
    const KEYS_PER_TABLE: usize = 2;

    fn params<'a>(threshold: usize) -> QueryParams<'a> {
        QueryParams {
            hash_tables: TABLES,
            hash_keys_per_table: KEYS_PER_TABLE,
            threshold,
            search_all: false,
            top: 200,
            ordering_blend: 0.4,
            cancel: None,
        }
    }

    fn table() -> Permutations {
        Permutations::generate(TABLES * KEYS_PER_TABLE, BITS, Some(42))
    }

    fn random_fingerprint(rng: &mut StdRng) -> Fingerprint {
        Fingerprint {
            song_order: 0,
            bits: (0..BITS).map(|_| u8::from(rng.gen_bool(0.2))).collect(),
        }
    }

    fn index(db: &Database, sketcher: &Sketcher<'_>, path: &str, fps: &[Fingerprint]) -> i64 {
        let indexed: Vec<IndexedFingerprint> = fps
            .iter()
            .map(|fp| {
                let sig = sketcher.compute_signature(&fp.bits);
                IndexedFingerprint {
                    song_order: fp.song_order as i64,
                    signature: fp.bits.clone(),
                    band_keys: sketcher.group_to_bands(&sig, TABLES, KEYS_PER_TABLE),
                }
            })
            .collect();
        db.insert_indexed_track(
            &NewTrack {
                album_id: None,
                artist: None,
                title: None,
                file_path: path.to_string(),
                duration_ms: 0,
                tags: BTreeMap::new(),
            },
            &indexed,
        )
        .unwrap()
    }

    #[test]
    fn empty_store_returns_no_matches() {
        let db = Database::open_in_memory().unwrap();
        let perms = table();
        let sketcher = Sketcher::new(&perms);
        let mut rng = StdRng::seed_from_u64(1);
        let q = vec![random_fingerprint(&mut rng)];

        let ranked = query(&db, &sketcher, &q, &params(1)).unwrap();
        assert!(ranked.is_empty());
    }

    #[test]
    fn self_match_ranks_first_with_zero_hamming() {
        let db = Database::open_in_memory().unwrap();
        let perms = table();
        let sketcher = Sketcher::new(&perms);
        let mut rng = StdRng::seed_from_u64(2);

        let target = random_fingerprint(&mut rng);
        let target_id = index(&db, &sketcher, "/a.wav", std::slice::from_ref(&target));
        for i in 0..5 {
            let other = random_fingerprint(&mut rng);
            index(&db, &sketcher, &format!("/other{i}.wav"), &[other]);
        }

        let ranked = query(&db, &sketcher, std::slice::from_ref(&target), &params(1)).unwrap();
        assert!(!ranked.is_empty());
        let (best_id, best) = &ranked[0];
        assert_eq!(*best_id, target_id);
        assert_eq!(best.min_hamming_distance, 0);
        assert_eq!(best.total_table_votes, TABLES as u64);
        assert!((best.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn raising_threshold_never_adds_candidates() {
        let db = Database::open_in_memory().unwrap();
        let perms = table();
        let sketcher = Sketcher::new(&perms);
        let mut rng = StdRng::seed_from_u64(3);

        for i in 0..20 {
            let fp = random_fingerprint(&mut rng);
            index(&db, &sketcher, &format!("/t{i}.wav"), &[fp]);
        }
        let q = vec![random_fingerprint(&mut rng)];

        let mut previous: Option<HashSet<i64>> = None;
        for threshold in [0, 1, 2, 4, TABLES] {
            let ranked = query(&db, &sketcher, &q, &params(threshold)).unwrap();
            let ids: HashSet<i64> = ranked.iter().map(|(id, _)| *id).collect();
            if let Some(prev) = &previous {
                assert!(
                    ids.is_subset(prev),
                    "threshold {threshold} introduced new candidates"
                );
            }
            previous = Some(ids);
        }
    }

    #[test]
    fn search_all_covers_non_colliding_fingerprints() {
        let db = Database::open_in_memory().unwrap();
        let perms = table();
        let sketcher = Sketcher::new(&perms);
        let mut rng = StdRng::seed_from_u64(4);

        let stored = random_fingerprint(&mut rng);
        let stored_id = index(&db, &sketcher, "/all.wav", &[stored]);

        // A query vector with no set bits shares no band with anything.
        let q = vec![Fingerprint {
            song_order: 0,
            bits: vec![0u8; BITS],
        }];

        let mut p = params(1);
        p.search_all = true;
        let ranked = query(&db, &sketcher, &q, &p).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].0, stored_id);
    }

    #[test]
    fn results_are_deterministic_across_runs() {
        let db = Database::open_in_memory().unwrap();
        let perms = table();
        let sketcher = Sketcher::new(&perms);
        let mut rng = StdRng::seed_from_u64(5);

        for i in 0..30 {
            let fp = random_fingerprint(&mut rng);
            index(&db, &sketcher, &format!("/d{i}.wav"), &[fp]);
        }
        let q: Vec<Fingerprint> = (0..3).map(|_| random_fingerprint(&mut rng)).collect();

        let a = query(&db, &sketcher, &q, &params(1)).unwrap();
        let b = query(&db, &sketcher, &q, &params(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cancelled_token_aborts_with_no_partial_result() {
        let db = Database::open_in_memory().unwrap();
        let perms = table();
        let sketcher = Sketcher::new(&perms);
        let mut rng = StdRng::seed_from_u64(6);
        let q = vec![random_fingerprint(&mut rng)];

        let token = CancelToken::new();
        token.cancel();
        let mut p = params(1);
        p.cancel = Some(&token);

        assert!(matches!(
            query(&db, &sketcher, &q, &p),
            Err(QueryError::Cancelled)
        ));
    }

    #[test]
    fn truncates_to_top() {
        let db = Database::open_in_memory().unwrap();
        let perms = table();
        let sketcher = Sketcher::new(&perms);
        let mut rng = StdRng::seed_from_u64(7);

        let shared = random_fingerprint(&mut rng);
        for i in 0..10 {
            index(&db, &sketcher, &format!("/s{i}.wav"), &[shared.clone()]);
        }

        let mut p = params(1);
        p.top = 3;
        let ranked = query(&db, &sketcher, &[shared], &p).unwrap();
        assert_eq!(ranked.len(), 3);
        // Equal scores fall back to track id order
        assert!(ranked.windows(2).all(|w| w[0].0 < w[1].0));
    }
}

use std::collections::{BTreeSet, HashMap};

use rusqlite::{params, params_from_iter, Connection, Row};

use super::models::{
    FingerprintRow, HashBin, IndexedFingerprint, NewHashBin, NewTrack, Track,
};
use super::{Database, Result, StoreError};

fn read_err(e: rusqlite::Error) -> StoreError {
    StoreError::Read(e.to_string())
}

fn write_err(e: rusqlite::Error) -> StoreError {
    StoreError::Write(e.to_string())
}

impl Database {
    /// Insert a track row. Returns the assigned track id.
    pub fn insert_track(&self, t: &NewTrack) -> Result<i64> {
        Self::insert_track_row(&self.conn, t)
    }

    /// Insert a batch of fingerprints for one track. Atomic per call;
    /// stamps `total_per_track` with the batch size. Returns the assigned
    /// fingerprint ids in input order.
    pub fn insert_fingerprints(
        &self,
        track_id: i64,
        fingerprints: &[IndexedFingerprint],
    ) -> Result<Vec<i64>> {
        let tx = self.conn.unchecked_transaction().map_err(write_err)?;
        let ids = Self::insert_fingerprint_rows(&tx, track_id, fingerprints)?;
        tx.commit().map_err(write_err)?;
        Ok(ids)
    }

    /// Insert a batch of hash-bin rows. Atomic per call.
    pub fn insert_hash_bins(&self, rows: &[NewHashBin]) -> Result<()> {
        let tx = self.conn.unchecked_transaction().map_err(write_err)?;
        Self::insert_hash_bin_rows(&tx, rows)?;
        tx.commit().map_err(write_err)?;
        Ok(())
    }

    /// Insert a track with its fingerprints and hash bins in one
    /// transaction. A failure anywhere leaves the store unchanged and the
    /// track out of the queryable set.
    pub fn insert_indexed_track(
        &self,
        t: &NewTrack,
        fingerprints: &[IndexedFingerprint],
    ) -> Result<i64> {
        let tx = self.conn.unchecked_transaction().map_err(write_err)?;

        let track_id = Self::insert_track_row(&tx, t)?;
        let fingerprint_ids = Self::insert_fingerprint_rows(&tx, track_id, fingerprints)?;

        let tables = fingerprints.first().map_or(0, |fp| fp.band_keys.len());
        let mut bins = Vec::with_capacity(fingerprints.len() * tables);
        for (fp, &fingerprint_id) in fingerprints.iter().zip(fingerprint_ids.iter()) {
            for (hash_table, &bin) in fp.band_keys.iter().enumerate() {
                bins.push(NewHashBin {
                    bin,
                    hash_table,
                    track_id,
                    fingerprint_id,
                });
            }
        }
        Self::insert_hash_bin_rows(&tx, &bins)?;

        tx.commit().map_err(write_err)?;
        Ok(track_id)
    }

    fn insert_track_row(conn: &Connection, t: &NewTrack) -> Result<i64> {
        conn.execute(
            "INSERT INTO tracks (album_id, artist, title, file_path, duration_ms, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                t.album_id,
                t.artist,
                t.title,
                t.file_path,
                t.duration_ms,
                super::models::serialize_tags(&t.tags),
            ],
        )
        .map_err(write_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn insert_fingerprint_rows(
        conn: &Connection,
        track_id: i64,
        fingerprints: &[IndexedFingerprint],
    ) -> Result<Vec<i64>> {
        let total = fingerprints.len() as i64;
        let mut ids = Vec::with_capacity(fingerprints.len());
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO fingerprints (track_id, song_order, total_per_track, signature)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(write_err)?;
        for fp in fingerprints {
            stmt.execute(params![track_id, fp.song_order, total, fp.signature])
                .map_err(write_err)?;
            ids.push(conn.last_insert_rowid());
        }
        Ok(ids)
    }

    fn insert_hash_bin_rows(conn: &Connection, rows: &[NewHashBin]) -> Result<()> {
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO hashbins (bin, hash_table, track_id, fingerprint_id)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(write_err)?;
        for row in rows {
            stmt.execute(params![
                row.bin as i64,
                row.hash_table as i64,
                row.track_id,
                row.fingerprint_id
            ])
            .map_err(write_err)?;
        }
        Ok(())
    }

    /// Read tracks by id. Unknown ids are silently absent from the result.
    pub fn read_tracks_by_id(&self, ids: &[i64]) -> Result<Vec<Track>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT id, album_id, artist, title, file_path, duration_ms, tags
             FROM tracks WHERE id IN ({placeholders}) ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(read_err)?;
        let tracks = stmt
            .query_map(params_from_iter(ids.iter()), track_from_row)
            .map_err(read_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(read_err)?;
        Ok(tracks)
    }

    /// List tracks, optionally filtered by a substring over artist, title
    /// or file path.
    pub fn read_tracks(&self, filter: Option<&str>) -> Result<Vec<Track>> {
        let mut sql = String::from(
            "SELECT id, album_id, artist, title, file_path, duration_ms, tags FROM tracks",
        );
        if filter.is_some() {
            sql.push_str(" WHERE artist LIKE ?1 OR title LIKE ?1 OR file_path LIKE ?1");
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql).map_err(read_err)?;
        let rows = match filter {
            Some(pattern) => stmt
                .query_map(params![format!("%{pattern}%")], track_from_row)
                .map_err(read_err)?
                .collect::<std::result::Result<Vec<_>, _>>(),
            None => stmt
                .query_map([], track_from_row)
                .map_err(read_err)?
                .collect::<std::result::Result<Vec<_>, _>>(),
        };
        rows.map_err(read_err)
    }

    pub fn count_tracks(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))
            .map_err(read_err)
    }

    pub fn count_fingerprints(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM fingerprints", [], |row| row.get(0))
            .map_err(read_err)
    }

    pub fn count_hash_bins(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM hashbins", [], |row| row.get(0))
            .map_err(read_err)
    }

    /// Read fingerprint rows by id.
    pub fn read_fingerprints_by_id(&self, ids: &[i64]) -> Result<Vec<FingerprintRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT id, track_id, song_order, total_per_track, signature
             FROM fingerprints WHERE id IN ({placeholders}) ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(read_err)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), fingerprint_from_row)
            .map_err(read_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(read_err)?;
        Ok(rows)
    }

    /// Read all fingerprints of the given tracks, grouped by track id.
    /// Grouping does not depend on physical row order.
    pub fn read_fingerprints_by_track_ids(
        &self,
        track_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<FingerprintRow>>> {
        if track_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; track_ids.len()].join(",");
        let sql = format!(
            "SELECT id, track_id, song_order, total_per_track, signature
             FROM fingerprints WHERE track_id IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(read_err)?;
        let rows = stmt
            .query_map(params_from_iter(track_ids.iter()), fingerprint_from_row)
            .map_err(read_err)?;

        let mut grouped: HashMap<i64, Vec<FingerprintRow>> = HashMap::new();
        for row in rows {
            let fp = row.map_err(read_err)?;
            grouped.entry(fp.track_id).or_default().push(fp);
        }
        Ok(grouped)
    }

    /// Look up hash-bin rows whose bin matches any of the given band keys,
    /// grouped by fingerprint id. Duplicate keys are deduplicated; the keys
    /// are not restricted to a single band.
    pub fn lookup_by_hash_bins(&self, keys: &[u64]) -> Result<HashMap<i64, Vec<HashBin>>> {
        let unique: BTreeSet<i64> = keys.iter().map(|&k| k as i64).collect();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; unique.len()].join(",");
        let sql = format!(
            "SELECT id, bin, hash_table, track_id, fingerprint_id
             FROM hashbins WHERE bin IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(read_err)?;
        let rows = stmt
            .query_map(params_from_iter(unique.iter()), hash_bin_from_row)
            .map_err(read_err)?;

        group_hash_bins(rows)
    }

    /// Scan every hash-bin row, grouped by fingerprint id. Backs the
    /// "search everything" mode; no row limit applies.
    pub fn read_all_hash_bins(&self) -> Result<HashMap<i64, Vec<HashBin>>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, bin, hash_table, track_id, fingerprint_id FROM hashbins",
            )
            .map_err(read_err)?;
        let rows = stmt.query_map([], hash_bin_from_row).map_err(read_err)?;
        group_hash_bins(rows)
    }

    /// Bit length of one stored signature, if any fingerprint exists.
    /// Used to detect configuration drift against an existing database.
    pub fn signature_length(&self) -> Result<Option<usize>> {
        let result: std::result::Result<Vec<u8>, _> = self.conn.query_row(
            "SELECT signature FROM fingerprints LIMIT 1",
            [],
            |row| row.get(0),
        );
        match result {
            Ok(blob) => Ok(Some(blob.len())),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(read_err(e)),
        }
    }

    /// Number of hash tables the stored index was built with, if any
    /// hash-bin rows exist.
    pub fn hash_table_count(&self) -> Result<Option<usize>> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(hash_table) FROM hashbins", [], |row| row.get(0))
            .map_err(read_err)?;
        Ok(max.map(|m| m as usize + 1))
    }

    /// Delete every track, fingerprint and hash bin. The permutation table
    /// is not touched.
    pub fn reset(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction().map_err(write_err)?;
        tx.execute("DELETE FROM hashbins", []).map_err(write_err)?;
        tx.execute("DELETE FROM fingerprints", []).map_err(write_err)?;
        tx.execute("DELETE FROM tracks", []).map_err(write_err)?;
        tx.commit().map_err(write_err)?;
        Ok(())
    }
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
    let tags: String = row.get(6)?;
    Ok(Track {
        id: row.get(0)?,
        album_id: row.get(1)?,
        artist: row.get(2)?,
        title: row.get(3)?,
        file_path: row.get(4)?,
        duration_ms: row.get(5)?,
        tags: super::models::parse_tags(&tags),
    })
}

fn fingerprint_from_row(row: &Row<'_>) -> rusqlite::Result<FingerprintRow> {
    Ok(FingerprintRow {
        id: row.get(0)?,
        track_id: row.get(1)?,
        song_order: row.get(2)?,
        total_per_track: row.get(3)?,
        signature: row.get(4)?,
    })
}

fn hash_bin_from_row(row: &Row<'_>) -> rusqlite::Result<HashBin> {
    let bin: i64 = row.get(1)?;
    let hash_table: i64 = row.get(2)?;
    Ok(HashBin {
        id: row.get(0)?,
        bin: bin as u64,
        hash_table: hash_table as usize,
        track_id: row.get(3)?,
        fingerprint_id: row.get(4)?,
    })
}

fn group_hash_bins(
    rows: impl Iterator<Item = rusqlite::Result<HashBin>>,
) -> Result<HashMap<i64, Vec<HashBin>>> {
    let mut grouped: HashMap<i64, Vec<HashBin>> = HashMap::new();
    for row in rows {
        let bin = row.map_err(read_err)?;
        grouped.entry(bin.fingerprint_id).or_default().push(bin);
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_track(path: &str) -> NewTrack {
        let mut tags = BTreeMap::new();
        tags.insert("source".to_string(), "test".to_string());
        NewTrack {
            album_id: None,
            artist: Some("Boards of Canada".to_string()),
            title: Some("Roygbiv".to_string()),
            file_path: path.to_string(),
            duration_ms: 150_000,
            tags,
        }
    }

    fn test_fingerprint(song_order: i64, fill: u8, band_keys: Vec<u64>) -> IndexedFingerprint {
        let mut signature = vec![0u8; 64];
        for bit in signature.iter_mut().step_by(fill as usize + 2) {
            *bit = 1;
        }
        IndexedFingerprint {
            song_order,
            signature,
            band_keys,
        }
    }

    #[test]
    fn indexed_track_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let fps = vec![
            test_fingerprint(0, 1, vec![10, 20, 30]),
            test_fingerprint(1, 2, vec![11, 20, 31]),
        ];
        let id = db.insert_indexed_track(&test_track("/music/a.wav"), &fps).unwrap();
        assert!(id > 0);

        assert_eq!(db.count_tracks().unwrap(), 1);
        assert_eq!(db.count_fingerprints().unwrap(), 2);
        assert_eq!(db.count_hash_bins().unwrap(), 6);

        let grouped = db.read_fingerprints_by_track_ids(&[id]).unwrap();
        let stored = &grouped[&id];
        assert_eq!(stored.len(), 2);
        for row in stored {
            assert_eq!(row.total_per_track, 2);
            let original = &fps[row.song_order as usize];
            assert_eq!(row.signature, original.signature);
        }
    }

    #[test]
    fn stored_signature_round_trips_by_id() {
        let db = Database::open_in_memory().unwrap();
        let track_id = db.insert_track(&test_track("/music/b.wav")).unwrap();
        let fp = test_fingerprint(0, 3, vec![]);
        let ids = db.insert_fingerprints(track_id, std::slice::from_ref(&fp)).unwrap();

        let rows = db.read_fingerprints_by_id(&ids).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].signature, fp.signature);
        assert_eq!(rows[0].track_id, track_id);
    }

    #[test]
    fn lookup_groups_by_fingerprint_and_dedups_keys() {
        let db = Database::open_in_memory().unwrap();
        let fps = vec![
            test_fingerprint(0, 1, vec![100, 200]),
            test_fingerprint(1, 2, vec![100, 201]),
        ];
        db.insert_indexed_track(&test_track("/music/c.wav"), &fps).unwrap();

        // Key 100 collides with both fingerprints; duplicate input keys
        // must not duplicate rows.
        let hits = db.lookup_by_hash_bins(&[100, 100, 201]).unwrap();
        assert_eq!(hits.len(), 2);
        let total_rows: usize = hits.values().map(|v| v.len()).sum();
        assert_eq!(total_rows, 3);
    }

    #[test]
    fn lookup_unknown_keys_is_empty() {
        let db = Database::open_in_memory().unwrap();
        db.insert_indexed_track(&test_track("/music/d.wav"), &[test_fingerprint(0, 1, vec![7])])
            .unwrap();
        assert!(db.lookup_by_hash_bins(&[9999]).unwrap().is_empty());
        assert!(db.lookup_by_hash_bins(&[]).unwrap().is_empty());
    }

    #[test]
    fn read_all_hash_bins_covers_every_row() {
        let db = Database::open_in_memory().unwrap();
        db.insert_indexed_track(&test_track("/music/e.wav"), &[test_fingerprint(0, 1, vec![1, 2])])
            .unwrap();
        db.insert_indexed_track(&test_track("/music/f.wav"), &[test_fingerprint(0, 2, vec![3])])
            .unwrap();

        let all = db.read_all_hash_bins().unwrap();
        assert_eq!(all.len(), 2);
        let total: usize = all.values().map(|v| v.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn grouping_by_track_includes_every_group() {
        let db = Database::open_in_memory().unwrap();
        let a = db
            .insert_indexed_track(&test_track("/music/g.wav"), &[test_fingerprint(0, 1, vec![])])
            .unwrap();
        let b = db
            .insert_indexed_track(&test_track("/music/h.wav"), &[test_fingerprint(0, 2, vec![])])
            .unwrap();

        let grouped = db.read_fingerprints_by_track_ids(&[a, b]).unwrap();
        assert!(grouped.contains_key(&a));
        assert!(grouped.contains_key(&b));
    }

    #[test]
    fn duplicate_band_for_same_fingerprint_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let track_id = db.insert_track(&test_track("/music/i.wav")).unwrap();
        let ids = db
            .insert_fingerprints(track_id, &[test_fingerprint(0, 1, vec![])])
            .unwrap();

        let row = NewHashBin {
            bin: 5,
            hash_table: 0,
            track_id,
            fingerprint_id: ids[0],
        };
        db.insert_hash_bins(std::slice::from_ref(&row)).unwrap();
        assert!(db.insert_hash_bins(std::slice::from_ref(&row)).is_err());
        // The failed batch left the store unchanged
        assert_eq!(db.count_hash_bins().unwrap(), 1);
    }

    #[test]
    fn reset_empties_all_tables() {
        let db = Database::open_in_memory().unwrap();
        db.insert_indexed_track(&test_track("/music/j.wav"), &[test_fingerprint(0, 1, vec![4])])
            .unwrap();
        db.reset().unwrap();
        assert_eq!(db.count_tracks().unwrap(), 0);
        assert_eq!(db.count_fingerprints().unwrap(), 0);
        assert_eq!(db.count_hash_bins().unwrap(), 0);
    }

    #[test]
    fn track_filter_matches_substring() {
        let db = Database::open_in_memory().unwrap();
        db.insert_track(&test_track("/music/k.wav")).unwrap();
        let mut other = test_track("/music/l.wav");
        other.artist = Some("Autechre".to_string());
        db.insert_track(&other).unwrap();

        assert_eq!(db.read_tracks(None).unwrap().len(), 2);
        assert_eq!(db.read_tracks(Some("autechre")).unwrap().len(), 1);
        assert_eq!(db.read_tracks(Some("nothing")).unwrap().len(), 0);
    }

    #[test]
    fn signature_length_reflects_stored_blobs() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.signature_length().unwrap(), None);
        let track_id = db.insert_track(&test_track("/music/m.wav")).unwrap();
        db.insert_fingerprints(track_id, &[test_fingerprint(0, 1, vec![])])
            .unwrap();
        assert_eq!(db.signature_length().unwrap(), Some(64));
    }
}

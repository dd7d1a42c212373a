use std::collections::BTreeMap;

/// Metadata for a track about to be indexed.
pub struct NewTrack {
    pub album_id: Option<i64>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub file_path: String,
    pub duration_ms: i64,
    pub tags: BTreeMap<String, String>,
}

/// A track row read from the database. Never mutated by the engine after
/// insert.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: i64,
    pub album_id: Option<i64>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub file_path: String,
    pub duration_ms: i64,
    pub tags: BTreeMap<String, String>,
}

/// A fingerprint prepared for insertion: the encoded bit vector plus its
/// LSH band keys, one per hash table.
pub struct IndexedFingerprint {
    pub song_order: i64,
    pub signature: Vec<u8>,
    pub band_keys: Vec<u64>,
}

/// A stored fingerprint row.
///
/// `total_per_track` reflects the count at insert time and is advisory only.
#[derive(Debug, Clone)]
pub struct FingerprintRow {
    pub id: i64,
    pub track_id: i64,
    pub song_order: i64,
    pub total_per_track: i64,
    pub signature: Vec<u8>,
}

/// A hash-bin row to insert: one per LSH band per fingerprint.
#[derive(Debug, Clone)]
pub struct NewHashBin {
    pub bin: u64,
    pub hash_table: usize,
    pub track_id: i64,
    pub fingerprint_id: i64,
}

/// One LSH band entry pointing back at its fingerprint.
#[derive(Debug, Clone)]
pub struct HashBin {
    pub id: i64,
    pub bin: u64,
    pub hash_table: usize,
    pub track_id: i64,
    pub fingerprint_id: i64,
}

/// Serialize a tag map as `k=v;k=v`. BTreeMap iteration keeps the
/// representation stable.
pub fn serialize_tags(tags: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in tags {
        if !out.is_empty() {
            out.push(';');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

/// Parse a `k=v;k=v` tag string. Entries without `=` are skipped.
pub fn parse_tags(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        let mut tags = BTreeMap::new();
        tags.insert("genre".to_string(), "ambient".to_string());
        tags.insert("year".to_string(), "1994".to_string());

        let encoded = serialize_tags(&tags);
        assert_eq!(encoded, "genre=ambient;year=1994");
        assert_eq!(parse_tags(&encoded), tags);
    }

    #[test]
    fn parse_skips_malformed_entries() {
        let tags = parse_tags("a=1;;broken;b=2");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["a"], "1");
        assert_eq!(tags["b"], "2");
    }

    #[test]
    fn empty_tags_serialize_to_empty_string() {
        assert_eq!(serialize_tags(&BTreeMap::new()), "");
        assert!(parse_tags("").is_empty());
    }
}

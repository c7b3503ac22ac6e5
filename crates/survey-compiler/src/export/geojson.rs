//! GeoJSON feature collection helpers
//!
//! Feature collections are written one feature per line so that a partly
//! broken file can still be scraped line by line.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Maximum field name length in a dBASE table
pub const SHAPEFILE_NAME_LIMIT: usize = 10;

/// Identifier columns that collide with the geodatabase's own object id
pub const GDB_STRIPPED_COLUMNS: &[&str] = &["ogc_fid", "fid", "id", "objectid"];

pub const EMPTY_COLLECTION: &str = "{\"type\":\"FeatureCollection\",\"features\":[]}\n";

fn is_feature(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("Feature")
}

/// Collect every feature from arbitrarily nested feature collections, as
/// produced by tile decoders (collection per tile, per layer).
pub fn flatten_features(value: Value) -> Vec<Value> {
    let mut out = Vec::new();
    let mut stack = vec![value];

    while let Some(value) = stack.pop() {
        if is_feature(&value) {
            out.push(value);
            continue;
        }
        match value {
            Value::Object(mut obj) => {
                if let Some(Value::Array(features)) = obj.remove("features") {
                    stack.extend(features.into_iter().rev());
                }
            }
            Value::Array(items) => stack.extend(items.into_iter().rev()),
            _ => {}
        }
    }

    out
}

/// Last-resort recovery: every line that parses as a feature object
pub fn scrape_features(text: &str) -> Vec<Value> {
    text.lines()
        .map(|line| line.trim().trim_end_matches(','))
        .filter(|line| line.starts_with('{') && line.contains("Feature"))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(is_feature)
        .collect()
}

/// Drop exact duplicates, keeping first occurrences
pub fn dedup_features(features: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    features
        .into_iter()
        .filter(|f| seen.insert(f.to_string()))
        .collect()
}

pub fn write_feature_collection<'a, I>(path: &Path, features: I) -> Result<u64>
where
    I: IntoIterator<Item = &'a Value>,
{
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    writer.write_all(b"{\"type\":\"FeatureCollection\",\"features\":[\n")?;
    let mut count = 0u64;
    for feature in features {
        if count > 0 {
            writer.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut writer, feature)?;
        count += 1;
    }
    writer.write_all(b"\n]}\n")?;
    writer.flush()?;

    Ok(count)
}

pub fn write_empty_collection(path: &Path) -> Result<()> {
    std::fs::write(path, EMPTY_COLLECTION)
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub fn read_features(path: &Path) -> Result<Vec<Value>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let value: Value = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(flatten_features(value))
}

/// Property names across all features, in first-seen order
pub fn property_names(features: &[Value]) -> Vec<String> {
    let mut names = Vec::new();
    let mut seen = HashSet::new();
    for feature in features {
        if let Some(props) = feature.get("properties").and_then(Value::as_object) {
            for key in props.keys() {
                if seen.insert(key.clone()) {
                    names.push(key.clone());
                }
            }
        }
    }
    names
}

/// Longest prefix of `name` that fits in `limit` bytes without splitting a
/// character
fn byte_prefix(name: &str, limit: usize) -> &str {
    if name.len() <= limit {
        return name;
    }
    let mut end = limit;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Map each name to a unique name of at most `limit` bytes.
///
/// dBASE counts field name length in bytes, so a multi-byte character that
/// would straddle the limit is dropped whole. A collision replaces the tail with `_<n>` for
/// the smallest `n` that makes it unique. Comparison is case-insensitive
/// since dBASE field names are.
pub fn truncate_names(names: &[String], limit: usize) -> BTreeMap<String, String> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut mapping = BTreeMap::new();

    for name in names {
        let mut candidate = byte_prefix(name, limit).to_string();
        let mut n = 1usize;
        while taken.contains(&candidate.to_lowercase()) {
            let suffix = format!("_{}", n);
            let keep = limit.saturating_sub(suffix.len());
            candidate = format!("{}{}", byte_prefix(name, keep), suffix);
            n += 1;
        }
        taken.insert(candidate.to_lowercase());
        mapping.insert(name.clone(), candidate);
    }

    mapping
}

/// Rewrite feature properties: rename by `mapping`, drop names in `strip`.
pub fn rewrite_properties(
    features: &mut [Value],
    mapping: &BTreeMap<String, String>,
    strip: &[&str],
) {
    for feature in features.iter_mut() {
        let Some(props) = feature.get_mut("properties").and_then(Value::as_object_mut) else {
            continue;
        };
        let old = std::mem::take(props);
        let mut renamed = Map::with_capacity(old.len());
        for (key, value) in old {
            if strip.iter().any(|s| s.eq_ignore_ascii_case(&key)) {
                continue;
            }
            let key = mapping.get(&key).cloned().unwrap_or(key);
            renamed.insert(key, value);
        }
        *props = renamed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_nested_decoder_output() {
        let decoded = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "FeatureCollection", "properties": {"zoom": 14}, "features": [
                    {"type": "FeatureCollection", "properties": {"layer": "existing"}, "features": [
                        {"type": "Feature", "properties": {"a": 1}, "geometry": null},
                        {"type": "Feature", "properties": {"a": 2}, "geometry": null}
                    ]}
                ]},
                {"type": "Feature", "properties": {"a": 3}, "geometry": null}
            ]
        });

        let features = flatten_features(decoded);
        let ids: Vec<i64> = features.iter().map(|f| f["properties"]["a"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_scrape_features() {
        let text = "garbage\n{ \"type\": \"Feature\", \"properties\": {}, \"geometry\": null },\n\
                    { \"type\": \"FeatureCollection\", \"features\": [\n\
                    {\"type\":\"Feature\",\"properties\":{\"x\":1},\"geometry\":null}\n\
                    {\"type\":\"Feature\", broken\n";
        assert_eq!(scrape_features(text).len(), 2);
    }

    #[test]
    fn test_truncate_names_unique() {
        let names: Vec<String> = [
            "kabupaten_kota",
            "kabupaten_lama",
            "kabupaten_baru",
            "luas",
            "KABUPATEN_",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let mapping = truncate_names(&names, SHAPEFILE_NAME_LIMIT);
        assert_eq!(mapping["kabupaten_kota"], "kabupaten_");
        assert_eq!(mapping["kabupaten_lama"], "kabupate_1");
        assert_eq!(mapping["kabupaten_baru"], "kabupate_2");
        assert_eq!(mapping["luas"], "luas");
        assert_eq!(mapping["KABUPATEN_"], "KABUPATE_3");
        assert!(mapping.values().all(|v| v.chars().count() <= 10));
    }

    #[test]
    fn test_truncate_names_counts_bytes() {
        let names: Vec<String> = ["pemilikanÉtat", "keterangän_x", "keterangän_y"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mapping = truncate_names(&names, SHAPEFILE_NAME_LIMIT);
        // 'É' straddles the limit
        assert_eq!(mapping["pemilikanÉtat"], "pemilikan");
        assert_eq!(mapping["keterangän_x"], "keterangä");
        assert_eq!(mapping["keterangän_y"], "keterang_1");
        assert!(mapping.values().all(|v| v.len() <= SHAPEFILE_NAME_LIMIT));
    }

    #[test]
    fn test_rewrite_properties() {
        let mut features = vec![json!({
            "type": "Feature",
            "geometry": null,
            "properties": {"ogc_fid": 1, "OBJECTID": 9, "keterangan_lahan": "x"}
        })];
        let mapping = truncate_names(&["keterangan_lahan".to_string()], SHAPEFILE_NAME_LIMIT);

        rewrite_properties(&mut features, &mapping, GDB_STRIPPED_COLUMNS);

        let props = features[0]["properties"].as_object().unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props["keterangan"], "x");
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fc.geojson");
        let features = vec![
            json!({"type": "Feature", "properties": {"a": 1}, "geometry": {"type": "Point", "coordinates": [0, 0]}}),
            json!({"type": "Feature", "properties": {"b": 2}, "geometry": {"type": "Point", "coordinates": [1, 1]}}),
        ];

        assert_eq!(write_feature_collection(&path, &features).unwrap(), 2);
        let back = read_features(&path).unwrap();
        assert_eq!(back, features);
        assert_eq!(property_names(&back), vec!["a", "b"]);

        // one feature per line keeps the file scrapeable
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(scrape_features(&text).len(), 2);
    }

    #[test]
    fn test_dedup() {
        let f = json!({"type": "Feature", "properties": {}, "geometry": null});
        assert_eq!(dedup_features(vec![f.clone(), f.clone()]).len(), 1);
    }
}

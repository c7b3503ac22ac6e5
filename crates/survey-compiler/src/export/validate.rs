//! Structural validation of produced artifacts
//!
//! A tool exiting zero proves nothing; each format is opened and checked for
//! its expected layout and at least one feature.

use serde::de::IgnoredAny;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Why a candidate artifact was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Reason(pub String);

impl Reason {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::io::Error> for Reason {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<anyhow::Error> for Reason {
    fn from(e: anyhow::Error) -> Self {
        Self(format!("{:#}", e))
    }
}

/// Smallest file that can hold a collection with one real feature
pub const MIN_GEOJSON_BYTES: u64 = 64;

/// PMTiles v3 fixed header length
pub const PMTILES_HEADER_LEN: usize = 127;

fn file_size(path: &Path) -> Result<u64, Reason> {
    let meta = std::fs::metadata(path)
        .map_err(|e| Reason::new(format!("{}: {}", path.display(), e)))?;
    Ok(meta.len())
}

#[derive(Deserialize)]
struct Collection {
    #[serde(default)]
    features: Vec<FeatureShape>,
}

#[derive(Deserialize)]
struct FeatureShape {
    #[serde(default)]
    geometry: Option<IgnoredAny>,
}

/// GeoJSON feature collection with at least one feature carrying a geometry.
/// Returns that feature count.
pub fn validate_geojson(path: &Path) -> Result<u64, Reason> {
    let size = file_size(path)?;
    if size < MIN_GEOJSON_BYTES {
        return Err(Reason::new(format!("GeoJSON is only {} bytes", size)));
    }

    let file = File::open(path)?;
    let collection: Collection = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| Reason::new(format!("not a feature collection: {}", e)))?;

    let count = collection
        .features
        .iter()
        .filter(|f| f.geometry.is_some())
        .count() as u64;
    if count == 0 {
        return Err(Reason::new("feature collection has no geometries"));
    }
    Ok(count)
}

fn zip_member_names(path: &Path) -> Result<Vec<String>, Reason> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| Reason::new(format!("archive does not open: {}", e)))?;

    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| Reason::new(format!("unreadable archive entry {}: {}", i, e)))?;
        if !entry.is_dir() {
            names.push(entry.name().to_string());
        }
    }
    Ok(names)
}

fn has_extension(name: &str, ext: &str) -> bool {
    name.to_ascii_lowercase().ends_with(ext)
}

/// Record count from a dBASE header (little-endian u32 at offset 4)
pub fn dbf_record_count(header: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = header.get(4..8)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Shapefile zip: `.shp`, `.shx` and `.dbf` present, dbf holds records.
/// Returns the record count.
pub fn validate_shapefile_zip(path: &Path) -> Result<u64, Reason> {
    let names = zip_member_names(path)?;
    for ext in [".shp", ".shx", ".dbf"] {
        if !names.iter().any(|n| has_extension(n, ext)) {
            return Err(Reason::new(format!("archive has no {} member", ext)));
        }
    }

    let dbf = names
        .iter()
        .find(|n| has_extension(n, ".dbf"))
        .cloned()
        .ok_or_else(|| Reason::new("archive has no .dbf member"))?;

    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| Reason::new(e.to_string()))?;
    let mut entry = archive
        .by_name(&dbf)
        .map_err(|e| Reason::new(format!("{}: {}", dbf, e)))?;
    let mut header = [0u8; 32];
    entry
        .read_exact(&mut header)
        .map_err(|e| Reason::new(format!("{} header: {}", dbf, e)))?;

    match dbf_record_count(&header) {
        Some(0) | None => Err(Reason::new("shapefile has no records")),
        Some(n) => Ok(u64::from(n)),
    }
}

/// Geodatabase zip: contains a `.gdb` directory with table files. The
/// conversion's own feature count must be non-zero since the table format is
/// not parsed here.
pub fn validate_gdb_zip(path: &Path, features: u64) -> Result<u64, Reason> {
    let names = zip_member_names(path)?;
    if !names.iter().any(|n| n.contains(".gdb/")) {
        return Err(Reason::new("archive has no .gdb directory"));
    }
    if !names.iter().any(|n| has_extension(n, ".gdbtable")) {
        return Err(Reason::new("geodatabase has no tables"));
    }
    if features == 0 {
        return Err(Reason::new("geodatabase input had no features"));
    }
    Ok(features)
}

/// Parsed subset of a PMTiles v3 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmtilesHeader {
    pub version: u8,
    pub addressed_tiles: u64,
    pub tile_entries: u64,
    pub tile_contents: u64,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let slice: [u8; 8] = bytes.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(slice))
}

pub fn parse_pmtiles_header(bytes: &[u8]) -> Result<PmtilesHeader, Reason> {
    if bytes.len() < PMTILES_HEADER_LEN {
        return Err(Reason::new(format!("tile archive is only {} bytes", bytes.len())));
    }
    if &bytes[0..7] != b"PMTiles" {
        return Err(Reason::new("not a PMTiles archive"));
    }
    let version = bytes[7];
    if version != 3 {
        return Err(Reason::new(format!("unsupported PMTiles version {}", version)));
    }

    let field = |offset| read_u64(bytes, offset).ok_or_else(|| Reason::new("truncated header"));
    Ok(PmtilesHeader {
        version,
        addressed_tiles: field(72)?,
        tile_entries: field(80)?,
        tile_contents: field(88)?,
        min_zoom: bytes[100],
        max_zoom: bytes[101],
    })
}

/// Tile archive with a valid header and at least one stored tile
pub fn validate_pmtiles(path: &Path) -> Result<PmtilesHeader, Reason> {
    let mut header = [0u8; PMTILES_HEADER_LEN];
    File::open(path)?
        .read_exact(&mut header)
        .map_err(|e| Reason::new(format!("tile archive header: {}", e)))?;

    let parsed = parse_pmtiles_header(&header)?;
    if parsed.tile_contents == 0 {
        return Err(Reason::new("tile archive holds no tiles"));
    }
    Ok(parsed)
}

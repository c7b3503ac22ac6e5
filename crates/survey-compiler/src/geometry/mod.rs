//! Geometry handling
//!
//! Geometries travel as (E)WKB bytes. Only the header is interpreted here,
//! enough to classify a geometry and to tell whether it is empty; every
//! topological operation is delegated to [`GeometryOps`].

pub mod ops;
pub mod repair;

pub use ops::{GeometryOps, PostgisOps};
pub use repair::{RepairEngine, RepairItem, RepairOutcome, RepairStats, Repaired};

use crate::error::{CompilerError, Result};
use std::fmt;

const EWKB_Z: u32 = 0x8000_0000;
const EWKB_M: u32 = 0x4000_0000;
const EWKB_SRID: u32 = 0x2000_0000;
const TYPE_MASK: u32 = 0x0FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
    Other(u32),
}

impl GeometryKind {
    fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Point,
            2 => Self::LineString,
            3 => Self::Polygon,
            4 => Self::MultiPoint,
            5 => Self::MultiLineString,
            6 => Self::MultiPolygon,
            7 => Self::GeometryCollection,
            other => Self::Other(other),
        }
    }

    fn code(self) -> u32 {
        match self {
            Self::Point => 1,
            Self::LineString => 2,
            Self::Polygon => 3,
            Self::MultiPoint => 4,
            Self::MultiLineString => 5,
            Self::MultiPolygon => 6,
            Self::GeometryCollection => 7,
            Self::Other(code) => code,
        }
    }

    pub fn is_polygonal(self) -> bool {
        matches!(self, Self::Polygon | Self::MultiPolygon)
    }
}

/// Decoded WKB header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WkbHeader {
    pub kind: GeometryKind,
    pub little_endian: bool,
    pub srid: Option<u32>,
    pub has_z: bool,
    pub has_m: bool,
    /// Offset of the first byte after the header
    body: usize,
}

/// A geometry in WKB or PostGIS EWKB form
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Wkb(Vec<u8>);

impl Wkb {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    fn read_u32(&self, offset: usize, little_endian: bool) -> Result<u32> {
        let bytes: [u8; 4] = self
            .0
            .get(offset..offset + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| CompilerError::Geometry(format!("truncated WKB at byte {}", offset)))?;
        Ok(if little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }

    fn read_f64(&self, offset: usize, little_endian: bool) -> Result<f64> {
        let bytes: [u8; 8] = self
            .0
            .get(offset..offset + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| CompilerError::Geometry(format!("truncated WKB at byte {}", offset)))?;
        Ok(if little_endian {
            f64::from_le_bytes(bytes)
        } else {
            f64::from_be_bytes(bytes)
        })
    }

    pub fn header(&self) -> Result<WkbHeader> {
        self.header_at(0)
    }

    /// Header of the (sub)geometry starting at `offset`; parts of a
    /// collection carry their own byte order and type
    fn header_at(&self, offset: usize) -> Result<WkbHeader> {
        let little_endian = match self.0.get(offset) {
            Some(0) => false,
            Some(1) => true,
            Some(other) => {
                return Err(CompilerError::Geometry(format!("invalid byte order marker {}", other)))
            }
            None if offset == 0 => return Err(CompilerError::Geometry("empty WKB buffer".to_string())),
            None => return Err(CompilerError::Geometry(format!("truncated WKB at byte {}", offset))),
        };

        let raw = self.read_u32(offset + 1, little_endian)?;
        let iso = raw & TYPE_MASK;
        let iso_dims = iso / 1000;

        let (srid, body) = if raw & EWKB_SRID != 0 {
            (Some(self.read_u32(offset + 5, little_endian)?), offset + 9)
        } else {
            (None, offset + 5)
        };

        Ok(WkbHeader {
            kind: GeometryKind::from_code(iso % 1000),
            little_endian,
            srid,
            has_z: raw & EWKB_Z != 0 || iso_dims == 1 || iso_dims == 3,
            has_m: raw & EWKB_M != 0 || iso_dims == 2 || iso_dims == 3,
            body,
        })
    }

    pub fn kind(&self) -> Result<GeometryKind> {
        Ok(self.header()?.kind)
    }

    /// A point is empty when its coordinates are NaN, a line string or
    /// polygon when it has no points or rings, and a multi-geometry or
    /// collection when every part is empty.
    pub fn is_empty(&self) -> Result<bool> {
        let header = self.header()?;
        if let GeometryKind::Other(_) = header.kind {
            return Ok(self.read_u32(header.body, header.little_endian)? == 0);
        }
        Ok(self.walk(0)?.0)
    }

    /// Emptiness of the geometry at `offset` and the offset just past it
    fn walk(&self, offset: usize) -> Result<(bool, usize)> {
        let header = self.header_at(offset)?;
        let le = header.little_endian;
        let coord = 8 * (2 + usize::from(header.has_z) + usize::from(header.has_m));
        let body = header.body;

        match header.kind {
            GeometryKind::Point => {
                let empty = self.read_f64(body, le)?.is_nan();
                Ok((empty, body + coord))
            }
            GeometryKind::LineString => {
                let points = self.read_u32(body, le)? as usize;
                Ok((points == 0, body + 4 + points * coord))
            }
            GeometryKind::Polygon => {
                let rings = self.read_u32(body, le)? as usize;
                let mut end = body + 4;
                for _ in 0..rings {
                    let points = self.read_u32(end, le)? as usize;
                    end += 4 + points * coord;
                }
                Ok((rings == 0, end))
            }
            GeometryKind::MultiPoint
            | GeometryKind::MultiLineString
            | GeometryKind::MultiPolygon
            | GeometryKind::GeometryCollection => {
                let parts = self.read_u32(body, le)?;
                let mut end = body + 4;
                let mut empty = true;
                for _ in 0..parts {
                    let (part_empty, part_end) = self.walk(end)?;
                    empty &= part_empty;
                    end = part_end;
                }
                Ok((empty, end))
            }
            GeometryKind::Other(code) => Err(CompilerError::Geometry(format!(
                "unsupported geometry type {} at byte {}",
                code, offset
            ))),
        }
    }

    fn writer(kind: GeometryKind) -> Vec<u8> {
        let mut buf = vec![1u8];
        buf.extend_from_slice(&kind.code().to_le_bytes());
        buf
    }

    fn push_coords(buf: &mut Vec<u8>, coords: &[(f64, f64)]) {
        buf.extend_from_slice(&(coords.len() as u32).to_le_bytes());
        for (x, y) in coords {
            buf.extend_from_slice(&x.to_le_bytes());
            buf.extend_from_slice(&y.to_le_bytes());
        }
    }

    pub fn point(x: f64, y: f64) -> Self {
        let mut buf = Self::writer(GeometryKind::Point);
        buf.extend_from_slice(&x.to_le_bytes());
        buf.extend_from_slice(&y.to_le_bytes());
        Self(buf)
    }

    pub fn line_string(coords: &[(f64, f64)]) -> Self {
        let mut buf = Self::writer(GeometryKind::LineString);
        Self::push_coords(&mut buf, coords);
        Self(buf)
    }

    pub fn polygon(rings: &[Vec<(f64, f64)>]) -> Self {
        let mut buf = Self::writer(GeometryKind::Polygon);
        buf.extend_from_slice(&(rings.len() as u32).to_le_bytes());
        for ring in rings {
            Self::push_coords(&mut buf, ring);
        }
        Self(buf)
    }

    /// Axis-aligned square polygon centred on (x, y)
    pub fn square(x: f64, y: f64, half: f64) -> Self {
        Self::polygon(&[vec![
            (x - half, y - half),
            (x + half, y - half),
            (x + half, y + half),
            (x - half, y + half),
            (x - half, y - half),
        ]])
    }

    /// Collection of the given parts under a multi/collection type code
    pub fn collection(kind: GeometryKind, parts: &[Wkb]) -> Self {
        let mut buf = Self::writer(kind);
        buf.extend_from_slice(&(parts.len() as u32).to_le_bytes());
        for part in parts {
            buf.extend_from_slice(part.as_bytes());
        }
        Self(buf)
    }

    pub fn empty(kind: GeometryKind) -> Self {
        match kind {
            GeometryKind::Point => Self::point(f64::NAN, f64::NAN),
            _ => {
                let mut buf = Self::writer(kind);
                buf.extend_from_slice(&0u32.to_le_bytes());
                Self(buf)
            }
        }
    }
}

impl fmt::Debug for Wkb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.header() {
            Ok(h) => write!(f, "Wkb({:?}, {} bytes)", h.kind, self.0.len()),
            Err(_) => write!(f, "Wkb(<unreadable>, {} bytes)", self.0.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_little_endian() {
        assert_eq!(Wkb::point(1.0, 2.0).kind().unwrap(), GeometryKind::Point);
        assert_eq!(Wkb::square(0.0, 0.0, 1.0).kind().unwrap(), GeometryKind::Polygon);
        let multi = Wkb::collection(GeometryKind::MultiPolygon, &[Wkb::square(0.0, 0.0, 1.0)]);
        assert!(multi.kind().unwrap().is_polygonal());
    }

    #[test]
    fn test_big_endian_linestring() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        let wkb = Wkb::from_bytes(bytes);

        let header = wkb.header().unwrap();
        assert!(!header.little_endian);
        assert_eq!(header.kind, GeometryKind::LineString);
        assert!(wkb.is_empty().unwrap());
    }

    #[test]
    fn test_ewkb_with_srid_and_z() {
        // MultiPolygon Z with SRID 4326, one polygon part
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&(6u32 | EWKB_Z | EWKB_SRID).to_le_bytes());
        bytes.extend_from_slice(&4326u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(Wkb::square(0.0, 0.0, 1.0).as_bytes());
        let wkb = Wkb::from_bytes(bytes);

        let header = wkb.header().unwrap();
        assert_eq!(header.kind, GeometryKind::MultiPolygon);
        assert_eq!(header.srid, Some(4326));
        assert!(header.has_z);
        assert!(!wkb.is_empty().unwrap());
    }

    #[test]
    fn test_iso_z_code() {
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&1003u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let header = Wkb::from_bytes(bytes).header().unwrap();
        assert_eq!(header.kind, GeometryKind::Polygon);
        assert!(header.has_z);
    }

    #[test]
    fn test_empty_detection() {
        assert!(Wkb::empty(GeometryKind::Point).is_empty().unwrap());
        assert!(Wkb::empty(GeometryKind::GeometryCollection).is_empty().unwrap());
        assert!(!Wkb::point(3.0, 4.0).is_empty().unwrap());
        assert!(!Wkb::square(0.0, 0.0, 1.0).is_empty().unwrap());
    }

    #[test]
    fn test_multi_of_empty_parts_is_empty() {
        let hollow = Wkb::collection(GeometryKind::MultiPolygon, &[Wkb::empty(GeometryKind::Polygon)]);
        assert!(hollow.is_empty().unwrap());

        let nested = Wkb::collection(
            GeometryKind::GeometryCollection,
            &[hollow.clone(), Wkb::empty(GeometryKind::Point)],
        );
        assert!(nested.is_empty().unwrap());

        // one real part after an empty one keeps the whole geometry
        let mixed = Wkb::collection(
            GeometryKind::MultiPolygon,
            &[Wkb::empty(GeometryKind::Polygon), Wkb::square(0.0, 0.0, 1.0)],
        );
        assert!(!mixed.is_empty().unwrap());
    }

    #[test]
    fn test_truncated_is_error() {
        assert!(Wkb::from_bytes(vec![]).kind().is_err());
        assert!(Wkb::from_bytes(vec![1, 3, 0]).kind().is_err());
        assert!(Wkb::from_bytes(vec![7, 3, 0, 0, 0]).kind().is_err());
        assert!(Wkb::from_bytes(vec![1, 3, 0, 0, 0]).is_empty().is_err());
    }
}

//! Geometry repair cascade
//!
//! Input geometries go through five stages:
//!
//! 1. classify: null, unreadable or empty geometries are dropped
//! 2. split polygonal from non-polygonal
//! 3. repair non-polygonal: buffer at each configured distance, then
//!    union-and-polygonize; drop if neither yields a polygon
//! 4. validity: invalid polygons get a zero-distance buffer, and are dropped
//!    if still invalid
//! 5. emptiness: drop anything that ended up empty
//!
//! A failure on one geometry only ever drops that geometry. The caller decides
//! whether an empty result is fatal (see [`RepairOutcome::ensure_survivors`]).

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{GeometryKind, GeometryOps, Wkb};
use crate::catalog::{Theme, Year};
use crate::error::{CompilerError, Result};

#[derive(Debug, Clone)]
pub struct RepairItem<K> {
    pub key: K,
    pub geometry: Option<Wkb>,
}

#[derive(Debug, Clone)]
pub struct Repaired<K> {
    pub key: K,
    pub geometry: Wkb,
    /// Whether the geometry differs from the input
    pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairStats {
    pub input: usize,
    pub null_or_empty: usize,
    pub unreadable: usize,
    pub already_polygonal: usize,
    pub repaired_by_buffer: usize,
    pub repaired_by_polygonize: usize,
    pub unrecoverable: usize,
    pub invalid_fixed: usize,
    pub invalid_dropped: usize,
    pub empty_dropped: usize,
    pub survivors: usize,
}

impl RepairStats {
    pub fn dropped(&self) -> usize {
        self.input - self.survivors
    }
}

#[derive(Debug, Clone)]
pub struct RepairOutcome<K> {
    pub kept: Vec<Repaired<K>>,
    pub dropped: Vec<K>,
    pub stats: RepairStats,
}

impl<K> RepairOutcome<K> {
    /// Zero survivors for a theme/year is an input-data failure
    pub fn ensure_survivors(&self, theme: Theme, year: Year) -> Result<()> {
        if self.kept.is_empty() {
            return Err(CompilerError::ZeroSurvivors {
                theme: theme.to_string(),
                year: year.value(),
            });
        }
        Ok(())
    }

    pub fn changed(&self) -> impl Iterator<Item = &Repaired<K>> {
        self.kept.iter().filter(|r| r.changed)
    }
}

pub struct RepairEngine<'a> {
    ops: &'a dyn GeometryOps,
    buffer_steps: Vec<f64>,
}

impl<'a> RepairEngine<'a> {
    pub fn new(ops: &'a dyn GeometryOps, buffer_steps: Vec<f64>) -> Self {
        Self { ops, buffer_steps }
    }

    pub async fn repair<K: Clone + std::fmt::Debug + Send>(
        &self,
        items: Vec<RepairItem<K>>,
    ) -> RepairOutcome<K> {
        let mut stats = RepairStats {
            input: items.len(),
            ..RepairStats::default()
        };
        let mut dropped = Vec::new();
        let mut candidates: Vec<Repaired<K>> = Vec::with_capacity(items.len());

        for item in items {
            let Some(geometry) = item.geometry else {
                stats.null_or_empty += 1;
                dropped.push(item.key);
                continue;
            };

            let (kind, empty) = match (geometry.kind(), geometry.is_empty()) {
                (Ok(kind), Ok(empty)) => (kind, empty),
                (Err(e), _) | (_, Err(e)) => {
                    debug!(key = ?item.key, error = %e, "Unreadable geometry dropped");
                    stats.unreadable += 1;
                    dropped.push(item.key);
                    continue;
                }
            };

            if empty {
                stats.null_or_empty += 1;
                dropped.push(item.key);
                continue;
            }

            if kind.is_polygonal() {
                stats.already_polygonal += 1;
                candidates.push(Repaired {
                    key: item.key,
                    geometry,
                    changed: false,
                });
                continue;
            }

            match self.repair_non_polygonal(&geometry, &mut stats).await {
                Some(repaired) => candidates.push(Repaired {
                    key: item.key,
                    geometry: repaired,
                    changed: true,
                }),
                None => {
                    debug!(key = ?item.key, kind = ?kind, "Unrecoverable geometry dropped");
                    stats.unrecoverable += 1;
                    dropped.push(item.key);
                }
            }
        }

        let candidates = self.validity_pass(candidates, &mut stats, &mut dropped).await;

        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.geometry.is_empty().unwrap_or(true) {
                stats.empty_dropped += 1;
                dropped.push(candidate.key);
            } else {
                kept.push(candidate);
            }
        }

        stats.survivors = kept.len();

        info!(
            input = stats.input,
            survivors = stats.survivors,
            repaired_by_buffer = stats.repaired_by_buffer,
            repaired_by_polygonize = stats.repaired_by_polygonize,
            invalid_fixed = stats.invalid_fixed,
            dropped = stats.dropped(),
            "Geometry repair finished"
        );

        RepairOutcome {
            kept,
            dropped,
            stats,
        }
    }

    fn usable(geometry: &Wkb) -> bool {
        matches!(
            (geometry.kind(), geometry.is_empty()),
            (Ok(kind), Ok(false)) if kind.is_polygonal()
        )
    }

    async fn repair_non_polygonal(&self, geometry: &Wkb, stats: &mut RepairStats) -> Option<Wkb> {
        for distance in &self.buffer_steps {
            match self.ops.buffer(geometry, *distance).await {
                Ok(buffered) if Self::usable(&buffered) => {
                    stats.repaired_by_buffer += 1;
                    return Some(buffered);
                }
                Ok(_) => {}
                Err(e) => debug!(distance, error = %e, "Buffer attempt failed"),
            }
        }

        match self.ops.polygonize(geometry).await {
            Ok(polygons) if Self::usable(&polygons) => {
                stats.repaired_by_polygonize += 1;
                Some(polygons)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Polygonize attempt failed");
                None
            }
        }
    }

    async fn validity(&self, geometries: &[Wkb]) -> Vec<Option<bool>> {
        match self.ops.is_valid_batch(geometries).await {
            Ok(flags) if flags.len() == geometries.len() => flags.into_iter().map(Some).collect(),
            outcome => {
                if let Err(e) = outcome {
                    warn!(error = %e, "Batch validity check failed, checking one by one");
                }
                let mut flags = Vec::with_capacity(geometries.len());
                for geometry in geometries {
                    flags.push(self.ops.is_valid(geometry).await.ok());
                }
                flags
            }
        }
    }

    async fn validity_pass<K: std::fmt::Debug>(
        &self,
        candidates: Vec<Repaired<K>>,
        stats: &mut RepairStats,
        dropped: &mut Vec<K>,
    ) -> Vec<Repaired<K>> {
        if candidates.is_empty() {
            return candidates;
        }

        let geometries: Vec<Wkb> = candidates.iter().map(|c| c.geometry.clone()).collect();
        let flags = self.validity(&geometries).await;

        let mut out = Vec::with_capacity(candidates.len());
        for (candidate, valid) in candidates.into_iter().zip(flags) {
            if valid == Some(true) {
                out.push(candidate);
                continue;
            }

            match self.self_repair(&candidate.geometry).await {
                Some(fixed) => {
                    stats.invalid_fixed += 1;
                    out.push(Repaired {
                        key: candidate.key,
                        geometry: fixed,
                        changed: true,
                    });
                }
                None => {
                    debug!(key = ?candidate.key, "Invalid geometry dropped after zero buffer");
                    stats.invalid_dropped += 1;
                    dropped.push(candidate.key);
                }
            }
        }
        out
    }

    async fn self_repair(&self, geometry: &Wkb) -> Option<Wkb> {
        let fixed = self.ops.buffer(geometry, 0.0).await.ok()?;
        if !Self::usable(&fixed) {
            return None;
        }
        match self.ops.is_valid(&fixed).await {
            Ok(true) => Some(fixed),
            _ => None,
        }
    }
}

/// Multi-polygon wrapper for a polygon, used when callers need a uniform type
pub fn to_multi(geometry: Wkb) -> Result<Wkb> {
    match geometry.kind()? {
        GeometryKind::Polygon => Ok(Wkb::collection(GeometryKind::MultiPolygon, &[geometry])),
        _ => Ok(geometry),
    }
}

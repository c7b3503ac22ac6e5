//! Preflight checks
//!
//! Everything a run depends on is checked before anything is mutated. Object
//! store access, tools, scratch space and at least one reachable shard are
//! critical. Individual unreachable shards are recorded and the run continues
//! without them.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::aggregate::ShardSource;
use crate::catalog::{Ident, ShardCatalog, ShardName, Theme, ThemeTables, Year};
use crate::storage::ObjectStore;
use crate::tools::ToolRunner;

pub trait DiskProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Free space as reported by `statvfs(3)` for unprivileged users
#[derive(Debug, Clone, Default)]
pub struct StatvfsDisk;

impl DiskProbe for StatvfsDisk {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is a valid NUL-terminated string and stat is a valid out pointer
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
}

impl CheckResult {
    fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: None,
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardProbe {
    pub shard: ShardName,
    pub connected: bool,
    pub current_table: bool,
    pub potential_table: bool,
    pub error: Option<String>,
}

impl ShardProbe {
    /// At least one theme table exists for the year
    pub fn reachable(&self) -> bool {
        self.connected && (self.current_table || self.potential_table)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub object_store: CheckResult,
    pub tools: Vec<CheckResult>,
    pub disk: CheckResult,
    pub shards: Vec<ShardProbe>,
}

impl PreflightReport {
    pub fn reachable_shards(&self) -> Vec<ShardName> {
        self.shards
            .iter()
            .filter(|s| s.reachable())
            .map(|s| s.shard.clone())
            .collect()
    }

    /// Critical failures, empty when the run may proceed
    pub fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        let checks = std::iter::once(&self.object_store)
            .chain(self.tools.iter())
            .chain(std::iter::once(&self.disk));
        for check in checks.filter(|c| !c.passed) {
            failures.push(format!(
                "{}: {}",
                check.name,
                check.detail.as_deref().unwrap_or("failed")
            ));
        }
        if self.reachable_shards().is_empty() {
            failures.push("shards: no shard database is reachable".to_string());
        }
        failures
    }

    pub fn passed(&self) -> bool {
        self.failures().is_empty()
    }
}

pub struct Prober<'a> {
    pub store: &'a dyn ObjectStore,
    pub tools: &'a dyn ToolRunner,
    pub disk: &'a dyn DiskProbe,
    pub shards: &'a dyn ShardSource,
    pub tables: &'a ThemeTables,
    pub shard_schema: Ident,
    pub required_tools: Vec<String>,
    pub probe_timeout: std::time::Duration,
    pub scratch_dir: PathBuf,
    pub min_free_bytes: u64,
}

impl Prober<'_> {
    #[instrument(skip(self, catalog))]
    pub async fn run(&self, catalog: &ShardCatalog, year: Year) -> PreflightReport {
        let object_store = match self.store.check_access().await {
            Ok(()) => CheckResult::pass("object-store"),
            Err(e) => CheckResult::fail("object-store", format!("{:#}", e)),
        };

        let mut tools = Vec::with_capacity(self.required_tools.len());
        for tool in &self.required_tools {
            let name = format!("tool {}", tool);
            tools.push(if self.tools.available(tool, self.probe_timeout).await {
                CheckResult::pass(name)
            } else {
                CheckResult::fail(name, "not found or not executable")
            });
        }

        let disk = self.check_disk();

        let mut shards = Vec::with_capacity(catalog.shards().len());
        for shard in catalog.shards() {
            let probe = self.probe_shard(shard, year).await;
            if probe.reachable() {
                info!(shard = %shard, current = probe.current_table, potential = probe.potential_table, "Shard reachable");
            } else {
                warn!(shard = %shard, error = ?probe.error, "Shard not usable for this year");
            }
            shards.push(probe);
        }

        let report = PreflightReport {
            object_store,
            tools,
            disk,
            shards,
        };

        info!(
            reachable = report.reachable_shards().len(),
            total = catalog.shards().len(),
            passed = report.passed(),
            "Preflight finished"
        );

        report
    }

    fn check_disk(&self) -> CheckResult {
        match self.disk.free_bytes(&self.scratch_dir) {
            Ok(free) if free >= self.min_free_bytes => CheckResult::pass("disk"),
            Ok(free) => CheckResult::fail(
                "disk",
                format!(
                    "{} bytes free in {}, {} required",
                    free,
                    self.scratch_dir.display(),
                    self.min_free_bytes
                ),
            ),
            Err(e) => CheckResult::fail("disk", e.to_string()),
        }
    }

    async fn probe_shard(&self, shard: &ShardName, year: Year) -> ShardProbe {
        let mut probe = ShardProbe {
            shard: shard.clone(),
            connected: false,
            current_table: false,
            potential_table: false,
            error: None,
        };

        let mut session = match self.shards.open(shard).await {
            Ok(session) => session,
            Err(e) => {
                probe.error = Some(e.to_string());
                return probe;
            }
        };
        probe.connected = true;

        for theme in Theme::ALL {
            let exists = match self.tables.data_table(theme, year) {
                Ok(table) => session.table_exists(&self.shard_schema, &table).await,
                Err(e) => Err(e),
            };
            match (theme, exists) {
                (Theme::Current, Ok(found)) => probe.current_table = found,
                (Theme::Potential, Ok(found)) => probe.potential_table = found,
                (_, Err(e)) => probe.error = Some(e.to_string()),
            }
        }

        if let Err(e) = session.close().await {
            warn!(shard = %shard, error = %e, "Failed to close shard session");
        }

        if !probe.current_table && !probe.potential_table && probe.error.is_none() {
            probe.error = Some("no theme tables for this year".to_string());
        }

        probe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard_probe(name: &str, connected: bool, current: bool, potential: bool) -> ShardProbe {
        ShardProbe {
            shard: ShardName::new(name).unwrap(),
            connected,
            current_table: current,
            potential_table: potential,
            error: None,
        }
    }

    fn report(shards: Vec<ShardProbe>) -> PreflightReport {
        PreflightReport {
            object_store: CheckResult::pass("object-store"),
            tools: vec![CheckResult::pass("tool ogr2ogr"), CheckResult::pass("tool tippecanoe")],
            disk: CheckResult::pass("disk"),
            shards,
        }
    }

    #[test]
    fn test_one_table_is_enough() {
        let r = report(vec![
            shard_probe("musi", true, false, true),
            shard_probe("solo", true, false, false),
            shard_probe("kapuas", false, false, false),
        ]);
        assert!(r.passed());
        assert_eq!(r.reachable_shards(), vec![ShardName::new("musi").unwrap()]);
    }

    #[test]
    fn test_zero_reachable_shards_is_critical() {
        let r = report(vec![shard_probe("solo", true, false, false)]);
        assert!(!r.passed());
        assert!(r.failures()[0].starts_with("shards:"));
    }

    #[test]
    fn test_critical_checks() {
        let mut r = report(vec![shard_probe("musi", true, true, true)]);
        r.tools[1] = CheckResult::fail("tool tippecanoe", "not found or not executable");
        r.disk = CheckResult::fail("disk", "too small");
        let failures = r.failures();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("tippecanoe"));
    }

    #[test]
    fn test_statvfs_on_temp_dir() {
        let free = StatvfsDisk.free_bytes(&std::env::temp_dir()).unwrap();
        assert!(free > 0);
        assert!(StatvfsDisk.free_bytes(Path::new("/definitely/not/here")).is_err());
    }
}

//! Run progress state machine
//!
//! A run moves through a fixed list of [`Step`]s, each pinned to a percentage.
//! After every step the controller persists the new [`RunState`] through a
//! [`ProgressStore`] so an operator can watch the run from the coordination
//! database. Percentages never decrease while a run is processing; a failure
//! resets the persisted percentage to 0 with a failed status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info};

use crate::catalog::Year;
use crate::error::{CompilerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Processing,
    PreflightFailed,
    Failed,
    Completed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Processing => "PROCESSING",
            RunStatus::PreflightFailed => "PREFLIGHT_FAILED",
            RunStatus::Failed => "FAILED",
            RunStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Processing)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Preflight,
    SchemaValidate,
    DataClean,
    Aggregate,
    RepairGeometry,
    CleanResultObjects,
    CleanTileObjects,
    ExportGeoJson,
    ConvertFormats,
    GenerateTiles,
    GenerateRegionTiles,
    UploadTiles,
    MetadataWrite,
    Finalize,
}

impl Step {
    pub const ALL: [Step; 14] = [
        Step::Preflight,
        Step::SchemaValidate,
        Step::DataClean,
        Step::Aggregate,
        Step::RepairGeometry,
        Step::CleanResultObjects,
        Step::CleanTileObjects,
        Step::ExportGeoJson,
        Step::ConvertFormats,
        Step::GenerateTiles,
        Step::GenerateRegionTiles,
        Step::UploadTiles,
        Step::MetadataWrite,
        Step::Finalize,
    ];

    pub fn percentage(self) -> u8 {
        match self {
            Step::Preflight => 5,
            Step::SchemaValidate => 10,
            Step::DataClean => 20,
            Step::Aggregate => 40,
            Step::RepairGeometry => 45,
            Step::CleanResultObjects => 50,
            Step::CleanTileObjects => 60,
            Step::ExportGeoJson => 70,
            Step::ConvertFormats => 80,
            Step::GenerateTiles => 90,
            Step::GenerateRegionTiles => 92,
            Step::UploadTiles => 94,
            Step::MetadataWrite => 95,
            Step::Finalize => 100,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::Preflight => "preflight",
            Step::SchemaValidate => "schema-validate",
            Step::DataClean => "data-clean",
            Step::Aggregate => "aggregate",
            Step::RepairGeometry => "repair-geometry",
            Step::CleanResultObjects => "clean-result-objects",
            Step::CleanTileObjects => "clean-tile-objects",
            Step::ExportGeoJson => "export-geojson",
            Step::ConvertFormats => "convert-formats",
            Step::GenerateTiles => "generate-tiles",
            Step::GenerateRegionTiles => "generate-region-tiles",
            Step::UploadTiles => "upload-tiles",
            Step::MetadataWrite => "metadata-write",
            Step::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Externally visible state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub year: Year,
    pub step: Option<Step>,
    pub percentage: u8,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, year: Year) -> Self {
        Self {
            run_id: run_id.into(),
            year,
            step: None,
            percentage: 0,
            status: RunStatus::Processing,
            updated_at: Utc::now(),
        }
    }
}

/// Persists run state so progress is observable mid-run
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Create whatever `save` writes to. Must be idempotent; runs before the
    /// first write of every controller.
    async fn prepare(&self) -> Result<()>;

    async fn save(&self, state: &RunState) -> Result<()>;
}

pub struct Controller<'a> {
    store: &'a dyn ProgressStore,
    state: RunState,
    prepared: bool,
}

impl<'a> Controller<'a> {
    pub fn new(store: &'a dyn ProgressStore, run_id: impl Into<String>, year: Year) -> Self {
        Self {
            store,
            state: RunState::new(run_id, year),
            prepared: false,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    async fn persist(&mut self) -> Result<()> {
        if !self.prepared {
            self.store.prepare().await?;
            self.prepared = true;
        }
        self.state.updated_at = Utc::now();
        self.store.save(&self.state).await
    }

    /// Record the run as started at 0%
    pub async fn start(&mut self) -> Result<RunState> {
        info!(run_id = %self.state.run_id, year = %self.state.year, "Run started");
        self.persist().await?;
        Ok(self.state.clone())
    }

    /// Record the outcome of `step`.
    ///
    /// Success moves the run to the step's checkpoint (the final step also
    /// marks it completed). Failure persists `FAILED` at 0% and hands the
    /// error back to the caller.
    pub async fn advance<E>(&mut self, step: Step, result: std::result::Result<(), E>) -> anyhow::Result<RunState>
    where
        E: Into<anyhow::Error>,
    {
        if let Err(e) = result {
            return Err(self.fail(step, e.into()).await);
        }

        self.ensure_open()?;

        if let Some(previous) = self.state.step {
            if step <= previous {
                let err = CompilerError::critical(format!(
                    "step {} cannot follow {}",
                    step, previous
                ));
                return Err(self.fail(step, err.into()).await);
            }
        }

        self.state.step = Some(step);
        self.state.percentage = self.state.percentage.max(step.percentage());
        if step == Step::Finalize {
            self.state.status = RunStatus::Completed;
        }

        self.persist().await?;
        info!(
            run_id = %self.state.run_id,
            step = %step,
            percentage = self.state.percentage,
            "Step completed"
        );
        Ok(self.state.clone())
    }

    /// Like [`Controller::advance`] but passes the step's value through
    pub async fn checkpoint<T, E>(&mut self, step: Step, result: std::result::Result<T, E>) -> anyhow::Result<T>
    where
        E: Into<anyhow::Error>,
    {
        match result {
            Ok(value) => {
                self.advance(step, Ok::<(), anyhow::Error>(())).await?;
                Ok(value)
            }
            Err(e) => Err(self.fail(step, e.into()).await),
        }
    }

    /// Intermediate percentage inside a long step (never moves backwards)
    pub async fn report(&mut self, percentage: u8) -> Result<RunState> {
        let percentage = percentage.min(100);
        if percentage > self.state.percentage && !self.state.status.is_terminal() {
            self.state.percentage = percentage;
            self.persist().await?;
        }
        Ok(self.state.clone())
    }

    /// Mark the run completed without going through [`Step::Finalize`]
    pub async fn complete(&mut self) -> Result<RunState> {
        self.ensure_open()?;
        self.state.percentage = 100;
        self.state.status = RunStatus::Completed;
        self.persist().await?;
        Ok(self.state.clone())
    }

    pub async fn preflight_failed(&mut self, reasons: &[String]) -> Result<RunState> {
        error!(run_id = %self.state.run_id, reasons = ?reasons, "Preflight failed");
        self.state.percentage = 0;
        self.state.status = RunStatus::PreflightFailed;
        self.persist().await?;
        Ok(self.state.clone())
    }

    /// Persist `FAILED` at 0% for an error raised outside a named step
    pub async fn abort(&mut self, err: anyhow::Error) -> anyhow::Error {
        error!(run_id = %self.state.run_id, error = %format!("{:#}", err), "Run aborted");
        self.mark_failed().await;
        err
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.status.is_terminal() {
            return Err(CompilerError::critical(format!(
                "run {} is already {}",
                self.state.run_id, self.state.status
            )));
        }
        Ok(())
    }

    async fn fail(&mut self, step: Step, err: anyhow::Error) -> anyhow::Error {
        error!(run_id = %self.state.run_id, step = %step, error = %format!("{:#}", err), "Step failed");
        self.mark_failed().await;
        err
    }

    async fn mark_failed(&mut self) {
        self.state.percentage = 0;
        self.state.status = RunStatus::Failed;
        if let Err(persist_err) = self.persist().await {
            error!(error = %persist_err, "Could not persist failed status");
        }
    }
}

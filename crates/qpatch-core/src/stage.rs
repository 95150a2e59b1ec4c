//! Pipeline stages and progress reporting.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::error::{PatcherError, StageFailure};

/// One step of the deployment pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    ConnectServer,
    DiscoverDevice,
    LocateArchive,
    VerifyArchive,
    LocateDataBlob,
    VerifyDataBlob,
    Extract,
    VerifyLibrary,
    PatchLibrary,
    InjectConfig,
    MutateConfig,
    StripSigningMetadata,
    Repack,
    Sign,
    StageInstall,
    Uninstall,
    Install,
    PushDataBlob,
    Cleanup,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Stage; 19] = [
        Stage::ConnectServer,
        Stage::DiscoverDevice,
        Stage::LocateArchive,
        Stage::VerifyArchive,
        Stage::LocateDataBlob,
        Stage::VerifyDataBlob,
        Stage::Extract,
        Stage::VerifyLibrary,
        Stage::PatchLibrary,
        Stage::InjectConfig,
        Stage::MutateConfig,
        Stage::StripSigningMetadata,
        Stage::Repack,
        Stage::Sign,
        Stage::StageInstall,
        Stage::Uninstall,
        Stage::Install,
        Stage::PushDataBlob,
        Stage::Cleanup,
    ];

    /// Verb phrase used in progress and error messages.
    pub fn description(&self) -> &'static str {
        match self {
            Stage::ConnectServer => "connect to the ADB server",
            Stage::DiscoverDevice => "discover a supported headset",
            Stage::LocateArchive => "locate the application archive",
            Stage::VerifyArchive => "verify the application archive",
            Stage::LocateDataBlob => "locate the OBB data file",
            Stage::VerifyDataBlob => "verify the OBB data file",
            Stage::Extract => "extract the application archive",
            Stage::VerifyLibrary => "verify the native library",
            Stage::PatchLibrary => "patch the native library",
            Stage::InjectConfig => "inject the config document",
            Stage::MutateConfig => "bind the config document to the device",
            Stage::StripSigningMetadata => "strip signing metadata",
            Stage::Repack => "repack the application archive",
            Stage::Sign => "sign the patched archive",
            Stage::StageInstall => "stage the patched archive on the device",
            Stage::Uninstall => "uninstall the original application",
            Stage::Install => "install the patched archive",
            Stage::PushDataBlob => "push the OBB data file",
            Stage::Cleanup => "clean up temporary files",
        }
    }

    /// Position in the pipeline, starting at 1.
    pub fn ordinal(&self) -> usize {
        Stage::ALL
            .iter()
            .position(|stage| stage == self)
            .map_or(0, |index| index + 1)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Stage transition reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    Started(Stage),
    Completed(Stage),
    /// Stage failed with the rendered cause
    Failed(Stage, String),
}

impl StageEvent {
    pub fn stage(&self) -> Stage {
        match self {
            StageEvent::Started(stage)
            | StageEvent::Completed(stage)
            | StageEvent::Failed(stage, _) => *stage,
        }
    }
}

/// Callback for stage transitions.
pub type StageObserver = Arc<dyn Fn(&StageEvent) + Send + Sync>;

/// Tracks the current stage, logs transitions and notifies the observer.
pub struct StageTracker {
    observer: Option<StageObserver>,
    current: Option<(Stage, Instant)>,
    completed: Vec<Stage>,
}

impl StageTracker {
    pub fn new(observer: Option<StageObserver>) -> Self {
        Self {
            observer,
            current: None,
            completed: Vec::new(),
        }
    }

    /// Enter `stage`.
    pub fn begin(&mut self, stage: Stage) {
        info!(stage = ?stage, step = stage.ordinal(), "Starting: {}", stage);
        self.current = Some((stage, Instant::now()));
        self.notify(StageEvent::Started(stage));
    }

    /// Leave `stage` with the outcome of its work.
    pub fn finish<T>(
        &mut self,
        stage: Stage,
        result: Result<T, PatcherError>,
    ) -> Result<T, StageFailure> {
        let elapsed_ms = self
            .current
            .take()
            .map(|(_, started)| started.elapsed().as_millis() as u64)
            .unwrap_or_default();

        match result {
            Ok(value) => {
                info!(stage = ?stage, elapsed_ms, "Completed: {}", stage);
                self.completed.push(stage);
                self.notify(StageEvent::Completed(stage));
                Ok(value)
            }
            Err(source) => {
                error!(stage = ?stage, error = %source, "Failed: {}", stage);
                self.notify(StageEvent::Failed(stage, source.to_string()));
                Err(StageFailure::new(stage, source))
            }
        }
    }

    /// Run a synchronous stage.
    pub fn step<T>(
        &mut self,
        stage: Stage,
        work: impl FnOnce() -> Result<T, PatcherError>,
    ) -> Result<T, StageFailure> {
        self.begin(stage);
        let result = work();
        self.finish(stage, result)
    }

    /// Stage currently in progress.
    pub fn current(&self) -> Option<Stage> {
        self.current.map(|(stage, _)| stage)
    }

    /// Stages that completed, in order.
    pub fn completed(&self) -> &[Stage] {
        &self.completed
    }

    fn notify(&self, event: StageEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }
}

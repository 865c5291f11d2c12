//! Error taxonomy for sweep setup and document generation.
//!
//! Everything here is fatal for the stage that raised it. Per-variant
//! rejections and per-job failures are outcomes, not errors, and never
//! surface through these types.
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Typed failures raised while expanding sweeps and building documents.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("malformed sweep specification: {0}")]
    MalformedSpec(String),

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("include depth exceeded {limit} while merging {} (include cycle?)", path.display())]
    Cycle { path: PathBuf, limit: usize },

    #[error("sweep produces more than {limit} values")]
    TooManyValues { limit: usize },

    #[error("sweep space exceeds {limit} combinations")]
    TooManyCombinations { limit: usize },

    #[error("line {line} is past the end of {file}")]
    LinePastEnd { file: String, line: usize },
}

impl SweepError {
    pub fn malformed(message: impl Into<String>) -> Self {
        SweepError::MalformedSpec(message.into())
    }
}

/// Pipeline stage a fatal error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Settings,
    Geometry,
    Simulation,
    RunDirectory,
}

impl Stage {
    /// Process exit code reported when this stage fails.
    pub fn exit_code(self) -> u8 {
        match self {
            Stage::Settings => 1,
            Stage::Geometry => 2,
            Stage::Simulation => 3,
            Stage::RunDirectory => 4,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Settings => "settings",
            Stage::Geometry => "geometry",
            Stage::Simulation => "simulation setup",
            Stage::RunDirectory => "run directory",
        };
        f.write_str(label)
    }
}

/// A fatal error tagged with the stage that produced it.
#[derive(Debug, Error)]
#[error("{stage} stage failed")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}

/// Attach a stage to an `anyhow` result so `main` can pick the exit code.
pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> anyhow::Result<T>;
}

impl<T, E> StageContext<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn stage(self, stage: Stage) -> anyhow::Result<T> {
        self.map_err(|err| {
            anyhow::Error::new(StageError {
                stage,
                source: err.into(),
            })
        })
    }
}

/// Exit code for an error chain: the first tagged stage wins, otherwise 1.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<StageError>())
        .map(|stage_err| stage_err.stage.exit_code())
        .unwrap_or(1)
}

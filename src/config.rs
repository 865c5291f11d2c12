//! YAML settings loading.
//!
//! The settings document is deserialized into raw serde structs, then
//! resolved: paths are anchored to the settings file's directory, sweep
//! contents are parsed into typed specs, and command templates are split.
//! Nothing here touches the run directory.
use crate::external::{
    CommandTemplate, ToolSettings, CHECK_PLACEHOLDERS, DEFAULT_CHECK_COMMAND,
    DEFAULT_PRIMARY_COMMAND, DEFAULT_SECONDARY_COMMAND, JOB_PLACEHOLDERS,
};
use crate::sweep::SweepSpec;
use crate::template::{DirectiveSweep, RunLength, RunLengthSweep};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SETTINGS_FILE: &str = "config.yaml";
const FALLBACK_THREADS: usize = 4;
const DEFAULT_MIN_FREE_MEGABYTES: u64 = 512;
const DEFAULT_WATCHDOG_SECONDS: u64 = 10;
const DEFAULT_STATUS_SECONDS: u64 = 30;
const DEFAULT_GEOMEGA_SETTINGS: &str = "~/.geomega.cfg";
const DEFAULT_REVAN_SETTINGS: &str = "~/.revan.cfg";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSettings {
    threads: Option<usize>,
    #[serde(default)]
    keep_all: bool,
    hook: Option<String>,
    address: Option<String>,
    geomega_settings: Option<String>,
    revan_settings: Option<String>,
    #[serde(default)]
    status_interval_seconds: Option<u64>,
    #[serde(default)]
    watchdog: RawWatchdog,
    #[serde(default)]
    commands: RawCommands,
    geomega: Option<RawGeometry>,
    cosima: Option<RawSimulation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWatchdog {
    min_free_megabytes: Option<u64>,
    interval_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCommands {
    check: Option<String>,
    primary: Option<String>,
    secondary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawGeometry {
    filename: String,
    #[serde(default)]
    parameters: Vec<RawLineSweep>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLineSweep {
    Triple(String, usize, serde_yaml::Value),
    Mapping(RawLineMapping),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLineMapping {
    filename: Option<String>,
    line_number: usize,
    prepend: Option<String>,
    contents: serde_yaml::Value,
}

#[derive(Debug, Deserialize)]
struct RawSimulation {
    filename: String,
    #[serde(default)]
    parameters: Vec<RawDirectiveSweep>,
    events: Option<serde_yaml::Value>,
    triggers: Option<serde_yaml::Value>,
    time: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawDirectiveSweep {
    #[serde(alias = "source")]
    owner: Option<String>,
    directive: String,
    prepend: Option<String>,
    contents: serde_yaml::Value,
}

/// A line sweep as declared; `file` is resolved but not yet canonical.
#[derive(Debug, Clone, PartialEq)]
pub struct LineSweepDecl {
    pub file: PathBuf,
    pub line: usize,
    pub spec: SweepSpec,
    pub prepend: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeometrySettings {
    pub template: PathBuf,
    pub sweeps: Vec<LineSweepDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    pub template: PathBuf,
    pub sweeps: Vec<DirectiveSweep>,
    pub run_length: Vec<RunLengthSweep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    /// Free-space floor in bytes; zero disables the watchdog.
    pub min_free_bytes: u64,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub check: CommandTemplate,
    pub primary: CommandTemplate,
    pub secondary: CommandTemplate,
}

/// Notification destinations; recorded in the summary, never contacted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notifications {
    pub hook: Option<String>,
    pub address: Option<String>,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub path: PathBuf,
    pub threads: usize,
    pub keep_all: bool,
    pub notifications: Notifications,
    pub tools: ToolSettings,
    /// Tool settings files named explicitly in the document.
    pub explicit_tool_settings: Vec<PathBuf>,
    pub status_interval: Duration,
    pub watchdog: WatchdogSettings,
    pub commands: CommandSettings,
    pub geometry: GeometrySettings,
    pub simulation: SimulationSettings,
}

/// Command-line values that take precedence over the document.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub threads: Option<usize>,
    pub keep_all: bool,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("read settings {}", path.display()))?;
        Self::parse(&text, path)
    }

    /// Parse settings text; relative paths resolve against `path`'s directory.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let raw: RawSettings = serde_yaml::from_str(text)
            .with_context(|| format!("parse settings {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let threads = match raw.threads {
            Some(0) => return Err(anyhow!("threads must be at least 1")),
            Some(threads) => threads,
            None => default_threads(),
        };

        let mut explicit_tool_settings = Vec::new();
        let mut explicit = |value: Option<String>, fallback: &str| -> Result<Option<PathBuf>> {
            match value.filter(|value| !value.trim().is_empty()) {
                Some(value) => {
                    let resolved = resolve_path(base, &value)?;
                    explicit_tool_settings.push(resolved.clone());
                    Ok(Some(resolved))
                }
                None => Ok(resolve_path(base, fallback).ok()),
            }
        };
        let tools = ToolSettings {
            geomega: explicit(raw.geomega_settings, DEFAULT_GEOMEGA_SETTINGS)?,
            revan: explicit(raw.revan_settings, DEFAULT_REVAN_SETTINGS)?,
        };

        let watchdog = WatchdogSettings {
            min_free_bytes: raw
                .watchdog
                .min_free_megabytes
                .unwrap_or(DEFAULT_MIN_FREE_MEGABYTES)
                .saturating_mul(1024 * 1024),
            interval: Duration::from_secs(
                raw.watchdog
                    .interval_seconds
                    .unwrap_or(DEFAULT_WATCHDOG_SECONDS)
                    .max(1),
            ),
        };

        let commands = CommandSettings {
            check: command(raw.commands.check, DEFAULT_CHECK_COMMAND, CHECK_PLACEHOLDERS)
                .context("commands.check")?,
            primary: command(raw.commands.primary, DEFAULT_PRIMARY_COMMAND, JOB_PLACEHOLDERS)
                .context("commands.primary")?,
            secondary: command(
                raw.commands.secondary,
                DEFAULT_SECONDARY_COMMAND,
                JOB_PLACEHOLDERS,
            )
            .context("commands.secondary")?,
        };

        let geometry = raw
            .geomega
            .ok_or_else(|| anyhow!("settings need a geomega section naming the geometry template"))?;
        let geometry = resolve_geometry(base, geometry).context("geomega")?;
        let simulation = raw
            .cosima
            .ok_or_else(|| anyhow!("settings need a cosima section naming the source template"))?;
        let simulation = resolve_simulation(base, simulation).context("cosima")?;

        Ok(Self {
            path: path.to_path_buf(),
            threads,
            keep_all: raw.keep_all,
            notifications: Notifications {
                hook: raw.hook.filter(|value| !value.is_empty()),
                address: raw.address.filter(|value| !value.is_empty()),
            },
            tools,
            explicit_tool_settings,
            status_interval: Duration::from_secs(
                raw.status_interval_seconds
                    .unwrap_or(DEFAULT_STATUS_SECONDS)
                    .max(1),
            ),
            watchdog,
            commands,
            geometry,
            simulation,
        })
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(threads) = overrides.threads.filter(|threads| *threads > 0) {
            self.threads = threads;
        }
        if overrides.keep_all {
            self.keep_all = true;
        }
    }

    /// Every input file the run reads directly.
    pub fn input_files(&self) -> Vec<&Path> {
        let mut files = vec![
            self.path.as_path(),
            self.geometry.template.as_path(),
            self.simulation.template.as_path(),
        ];
        files.extend(self.geometry.sweeps.iter().map(|sweep| sweep.file.as_path()));
        files.extend(self.explicit_tool_settings.iter().map(PathBuf::as_path));
        files
    }

    /// Resolved paths of the external programs the commands invoke.
    pub fn command_programs(&self) -> Vec<PathBuf> {
        [
            &self.commands.check,
            &self.commands.primary,
            &self.commands.secondary,
        ]
        .into_iter()
        .filter_map(|template| which::which(template.program()).ok())
        .collect()
    }

    /// Fail unless every referenced file and executable exists.
    pub fn check_inputs(&self) -> Result<()> {
        for file in self.input_files() {
            if !file.is_file() {
                return Err(anyhow!("referenced file {} does not exist", file.display()));
            }
        }
        for template in [
            &self.commands.check,
            &self.commands.primary,
            &self.commands.secondary,
        ] {
            which::which(template.program()).with_context(|| {
                format!(
                    "executable {} (from {:?}) not found",
                    template.program(),
                    template.raw()
                )
            })?;
        }
        Ok(())
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(FALLBACK_THREADS)
}

fn command(value: Option<String>, fallback: &str, allowed: &[&str]) -> Result<CommandTemplate> {
    let template = CommandTemplate::parse(value.as_deref().unwrap_or(fallback))?;
    template.check_placeholders(allowed)?;
    Ok(template)
}

/// Expand a leading `~/` and anchor relative paths at `base`.
pub fn resolve_path(base: &Path, value: &str) -> Result<PathBuf> {
    if let Some(rest) = value.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot expand {value}: no home directory"))?;
        return Ok(home.join(rest));
    }
    let path = Path::new(value);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(base.join(path))
}

fn resolve_geometry(base: &Path, raw: RawGeometry) -> Result<GeometrySettings> {
    let template = resolve_path(base, &raw.filename)?;
    let template_dir = template
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| base.to_path_buf());
    let sweeps = raw
        .parameters
        .into_iter()
        .enumerate()
        .map(|(index, parameter)| {
            let (file, line, prepend, contents) = match parameter {
                RawLineSweep::Triple(file, line, contents) => (Some(file), line, None, contents),
                RawLineSweep::Mapping(mapping) => (
                    mapping.filename,
                    mapping.line_number,
                    mapping.prepend,
                    mapping.contents,
                ),
            };
            let file = match file {
                Some(file) => resolve_path(&template_dir, &file)?,
                None => template.clone(),
            };
            let spec = SweepSpec::from_node(&contents)
                .with_context(|| format!("parameters[{index}] contents"))?;
            Ok(LineSweepDecl {
                file,
                line,
                spec,
                prepend,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(GeometrySettings { template, sweeps })
}

fn resolve_simulation(base: &Path, raw: RawSimulation) -> Result<SimulationSettings> {
    let template = resolve_path(base, &raw.filename)?;
    let sweeps = raw
        .parameters
        .into_iter()
        .enumerate()
        .map(|(index, parameter)| {
            let spec = SweepSpec::from_node(&parameter.contents)
                .with_context(|| format!("parameters[{index}] contents"))?;
            Ok(DirectiveSweep {
                owner: parameter.owner,
                directive: parameter.directive,
                spec,
                prepend: parameter.prepend,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut run_length = Vec::new();
    for (kind, node) in RunLength::ALL
        .into_iter()
        .zip([raw.events, raw.triggers, raw.time])
    {
        if let Some(node) = node {
            let spec = SweepSpec::from_node(&node).with_context(|| kind.config_key().to_string())?;
            run_length.push(RunLengthSweep { kind, spec });
        }
    }

    Ok(SimulationSettings {
        template,
        sweeps,
        run_length,
    })
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

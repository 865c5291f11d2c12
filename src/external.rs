//! External collaborators: geometry checker and the two simulation stages.
//!
//! Commands are configured as shell-words templates with `{placeholder}`
//! fields. Exit codes are the only signal consumed; stdout and stderr are
//! streamed into a gzip log next to the job's documents and never parsed.
use crate::orchestrator::{Collaborators, JobStage, RunJob};
use anyhow::{anyhow, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::Rng;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::OnceLock;

pub const DEFAULT_CHECK_COMMAND: &str = "checkGeometry {geometry}";
pub const DEFAULT_PRIMARY_COMMAND: &str = "cosima -z -s {seed} {source}";
pub const DEFAULT_SECONDARY_COMMAND: &str =
    "revan -g {geometry} -c {settings} -f {output}.inc1.id1.sim.gz -n -a";

/// Placeholders a geometry check command may use.
pub const CHECK_PLACEHOLDERS: &[&str] = &["geometry", "settings"];
/// Placeholders a simulation stage command may use.
pub const JOB_PLACEHOLDERS: &[&str] = &["source", "seed", "geometry", "settings", "output"];

const MAX_SEED: u32 = 2_147_483_647;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("regex for command placeholders"))
}

/// A command line with `{name}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    raw: String,
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let argv = shell_words::split(raw).with_context(|| format!("split command {raw:?}"))?;
        if argv.is_empty() {
            return Err(anyhow!("command must not be empty"));
        }
        Ok(Self {
            raw: raw.to_string(),
            argv,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn placeholders(&self) -> BTreeSet<String> {
        self.argv
            .iter()
            .flat_map(|arg| placeholder_pattern().captures_iter(arg))
            .filter_map(|caps| caps.get(1).map(|name| name.as_str().to_string()))
            .collect()
    }

    /// Fail when the template uses a placeholder outside `allowed`.
    pub fn check_placeholders(&self, allowed: &[&str]) -> Result<()> {
        let unknown: Vec<String> = self
            .placeholders()
            .into_iter()
            .filter(|name| !allowed.contains(&name.as_str()))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        Err(anyhow!(
            "command {:?} uses unknown placeholder(s) {} (allowed: {})",
            self.raw,
            unknown.join(", "),
            allowed.join(", ")
        ))
    }

    /// Substitute placeholders, failing on any without a value.
    pub fn render(&self, vars: &BTreeMap<&str, String>) -> Result<Vec<String>> {
        let mut missing = None;
        let argv = self
            .argv
            .iter()
            .map(|arg| {
                placeholder_pattern()
                    .replace_all(arg, |caps: &regex::Captures<'_>| {
                        let name = &caps[1];
                        match vars.get(name) {
                            Some(value) => value.clone(),
                            None => {
                                missing.get_or_insert_with(|| name.to_string());
                                String::new()
                            }
                        }
                    })
                    .into_owned()
            })
            .collect();
        match missing {
            Some(name) => Err(anyhow!("no value for {{{name}}} in command {:?}", self.raw)),
            None => Ok(argv),
        }
    }
}

/// How an external process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReport {
    Code(i32),
    Signal,
}

impl ExitReport {
    pub fn success(self) -> bool {
        self == ExitReport::Code(0)
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitReport::Code(code),
            None => ExitReport::Signal,
        }
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReport::Code(code) => write!(f, "exit code {code}"),
            ExitReport::Signal => f.write_str("terminated by signal"),
        }
    }
}

/// Draw a job seed from the OS entropy source.
pub fn draw_seed() -> u32 {
    OsRng.gen_range(1..=MAX_SEED)
}

/// Run `argv` in `cwd`, streaming stdout and stderr into a gzip log.
pub fn run_logged(argv: &[String], cwd: &Path, log_path: &Path) -> Result<ExitReport> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command line"))?;
    let log = File::create(log_path).with_context(|| format!("create {}", log_path.display()))?;
    let sink = Mutex::new(GzEncoder::new(log, Compression::default()));

    tracing::debug!(command = %format_command_line(argv), cwd = %cwd.display(), "spawn");
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {}", format_command_line(argv)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout of {program} was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr of {program} was not captured"))?;

    let (stdout_result, stderr_result) = std::thread::scope(|scope| {
        let out = scope.spawn(|| pump(stdout, &sink));
        let err = pump(stderr, &sink);
        (out.join(), err)
    });
    let status = child
        .wait()
        .with_context(|| format!("wait for {program}"))?;

    stdout_result.map_err(|_| anyhow!("stdout pump for {program} panicked"))??;
    stderr_result?;
    sink.into_inner()
        .finish()
        .with_context(|| format!("finish {}", log_path.display()))?;
    Ok(status.into())
}

fn pump(mut reader: impl Read, sink: &Mutex<GzEncoder<File>>) -> Result<()> {
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer).context("read process output")?;
        if read == 0 {
            return Ok(());
        }
        sink.lock()
            .write_all(&buffer[..read])
            .context("write process log")?;
    }
}

/// Settings files handed to the external tools through `{settings}`.
#[derive(Debug, Clone, Default)]
pub struct ToolSettings {
    pub geomega: Option<PathBuf>,
    pub revan: Option<PathBuf>,
}

/// The configured external commands, run inside the run directory.
#[derive(Debug, Clone)]
pub struct ExternalTools {
    pub run_dir: PathBuf,
    pub check: CommandTemplate,
    pub primary: CommandTemplate,
    pub secondary: CommandTemplate,
    pub settings: ToolSettings,
}

impl ExternalTools {
    fn template(&self, stage: JobStage) -> &CommandTemplate {
        match stage {
            JobStage::Primary => &self.primary,
            JobStage::Secondary => &self.secondary,
        }
    }

    fn stage_settings(&self, stage: JobStage) -> Option<&Path> {
        match stage {
            JobStage::Primary => self.settings.geomega.as_deref(),
            JobStage::Secondary => self.settings.revan.as_deref(),
        }
    }
}

impl Collaborators for ExternalTools {
    fn check_geometry(&self, geometry: &Path) -> Result<ExitReport> {
        let mut vars = BTreeMap::new();
        vars.insert("geometry", geometry.display().to_string());
        if let Some(settings) = self.settings.geomega.as_deref() {
            vars.insert("settings", settings.display().to_string());
        }
        let argv = self.check.render(&vars)?;
        let name = geometry
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "geometry".to_string());
        let log = self.run_dir.join(format!("{name}.check.log.gz"));
        run_logged(&argv, &self.run_dir, &log)
    }

    fn run_stage(&self, stage: JobStage, job: &RunJob, seed: u32) -> Result<ExitReport> {
        let mut vars = BTreeMap::new();
        vars.insert("source", job.document.display().to_string());
        vars.insert("seed", seed.to_string());
        vars.insert("output", job.output_base.clone());
        if let Some(geometry) = job.geometry.as_deref() {
            vars.insert("geometry", geometry.to_string());
        }
        if let Some(settings) = self.stage_settings(stage) {
            vars.insert("settings", settings.display().to_string());
        }
        let argv = self.template(stage).render(&vars)?;
        let log = self
            .run_dir
            .join(format!("{}.{}.log.gz", job.output_base, stage.label()));
        run_logged(&argv, &self.run_dir, &log)
    }

    fn cleanup(&self, job: &RunJob) -> Result<usize> {
        let prefix = format!("{}.", job.output_base);
        let mut removed = 0;
        for entry in fs::read_dir(&self.run_dir)
            .with_context(|| format!("read {}", self.run_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.contains(".sim") {
                fs::remove_file(entry.path())
                    .with_context(|| format!("remove {}", entry.path().display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn format_command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg.chars().all(|ch| {
        matches!(
            ch,
            'a'..='z'
                | 'A'..='Z'
                | '0'..='9'
                | '_'
                | '-'
                | '.'
                | '/'
                | ':'
                | '@'
                | '+'
                | '='
        )
    });
    if safe {
        return arg.to_string();
    }
    let escaped = arg.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

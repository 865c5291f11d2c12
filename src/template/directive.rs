//! Directive substitution for simulation source templates.
//!
//! Directives are single-line statements addressed by name
//! (`Owner.Directive value...`) rather than by line number. Each swept
//! directive must appear on exactly one template line; that line is replaced
//! wholesale by `Owner.Directive <chosen value>`.
use super::render_lines;
use crate::error::SweepError;
use crate::sweep::{combine, expand, Combination, SweepSet, SweepSpec};
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// Directive selecting the geometry file a run uses.
pub const GEOMETRY_DIRECTIVE: &str = "Geometry";
/// Keyword declaring a run object.
pub const RUN_KEYWORD: &str = "Run";
/// Per-run directive naming the output file base.
pub const FILENAME_DIRECTIVE: &str = "FileName";

/// Mutually exclusive ways of bounding a run's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLength {
    Events,
    Triggers,
    Time,
}

impl RunLength {
    pub const ALL: [RunLength; 3] = [RunLength::Events, RunLength::Triggers, RunLength::Time];

    /// Settings key declaring this run length.
    pub fn config_key(self) -> &'static str {
        match self {
            RunLength::Events => "events",
            RunLength::Triggers => "triggers",
            RunLength::Time => "time",
        }
    }

    /// Directive name on the run object.
    pub fn directive(self) -> &'static str {
        match self {
            RunLength::Events => "NEvents",
            RunLength::Triggers => "Triggers",
            RunLength::Time => "Time",
        }
    }
}

impl fmt::Display for RunLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_key())
    }
}

/// A sweep over one named directive.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveSweep {
    pub owner: Option<String>,
    pub directive: String,
    pub spec: SweepSpec,
    pub prepend: Option<String>,
}

impl DirectiveSweep {
    pub fn key(&self) -> String {
        match self.owner.as_deref().filter(|owner| !owner.is_empty()) {
            Some(owner) => format!("{owner}.{}", self.directive),
            None => self.directive.clone(),
        }
    }
}

/// A sweep over the run object's length directive.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLengthSweep {
    pub kind: RunLength,
    pub spec: SweepSpec,
}

/// The `Run <name>` declaration of a source template.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunObject {
    name: String,
    line: usize,
}

/// A parsed simulation source template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTemplate {
    lines: Vec<String>,
    run: Option<RunObject>,
}

impl SourceTemplate {
    pub fn load(path: &Path) -> Result<Self, SweepError> {
        let text = std::fs::read_to_string(path).map_err(|source| SweepError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse template text. At most one named `Run <name>` declaration is
    /// allowed; a template without one is substituted but never renamed.
    pub fn parse(text: &str) -> Result<Self, SweepError> {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let mut runs = lines.iter().enumerate().filter_map(|(index, line)| {
            let mut tokens = line.split_whitespace();
            (tokens.next() == Some(RUN_KEYWORD)).then(|| (index, tokens.next()))
        });
        let run = match (runs.next(), runs.next()) {
            (None, _) => None,
            (Some((index, Some(name))), None) => Some(RunObject {
                name: name.to_string(),
                line: index,
            }),
            (Some((index, None)), _) => {
                return Err(SweepError::malformed(format!(
                    "line {} declares a {RUN_KEYWORD} without a name",
                    index + 1
                )));
            }
            (Some(_), Some(_)) => {
                return Err(SweepError::malformed(format!(
                    "source template declares more than one {RUN_KEYWORD}"
                )));
            }
        };
        Ok(Self { lines, run })
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn run_name(&self) -> Option<&str> {
        self.run.as_ref().map(|run| run.name.as_str())
    }

    pub fn filename_key(&self) -> Option<String> {
        self.run_name().map(|name| format!("{name}.{FILENAME_DIRECTIVE}"))
    }

    /// Index of the single line whose leading token is `key`.
    pub fn directive_line(&self, key: &str) -> Result<usize, SweepError> {
        let matches = self.directive_lines(key);
        match matches.as_slice() {
            [index] => Ok(*index),
            [] => Err(SweepError::malformed(format!(
                "directive {key} does not appear in the source template"
            ))),
            _ => Err(SweepError::malformed(format!(
                "directive {key} appears {} times in the source template",
                matches.len()
            ))),
        }
    }

    fn directive_lines(&self, key: &str) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, line)| leading_token(line) == Some(key))
            .map(|(index, _)| index)
            .collect()
    }
}

fn leading_token(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

fn directive_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .expect("regex for directive names")
    })
}

/// Collect the sweeps for one simulation family.
///
/// At most one run-length directive may be declared. When geometries are
/// supplied, a synthetic sweep over the geometry directive fans every
/// combination out across them.
pub fn build_sweep_set(
    template: &SourceTemplate,
    sweeps: &[DirectiveSweep],
    run_length: &[RunLengthSweep],
    geometries: &[String],
) -> Result<SweepSet, SweepError> {
    if run_length.len() > 1 {
        let declared: Vec<String> = run_length.iter().map(|sweep| sweep.kind.to_string()).collect();
        return Err(SweepError::malformed(format!(
            "only one of events, triggers, time may be declared (found {})",
            declared.join(", ")
        )));
    }

    let mut set = SweepSet::new();
    for sweep in sweeps {
        set.insert(sweep.key(), expand(&sweep.spec, sweep.prepend.as_deref())?)?;
    }
    for sweep in run_length {
        let run_name = template.run_name().ok_or_else(|| {
            SweepError::malformed(format!(
                "{} needs a {RUN_KEYWORD} declaration in the source template",
                sweep.kind
            ))
        })?;
        let key = format!("{run_name}.{}", sweep.kind.directive());
        set.insert(key, expand(&sweep.spec, None)?)?;
    }
    if !geometries.is_empty() {
        set.insert(GEOMETRY_DIRECTIVE, geometries.to_vec())?;
    }
    Ok(set)
}

/// One source document produced for one combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutedDocument {
    pub ordinal: usize,
    pub combination: Combination,
    pub output_base: String,
    pub lines: Vec<String>,
}

impl SubstitutedDocument {
    pub fn render(&self) -> String {
        render_lines(&self.lines)
    }
}

/// Output file base for the run at `ordinal`; unique per combination.
pub fn output_base(ordinal: usize) -> String {
    format!("run{ordinal}")
}

#[derive(Debug, Clone, Copy)]
enum FilenameSlot {
    Replace(usize),
    InsertAfter(usize),
}

/// Resolved directive lines over one source template.
#[derive(Debug)]
pub struct SubstitutionPlan<'a> {
    template: &'a SourceTemplate,
    sweeps: SweepSet,
    slots: Vec<(String, usize)>,
    filename: Option<FilenameSlot>,
}

impl<'a> SubstitutionPlan<'a> {
    pub fn new(template: &'a SourceTemplate, sweeps: SweepSet) -> Result<Self, SweepError> {
        let filename_key = template.filename_key();
        let mut slots = Vec::with_capacity(sweeps.len());
        for key in sweeps.keys() {
            if !directive_name_pattern().is_match(key) {
                return Err(SweepError::malformed(format!(
                    "{key:?} is not a directive name (expected Owner.Directive)"
                )));
            }
            if filename_key.as_deref() == Some(key) {
                return Err(SweepError::malformed(format!(
                    "{key} is assigned per run and cannot be swept"
                )));
            }
            slots.push((key.to_string(), template.directive_line(key)?));
        }

        let filename = match (&template.run, &filename_key) {
            (Some(run), Some(filename_key)) => {
                match template.directive_lines(filename_key).as_slice() {
                    [] => Some(FilenameSlot::InsertAfter(run.line)),
                    [index] => Some(FilenameSlot::Replace(*index)),
                    many => {
                        return Err(SweepError::malformed(format!(
                            "directive {filename_key} appears {} times in the source template",
                            many.len()
                        )));
                    }
                }
            }
            _ => None,
        };

        Ok(Self {
            template,
            sweeps,
            slots,
            filename,
        })
    }

    pub fn sweeps(&self) -> &SweepSet {
        &self.sweeps
    }

    pub fn combinations(&self) -> Result<Vec<Combination>, SweepError> {
        combine(&self.sweeps)
    }

    /// Rewrite the template for the combination at position `ordinal`.
    pub fn apply(&self, ordinal: usize, combination: &Combination) -> SubstitutedDocument {
        let mut lines = self.template.lines().to_vec();
        for (key, index) in &self.slots {
            if let Some(value) = combination.get(key) {
                lines[*index] = format!("{key} {value}");
            }
        }

        let output_base = output_base(ordinal);
        if let (Some(slot), Some(key)) = (self.filename, self.template.filename_key()) {
            let filename_line = format!("{key} {output_base}");
            match slot {
                FilenameSlot::Replace(index) => lines[index] = filename_line,
                FilenameSlot::InsertAfter(index) => lines.insert(index + 1, filename_line),
            }
        }

        SubstitutedDocument {
            ordinal,
            combination: combination.clone(),
            output_base,
            lines,
        }
    }
}

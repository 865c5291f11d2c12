//! Shared test infrastructure for integration tests.
//!
//! A `SweepFixture` lays out templates, stand-in collaborator scripts and a
//! settings document in a scratch directory, then drives the built binary.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

pub const DETECTOR: &str = "\
Name Detector
Include Layer.geo
Volume World
";

pub const LAYER: &str = "\
Volume Layer
Layer.Thickness 0
Layer.Material Si
";

pub const SOURCE: &str = "\
Version 1
Geometry placeholder.geo.setup
Run Sim
Sim.FileName placeholder
Sim.NEvents 100
Sim.Source Src
Src.Beam FarFieldPointSource 0 0
Src.Flux 1
";

/// Rejects the variant whose layer thickness is 2.
pub const CHECK_SCRIPT: &str = "#!/bin/sh\necho checking \"$1\"\n! grep -q '^Layer.Thickness 2$' \"$1\"\n";

/// Rejects every variant.
pub const REJECT_ALL_SCRIPT: &str = "#!/bin/sh\necho rejecting \"$1\"\nexit 1\n";

/// Fails for run1; otherwise leaves an intermediate simulation file.
pub const PRIMARY_SCRIPT: &str = "#!/bin/sh\n\
echo primary \"$@\"\n\
[ \"$1\" = run1 ] && { echo boom >&2; exit 5; }\n\
touch \"$1.inc1.id1.sim.gz\"\n";

pub const SECONDARY_SCRIPT: &str = "#!/bin/sh\n\
test -f \"$1.inc1.id1.sim.gz\" || exit 7\n\
touch \"$1.tra.gz\"\n";

pub struct SweepFixture {
    pub root: TempDir,
    pub inputs: PathBuf,
    pub run_dir: PathBuf,
}

impl SweepFixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("create temp dir");
        let inputs = root.path().join("inputs");
        let run_dir = root.path().join("run");
        fs::create_dir_all(&inputs).expect("create inputs dir");

        write_file(&inputs.join("Detector.geo.setup"), DETECTOR);
        write_file(&inputs.join("Layer.geo"), LAYER);
        write_file(&inputs.join("Run.source"), SOURCE);
        write_script(&inputs.join("check.sh"), CHECK_SCRIPT);
        write_script(&inputs.join("primary.sh"), PRIMARY_SCRIPT);
        write_script(&inputs.join("secondary.sh"), SECONDARY_SCRIPT);

        Self {
            root,
            inputs,
            run_dir,
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.inputs.join("config.yaml")
    }

    /// Settings sweeping layer thickness over 1..4 and the beam over A, B.
    pub fn default_settings(&self) -> String {
        let script = |name: &str| self.inputs.join(name).display().to_string();
        format!(
            "threads: 2
watchdog: {{ minFreeMegabytes: 0 }}
statusIntervalSeconds: 1
commands:
  check: {check} {{geometry}}
  primary: {primary} {{output}} {{seed}}
  secondary: {secondary} {{output}}
geomega:
  filename: Detector.geo.setup
  parameters:
    - filename: Layer.geo
      lineNumber: 2
      prepend: Layer.Thickness
      contents: [1, 4, 1]
cosima:
  filename: Run.source
  parameters:
    - source: Src
      directive: Beam
      contents: [[A, B]]
",
            check = script("check.sh"),
            primary = script("primary.sh"),
            secondary = script("secondary.sh"),
        )
    }

    pub fn write_settings(&self, text: &str) {
        write_file(&self.settings_path(), text);
    }

    pub fn run(&self, subcommand: &str, extra: &[&str]) -> Output {
        self.run_in(&self.run_dir, subcommand, extra)
    }

    pub fn run_in(&self, run_dir: &Path, subcommand: &str, extra: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_megasweep"))
            .arg(subcommand)
            .arg("--settings")
            .arg(self.settings_path())
            .arg("--run-dir")
            .arg(run_dir)
            .args(extra)
            .env("MEGASWEEP_LOG", "megasweep=debug")
            .output()
            .expect("run megasweep")
    }

    pub fn run_file(&self, name: &str) -> PathBuf {
        self.run_dir.join(name)
    }

    pub fn summary(&self) -> serde_json::Value {
        let text = fs::read_to_string(self.run_file("summary.json")).expect("read summary");
        serde_json::from_str(&text).expect("parse summary")
    }

    pub fn legend(&self) -> Vec<serde_json::Value> {
        let text = fs::read_to_string(self.run_file("run.legend")).expect("read legend");
        text.lines()
            .map(|line| serde_json::from_str(line).expect("parse legend record"))
            .collect()
    }
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent directory");
    }
    fs::write(path, contents.as_bytes()).expect("write file");
}

pub fn write_script(path: &Path, contents: &str) {
    write_file(path, contents);
    let mut permissions = fs::metadata(path).expect("stat script").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions).expect("chmod script");
}

pub fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

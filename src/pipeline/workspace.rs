//! Run directory preparation.
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Create `run_dir` if needed and insist it holds nothing but inputs.
///
/// An entry is tolerated when it is one of `inputs` or a directory that
/// contains one. Returns the canonical run directory.
pub fn prepare_run_dir(run_dir: &Path, inputs: &[&Path], allow_dirty: bool) -> Result<PathBuf> {
    fs::create_dir_all(run_dir).with_context(|| format!("create {}", run_dir.display()))?;
    let run_dir = run_dir
        .canonicalize()
        .with_context(|| format!("resolve {}", run_dir.display()))?;
    let inputs: Vec<PathBuf> = inputs
        .iter()
        .filter_map(|input| input.canonicalize().ok())
        .collect();

    let mut strangers = Vec::new();
    for entry in fs::read_dir(&run_dir).with_context(|| format!("read {}", run_dir.display()))? {
        let entry = entry.with_context(|| format!("read {}", run_dir.display()))?;
        let path = entry.path();
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
        if !inputs.iter().any(|input| input.starts_with(&canonical)) {
            strangers.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    if strangers.is_empty() {
        return Ok(run_dir);
    }
    strangers.sort();
    let listed = strangers
        .iter()
        .take(5)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if allow_dirty {
        tracing::warn!(dir = %run_dir.display(), entries = %listed, "run directory is not empty");
        return Ok(run_dir);
    }
    Err(anyhow!(
        "run directory {} is not empty ({} unexpected entr{}: {listed}); use a fresh directory or --allow-dirty",
        run_dir.display(),
        strangers.len(),
        if strangers.len() == 1 { "y" } else { "ies" }
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_and_their_directories_are_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = dir.path().join("config.yaml");
        fs::write(&settings, "").expect("write settings");
        fs::create_dir_all(dir.path().join("templates")).expect("mkdir");
        let template = dir.path().join("templates/Run.source");
        fs::write(&template, "").expect("write template");

        let resolved =
            prepare_run_dir(dir.path(), &[&settings, &template], false).expect("clean dir");
        assert_eq!(resolved, dir.path().canonicalize().expect("canonical"));
    }

    #[test]
    fn leftovers_are_refused_unless_allowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("run0.source"), "").expect("write leftover");

        let err = prepare_run_dir(dir.path(), &[], false).expect_err("dirty");
        assert!(err.to_string().contains("run0.source"));
        assert!(prepare_run_dir(dir.path(), &[], true).is_ok());
    }

    #[test]
    fn missing_directories_are_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b");
        prepare_run_dir(&nested, &[], false).expect("create");
        assert!(nested.is_dir());
    }
}

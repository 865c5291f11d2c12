//! Geometry stage: merge the template, write one variant per combination of
//! line sweeps, and validate every variant with the check command.
use crate::config::{GeometrySettings, LineSweepDecl};
use crate::error::SweepError;
use crate::legend::{AppliedValue, Legend, LegendRecord};
use crate::orchestrator::{run_bounded, Collaborators, OrchestratorContext, ProgressStage};
use crate::sweep::Combination;
use crate::template::{LineTarget, MergedDocument, PatchPlan};
use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// A geometry document written to the run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryVariant {
    pub path: PathBuf,
    pub combination: Combination,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeometryReport {
    pub generated: usize,
    pub accepted: Vec<PathBuf>,
    pub rejected: usize,
}

pub fn variant_file_name(combination: &Combination) -> String {
    format!("geo.{}.geo.setup", combination.coordinate_label())
}

/// Canonicalize each declared file so it matches the merge markers.
pub fn resolve_targets(sweeps: &[LineSweepDecl]) -> Result<Vec<LineTarget>, SweepError> {
    sweeps
        .iter()
        .map(|sweep| {
            let file = sweep
                .file
                .canonicalize()
                .map_err(|source| SweepError::Io {
                    path: sweep.file.clone(),
                    source,
                })?;
            Ok(LineTarget {
                file: file.display().to_string(),
                line: sweep.line,
                spec: sweep.spec.clone(),
                prepend: sweep.prepend.clone(),
            })
        })
        .collect()
}

/// Write every geometry variant of `document` into `run_dir`, recording each
/// one in the legend as it lands.
///
/// A variant that cannot be written is dropped with a warning; losing all
/// of them is fatal.
pub fn write_variants(
    document: &MergedDocument,
    settings: &GeometrySettings,
    run_dir: &Path,
    legend: &Legend,
) -> Result<Vec<GeometryVariant>> {
    let targets = resolve_targets(&settings.sweeps)?;
    let plan = PatchPlan::new(document, &targets)?;
    let combinations = plan.combinations()?;
    for key in plan.sweeps().keys() {
        let values = plan.sweeps().values(key).map_or(0, <[String]>::len);
        tracing::debug!(target_line = key, values, "geometry sweep");
    }
    tracing::info!(
        template = document.root(),
        sweeps = plan.sweeps().len(),
        variants = combinations.len(),
        "generating geometry variants"
    );

    let mut variants = Vec::with_capacity(combinations.len());
    for combination in combinations {
        let path = run_dir.join(variant_file_name(&combination));
        let patched = plan.apply(&combination);
        if let Err(err) = fs::write(&path, patched.render()) {
            tracing::warn!(path = %path.display(), error = %err, "dropping geometry variant");
            continue;
        }
        legend.append(&LegendRecord::Geometry {
            document: path.display().to_string(),
            coordinates: combination.coordinates(),
            applied: AppliedValue::from_combination(&combination),
        })?;
        variants.push(GeometryVariant { path, combination });
    }
    if variants.is_empty() {
        return Err(anyhow!("no geometry variant was written to {}", run_dir.display()));
    }
    Ok(variants)
}

/// Run the check command over every variant on the shared pool.
///
/// Rejections are outcomes: they are logged and recorded, never errors.
pub fn validate_variants<C: Collaborators>(
    ctx: &OrchestratorContext,
    collaborators: &C,
    variants: Vec<GeometryVariant>,
    limit: usize,
) -> Result<GeometryReport> {
    ctx.add_total(ProgressStage::Validation, variants.len());
    let verdicts = run_bounded(ctx, limit, variants.clone(), |_, variant| {
        let verdict = collaborators.check_geometry(&variant.path);
        ctx.complete(ProgressStage::Validation);
        let accepted = match verdict {
            Ok(report) if report.success() => true,
            Ok(report) => {
                tracing::warn!(geometry = %variant.path.display(), %report, "geometry rejected");
                false
            }
            Err(err) => {
                tracing::warn!(geometry = %variant.path.display(), error = %format!("{err:#}"), "geometry check failed to run");
                false
            }
        };
        ctx.legend()
            .append(&LegendRecord::Verdict {
                document: variant.path.display().to_string(),
                accepted,
            })
            .map(|()| accepted)
    });

    let mut report = GeometryReport {
        generated: variants.len(),
        ..GeometryReport::default()
    };
    for (variant, verdict) in variants.into_iter().zip(verdicts) {
        if verdict.transpose()?.unwrap_or(false) {
            report.accepted.push(variant.path);
        } else {
            report.rejected += 1;
        }
    }
    tracing::info!(
        accepted = report.accepted.len(),
        rejected = report.rejected,
        "geometry validation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ExitReport;
    use crate::orchestrator::test_support::context;
    use crate::orchestrator::{JobStage, RunJob};
    use crate::sweep::SweepSpec;
    use crate::template::merge;

    struct RejectOdd;

    impl Collaborators for RejectOdd {
        fn check_geometry(&self, geometry: &Path) -> Result<ExitReport> {
            let text = fs::read_to_string(geometry)?;
            let odd = text.lines().any(|line| line == "Layer.Thickness 1");
            Ok(ExitReport::Code(i32::from(odd)))
        }

        fn run_stage(&self, _stage: JobStage, _job: &RunJob, _seed: u32) -> Result<ExitReport> {
            unreachable!("geometry stage never runs jobs")
        }

        fn cleanup(&self, _job: &RunJob) -> Result<usize> {
            Ok(0)
        }
    }

    fn settings(dir: &Path) -> GeometrySettings {
        fs::write(
            dir.join("Detector.geo.setup"),
            "Name Detector\nInclude Layer.geo\n",
        )
        .expect("write template");
        fs::write(dir.join("Layer.geo"), "Volume Layer\nLayer.Thickness 9\n").expect("write layer");
        GeometrySettings {
            template: dir.join("Detector.geo.setup"),
            sweeps: vec![LineSweepDecl {
                file: dir.join("Layer.geo"),
                line: 2,
                spec: SweepSpec::IntRange {
                    start: 0,
                    stop: 3,
                    step: 1,
                },
                prepend: Some("Layer.Thickness".to_string()),
            }],
        }
    }

    fn write(
        settings: &GeometrySettings,
        ctx: &OrchestratorContext,
        run_dir: &Path,
    ) -> Result<Vec<GeometryVariant>> {
        let document = merge(&settings.template)?;
        write_variants(&document, settings, run_dir, ctx.legend())
    }

    fn legend_kinds(ctx: &OrchestratorContext) -> Vec<String> {
        fs::read_to_string(ctx.legend().path())
            .expect("read legend")
            .lines()
            .map(|line| {
                let record: serde_json::Value = serde_json::from_str(line).expect("record");
                record["kind"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }

    #[test]
    fn variants_are_written_and_validated() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let (run_dir, ctx) = context();
        let variants = write(&settings(inputs.path()), &ctx, run_dir.path()).expect("write");
        assert_eq!(legend_kinds(&ctx), ["geometry", "geometry", "geometry"]);
        let names: Vec<String> = variants
            .iter()
            .filter_map(|variant| variant.path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["geo.0.geo.setup", "geo.1.geo.setup", "geo.2.geo.setup"]);
        let text = fs::read_to_string(&variants[2].path).expect("read variant");
        assert!(text.contains("\nLayer.Thickness 2\n"));
        assert!(!text.contains("Layer.Thickness 9"));

        let report = validate_variants(&ctx, &RejectOdd, variants, 2).expect("validate");
        assert_eq!(report.generated, 3);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.accepted.len(), 2);
        assert!(report.accepted[1].ends_with("geo.2.geo.setup"));

        let kinds = legend_kinds(&ctx);
        assert_eq!(kinds.len(), 6);
        assert_eq!(kinds.iter().filter(|kind| *kind == "verdict").count(), 3);
        assert_eq!(ctx.snapshot().validation.completed, 3);
    }

    #[test]
    fn unswept_template_yields_a_base_variant() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let mut settings = settings(inputs.path());
        settings.sweeps.clear();
        let (run_dir, ctx) = context();
        let variants = write(&settings, &ctx, run_dir.path()).expect("write");
        assert_eq!(variants.len(), 1);
        assert!(variants[0].path.ends_with("geo.base.geo.setup"));
    }

    #[test]
    fn missing_target_file_is_an_error() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let mut settings = settings(inputs.path());
        settings.sweeps[0].file = inputs.path().join("Gone.geo");
        let (run_dir, ctx) = context();
        assert!(write(&settings, &ctx, run_dir.path()).is_err());
        assert!(legend_kinds(&ctx).is_empty());
    }
}

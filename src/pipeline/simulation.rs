//! Simulation setup stage: one source document per combination of directive
//! sweeps and accepted geometries.
use crate::config::SimulationSettings;
use crate::legend::{AppliedValue, Legend, LegendRecord};
use crate::orchestrator::RunJob;
use crate::template::directive::GEOMETRY_DIRECTIVE;
use crate::template::{build_sweep_set, SourceTemplate, SubstitutionPlan};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;

pub const SOURCE_EXTENSION: &str = "source";

/// Check the simulation sweeps against the source template before any
/// geometry is generated: run-length conflicts, directive names, unique
/// directive lines and the size of the space.
pub fn check_settings(settings: &SimulationSettings) -> Result<()> {
    let template = SourceTemplate::load(&settings.template)
        .with_context(|| format!("load {}", settings.template.display()))?;
    let sweeps = build_sweep_set(&template, &settings.sweeps, &settings.run_length, &[])?;
    let plan = SubstitutionPlan::new(&template, sweeps)?;
    let documents = plan.sweeps().space_size()?;
    if template.run_name().is_none() {
        tracing::warn!(
            template = %settings.template.display(),
            "source template declares no Run; output file names are not rewritten"
        );
    }
    tracing::debug!(template = %settings.template.display(), documents, "simulation settings checked");
    Ok(())
}

/// Write every run document and return the jobs that will execute them.
pub fn write_run_documents(
    settings: &SimulationSettings,
    geometries: &[String],
    run_dir: &Path,
    legend: &Legend,
) -> Result<Vec<RunJob>> {
    let template = SourceTemplate::load(&settings.template)
        .with_context(|| format!("load {}", settings.template.display()))?;
    let sweeps = build_sweep_set(&template, &settings.sweeps, &settings.run_length, geometries)?;
    let plan = SubstitutionPlan::new(&template, sweeps)?;
    let combinations = plan.combinations()?;
    for key in plan.sweeps().keys() {
        let values = plan.sweeps().values(key).map_or(0, <[String]>::len);
        tracing::debug!(directive = key, values, "simulation sweep");
    }
    tracing::info!(
        template = %settings.template.display(),
        run = template.run_name().unwrap_or("-"),
        geometries = geometries.len(),
        documents = combinations.len(),
        "generating simulation documents"
    );

    let mut jobs = Vec::with_capacity(combinations.len());
    for (ordinal, combination) in combinations.iter().enumerate() {
        let document = plan.apply(ordinal, combination);
        let path = run_dir.join(format!("{}.{SOURCE_EXTENSION}", document.output_base));
        if let Err(err) = fs::write(&path, document.render()) {
            tracing::warn!(path = %path.display(), error = %err, "dropping simulation document");
            continue;
        }
        legend.append(&LegendRecord::Run {
            ordinal,
            document: path.display().to_string(),
            output: document.output_base.clone(),
            coordinates: combination.coordinates(),
            applied: AppliedValue::from_combination(combination),
        })?;
        jobs.push(RunJob {
            ordinal,
            document: path,
            geometry: combination.get(GEOMETRY_DIRECTIVE).map(str::to_string),
            output_base: document.output_base,
        });
    }
    if jobs.is_empty() && !combinations.is_empty() {
        return Err(anyhow!(
            "no simulation document was written to {}",
            run_dir.display()
        ));
    }
    Ok(jobs)
}

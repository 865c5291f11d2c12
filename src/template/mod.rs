//! Template documents: include flattening, line patching, and directive
//! substitution.
pub mod directive;
pub mod merge;
pub mod patch;

pub use directive::{
    build_sweep_set, DirectiveSweep, RunLength, RunLengthSweep, SourceTemplate, SubstitutionPlan,
};
pub use merge::{merge, MergedDocument};
pub use patch::{LineTarget, PatchPlan};

/// Join lines into file contents with a trailing newline.
pub fn render_lines(lines: &[String]) -> String {
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

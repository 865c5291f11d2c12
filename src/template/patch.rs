//! Line-addressed patching of merged geometry documents.
//!
//! Targets name a physical line of one source file. Each target is resolved
//! once to the merged-document indices that hold that line; every
//! combination then only copies the document and overwrites those indices.
use super::merge::{parse_marker, Marker, MergedDocument};
use super::render_lines;
use crate::error::SweepError;
use crate::sweep::{combine, expand, Combination, SweepSet, SweepSpec};
use std::collections::BTreeMap;

/// One swept line of one source file.
#[derive(Debug, Clone, PartialEq)]
pub struct LineTarget {
    /// Canonical path of the source file, as it appears in the markers.
    pub file: String,
    /// 1-based line number within `file`.
    pub line: usize,
    pub spec: SweepSpec,
    pub prepend: Option<String>,
}

impl LineTarget {
    pub fn key(&self) -> String {
        target_key(&self.file, self.line)
    }
}

pub fn target_key(file: &str, line: usize) -> String {
    format!("{file}:{line}")
}

/// A merged document with one combination of line values applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedDocument {
    pub combination: Combination,
    pub lines: Vec<String>,
}

impl PatchedDocument {
    pub fn render(&self) -> String {
        render_lines(&self.lines)
    }
}

/// Resolved patch targets over one merged document.
#[derive(Debug)]
pub struct PatchPlan<'a> {
    document: &'a MergedDocument,
    sweeps: SweepSet,
    slots: BTreeMap<String, Vec<usize>>,
}

impl<'a> PatchPlan<'a> {
    /// Expand every target's sweep and resolve its line in `document`.
    pub fn new(document: &'a MergedDocument, targets: &[LineTarget]) -> Result<Self, SweepError> {
        let mut sweeps = SweepSet::new();
        let mut slots = BTreeMap::new();
        let mut owners: BTreeMap<usize, String> = BTreeMap::new();

        for target in targets {
            let key = target.key();
            let values = expand(&target.spec, target.prepend.as_deref())?;
            sweeps.insert(key.clone(), values)?;

            let indices = locate_line(document, &target.file, target.line)?;
            for index in &indices {
                if let Some(other) = owners.insert(*index, key.clone()) {
                    return Err(SweepError::malformed(format!(
                        "{key} and {other} rewrite the same line"
                    )));
                }
            }
            slots.insert(key, indices);
        }

        Ok(Self {
            document,
            sweeps,
            slots,
        })
    }

    pub fn sweeps(&self) -> &SweepSet {
        &self.sweeps
    }

    pub fn combinations(&self) -> Result<Vec<Combination>, SweepError> {
        combine(&self.sweeps)
    }

    /// Copy the merged document and write this combination's values into it.
    pub fn apply(&self, combination: &Combination) -> PatchedDocument {
        let mut lines = self.document.lines().to_vec();
        for choice in combination.choices() {
            if let Some(indices) = self.slots.get(&choice.key) {
                for index in indices {
                    lines[*index] = choice.value.clone();
                }
            }
        }
        PatchedDocument {
            combination: combination.clone(),
            lines,
        }
    }
}

/// Find the merged-document index of physical line `line` of `file`, once
/// per inclusion of `file`.
///
/// A nested include block counts as the single `Include` line it replaced,
/// so numbering matches the file on disk.
pub fn locate_line(
    document: &MergedDocument,
    file: &str,
    line: usize,
) -> Result<Vec<usize>, SweepError> {
    if line == 0 {
        return Err(SweepError::malformed(format!(
            "line numbers start at 1 (got 0 for {file})"
        )));
    }
    let lines = document.lines();
    let mut found = Vec::new();
    for (index, text) in lines.iter().enumerate() {
        if parse_marker(text) == Some(Marker::Begin(file)) {
            found.push(walk_to_line(lines, index, file, line)?);
        }
    }
    if found.is_empty() {
        return Err(SweepError::malformed(format!(
            "{file} is not part of the merged geometry"
        )));
    }
    Ok(found)
}

fn walk_to_line(
    lines: &[String],
    begin: usize,
    file: &str,
    line: usize,
) -> Result<usize, SweepError> {
    let mut remaining = line - 1;
    let mut index = begin + 1;
    while index < lines.len() {
        match parse_marker(&lines[index]) {
            Some(Marker::End(_)) => {
                return Err(SweepError::LinePastEnd {
                    file: file.to_string(),
                    line,
                });
            }
            Some(Marker::Begin(nested)) => {
                if remaining == 0 {
                    return Err(SweepError::malformed(format!(
                        "line {line} of {file} includes {nested} and cannot be swept"
                    )));
                }
                remaining -= 1;
                index = matching_end(lines, index)? + 1;
            }
            None => {
                if remaining == 0 {
                    return Ok(index);
                }
                remaining -= 1;
                index += 1;
            }
        }
    }
    Err(unbalanced(file))
}

fn matching_end(lines: &[String], begin: usize) -> Result<usize, SweepError> {
    let mut depth = 0usize;
    for (index, text) in lines.iter().enumerate().skip(begin) {
        match parse_marker(text) {
            Some(Marker::Begin(_)) => depth += 1,
            Some(Marker::End(_)) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(index);
                }
            }
            None => {}
        }
    }
    Err(unbalanced(&lines[begin]))
}

fn unbalanced(context: &str) -> SweepError {
    SweepError::malformed(format!("unbalanced include markers near {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::merge::{begin_marker, end_marker};

    fn generate_patches(
        document: &MergedDocument,
        targets: &[LineTarget],
    ) -> Result<Vec<PatchedDocument>, SweepError> {
        let plan = PatchPlan::new(document, targets)?;
        Ok(plan
            .combinations()?
            .iter()
            .map(|combination| plan.apply(combination))
            .collect())
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn enumeration(values: &[&str]) -> SweepSpec {
        SweepSpec::Enumeration(strings(values))
    }

    #[test]
    fn sweeping_one_line_touches_only_that_line() {
        let document = MergedDocument::from_flat("F", strings(&["Line1", "Line2", "Line3"]));
        let target = LineTarget {
            file: "F".to_string(),
            line: 2,
            spec: enumeration(&["X", "Y"]),
            prepend: None,
        };

        let patched = generate_patches(&document, &[target]).expect("patch");
        assert_eq!(patched.len(), 2);
        let bodies: Vec<&[String]> = patched.iter().map(|doc| &doc.lines[1..4]).collect();
        assert_eq!(bodies[0], ["Line1", "X", "Line3"]);
        assert_eq!(bodies[1], ["Line1", "Y", "Line3"]);
        assert_eq!(patched[1].combination.get("F:2"), Some("Y"));
    }

    fn nested_document() -> MergedDocument {
        // F: "A", Include G, "B"   G: "G1", "G2"
        let mut body = vec!["A".to_string(), begin_marker("G")];
        body.extend(strings(&["G1", "G2"]));
        body.push(end_marker("G"));
        body.push("B".to_string());
        MergedDocument::from_flat("F", body)
    }

    #[test]
    fn nested_blocks_count_as_their_include_line() {
        let document = nested_document();
        let after_include = locate_line(&document, "F", 3).expect("locate");
        assert_eq!(document.lines()[after_include[0]], "B");

        let inside = locate_line(&document, "G", 2).expect("locate");
        assert_eq!(document.lines()[inside[0]], "G2");
    }

    #[test]
    fn walking_off_the_file_is_line_past_end() {
        let document = nested_document();
        let err = locate_line(&document, "G", 3).expect_err("past end");
        assert!(matches!(err, SweepError::LinePastEnd { line: 3, .. }));
        let err = locate_line(&document, "F", 4).expect_err("past end");
        assert!(matches!(err, SweepError::LinePastEnd { .. }));
    }

    #[test]
    fn include_lines_and_unknown_files_are_rejected() {
        let document = nested_document();
        assert!(matches!(
            locate_line(&document, "F", 2),
            Err(SweepError::MalformedSpec(_))
        ));
        assert!(matches!(
            locate_line(&document, "H", 1),
            Err(SweepError::MalformedSpec(_))
        ));
        assert!(matches!(
            locate_line(&document, "F", 0),
            Err(SweepError::MalformedSpec(_))
        ));
    }

    #[test]
    fn repeated_includes_are_patched_everywhere() {
        let mut body = Vec::new();
        for _ in 0..2 {
            body.push(begin_marker("G"));
            body.push("G1".to_string());
            body.push(end_marker("G"));
        }
        let document = MergedDocument::from_flat("F", body);
        let target = LineTarget {
            file: "G".to_string(),
            line: 1,
            spec: enumeration(&["Z"]),
            prepend: None,
        };
        let patched = generate_patches(&document, &[target]).expect("patch");
        assert_eq!(patched.len(), 1);
        assert_eq!(patched[0].lines.iter().filter(|line| *line == "Z").count(), 2);
    }

    #[test]
    fn two_targets_on_one_line_are_rejected() {
        let document = MergedDocument::from_flat("F", strings(&["Line1"]));
        let target = LineTarget {
            file: "F".to_string(),
            line: 1,
            spec: enumeration(&["X"]),
            prepend: None,
        };
        let err = PatchPlan::new(&document, &[target.clone(), target]).expect_err("duplicate");
        assert!(matches!(err, SweepError::MalformedSpec(_)));
    }

    #[test]
    fn combinations_cover_every_target() {
        let document = MergedDocument::from_flat("F", strings(&["a", "b", "c"]));
        let targets = [
            LineTarget {
                file: "F".to_string(),
                line: 1,
                spec: SweepSpec::IntRange {
                    start: 0,
                    stop: 2,
                    step: 1,
                },
                prepend: Some("Width".to_string()),
            },
            LineTarget {
                file: "F".to_string(),
                line: 3,
                spec: enumeration(&["p", "q", "r"]),
                prepend: None,
            },
        ];
        let patched = generate_patches(&document, &targets).expect("patch");
        assert_eq!(patched.len(), 6);
        assert_eq!(patched[5].lines[1..4], ["Width 1", "b", "r"]);
        assert_eq!(patched[5].combination.coordinate_label(), "1_2");
    }
}

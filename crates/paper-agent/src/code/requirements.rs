//! Declarative output file requirements.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use super::issues::{CodeProblem, RunIssue, RunIssues};

/// A check on the text content of an output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", content = "value", rename_all = "snake_case")]
pub enum ContentCheck {
    /// Every phrase must appear
    RequiredPhrases(Vec<String>),
    /// No phrase may appear
    ForbiddenPhrases(Vec<String>),
    /// The file must hold something besides whitespace
    NotEmpty,
    /// The file must not exceed this many characters
    MaxChars(usize),
    /// Every header line must appear, in order
    RequiredHeaders(Vec<String>),
}

impl ContentCheck {
    /// Issues this check finds in `content` of `file`.
    pub fn check(&self, file: &str, content: &str) -> Vec<RunIssue> {
        let annotation =
            |issue: String| RunIssue::new("Output file content", issue, CodeProblem::OutputFileAnnotation);
        match self {
            Self::RequiredPhrases(phrases) => phrases
                .iter()
                .filter(|phrase| !content.contains(phrase.as_str()))
                .map(|phrase| annotation(format!("The output file \"{file}\" should contain \"{phrase}\".")))
                .collect(),
            Self::ForbiddenPhrases(phrases) => phrases
                .iter()
                .filter(|phrase| content.contains(phrase.as_str()))
                .map(|phrase| {
                    annotation(format!("The output file \"{file}\" must not contain \"{phrase}\"."))
                })
                .collect(),
            Self::NotEmpty if content.trim().is_empty() => {
                vec![annotation(format!("The output file \"{file}\" is empty."))]
            }
            Self::MaxChars(max) if content.chars().count() > *max => vec![
                annotation(format!(
                    "The output file \"{file}\" is too long ({} characters, at most {max} allowed).",
                    content.chars().count()
                ))
                .with_instructions("Only write the results the task asks for; do not dump whole dataframes."),
            ],
            Self::RequiredHeaders(headers) => {
                let mut issues = Vec::new();
                let mut rest = content;
                for header in headers {
                    match rest.find(header.as_str()) {
                        Some(position) => rest = &rest[position + header.len()..],
                        None => issues.push(annotation(format!(
                            "The output file \"{file}\" should contain the header \"{header}\" \
                             (headers must appear in the order: {}).",
                            headers.join(", ")
                        ))),
                    }
                }
                issues
            }
            Self::NotEmpty | Self::MaxChars(_) => Vec::new(),
        }
    }
}

/// Files the code may and must create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFileRequirement {
    /// File name or glob pattern, relative to the run folder
    pub pattern: String,
    /// Minimum number of matching files
    #[serde(default = "one")]
    pub min_count: usize,
    /// Maximum number of matching files
    #[serde(default)]
    pub max_count: Option<usize>,
    /// Checks applied to the content of each matching file
    #[serde(default)]
    pub content_checks: Vec<ContentCheck>,
    /// Whether the content is read back after the run
    #[serde(default)]
    pub keep_content: bool,
    /// Whether this file is the step's main text output
    #[serde(default)]
    pub primary: bool,
}

const fn one() -> usize {
    1
}

impl OutputFileRequirement {
    /// Exactly one file with this name, read back after the run.
    pub fn text_file(name: impl Into<String>) -> Self {
        Self {
            pattern: name.into(),
            min_count: 1,
            max_count: Some(1),
            content_checks: vec![ContentCheck::NotEmpty],
            keep_content: true,
            primary: false,
        }
    }

    /// Any number (at least `min_count`) of files matching a glob, not read back.
    pub fn data_files(pattern: impl Into<String>, min_count: usize) -> Self {
        Self {
            pattern: pattern.into(),
            min_count,
            max_count: None,
            content_checks: Vec::new(),
            keep_content: false,
            primary: false,
        }
    }

    /// Marks the file as the step's main text output.
    #[must_use]
    pub const fn as_primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Adds a content check.
    #[must_use]
    pub fn with_content_check(mut self, check: ContentCheck) -> Self {
        self.content_checks.push(check);
        self
    }

    /// Caps the number of matching files.
    #[must_use]
    pub const fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    /// Whether `file` matches the pattern.
    pub fn matches(&self, file: &str) -> bool {
        Pattern::new(&self.pattern).map_or_else(|_| self.pattern == file, |pattern| pattern.matches(file))
    }
}

/// The output files of one code step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputFileRequirements {
    /// Requirements in declaration order
    requirements: Vec<OutputFileRequirement>,
}

impl OutputFileRequirements {
    /// No output files allowed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a requirement.
    #[must_use]
    pub fn with(mut self, requirement: OutputFileRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Requirements in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &OutputFileRequirement> {
        self.requirements.iter()
    }

    /// Whether no output file is declared.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// First requirement matching `file`.
    pub fn requirement_for(&self, file: &str) -> Option<&OutputFileRequirement> {
        self.requirements.iter().find(|requirement| requirement.matches(file))
    }

    /// Whether the code may write `file`.
    pub fn allows(&self, file: &str) -> bool {
        self.requirement_for(file).is_some()
    }

    /// Whether `file` is read back after the run.
    pub fn keeps_content(&self, file: &str) -> bool {
        self.requirement_for(file)
            .is_some_and(|requirement| requirement.keep_content)
    }

    /// Created files grouped by the pattern that allowed them.
    pub fn group<'files>(
        &self,
        files: impl IntoIterator<Item = &'files str>,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut grouped: BTreeMap<String, BTreeSet<String>> = self
            .requirements
            .iter()
            .map(|requirement| (requirement.pattern.clone(), BTreeSet::new()))
            .collect();
        for file in files {
            if let Some(requirement) = self.requirement_for(file) {
                grouped
                    .entry(requirement.pattern.clone())
                    .or_default()
                    .insert(file.to_owned());
            }
        }
        grouped
    }

    /// Name of the primary output file among `files`.
    pub fn primary_file<'files>(
        &self,
        files: impl IntoIterator<Item = &'files str>,
    ) -> Option<&'files str> {
        files.into_iter().find(|file| {
            self.requirement_for(file)
                .is_some_and(|requirement| requirement.primary)
        })
    }

    /// Checks created files against the requirements.
    ///
    /// `created` maps every file the run created to its content, when read back.
    pub fn check(&self, created: &BTreeMap<String, Option<String>>) -> RunIssues {
        let mut issues = RunIssues::new();

        for file in created.keys().filter(|file| !self.allows(file)) {
            issues.push(
                RunIssue::new(
                    "Output files",
                    format!("Your code created the file \"{file}\", which is not an allowed output file."),
                    CodeProblem::RuntimeError,
                )
                .with_instructions(self.describe_allowed()),
            );
        }

        for requirement in &self.requirements {
            let matching: Vec<&String> = created
                .keys()
                .filter(|file| requirement.matches(file))
                .collect();
            if matching.len() < requirement.min_count {
                issues.push(RunIssue::new(
                    "Output files",
                    if requirement.min_count == 1 && matching.is_empty() {
                        format!("Your code did not create the output file \"{}\".", requirement.pattern)
                    } else {
                        format!(
                            "Your code created {} file(s) matching \"{}\"; at least {} are required.",
                            matching.len(),
                            requirement.pattern,
                            requirement.min_count
                        )
                    },
                    CodeProblem::MissingOutputFiles,
                ));
            }
            if let Some(max) = requirement.max_count.filter(|max| matching.len() > *max) {
                issues.push(RunIssue::new(
                    "Output files",
                    format!(
                        "Your code created {} files matching \"{}\"; at most {max} are allowed.",
                        matching.len(),
                        requirement.pattern
                    ),
                    CodeProblem::OutputFileAnnotation,
                ));
            }
            for file in matching {
                if let Some(Some(content)) = created.get(file) {
                    for check in &requirement.content_checks {
                        issues.extend(check.check(file, content));
                    }
                }
            }
        }
        issues
    }

    /// Human-readable list of the allowed output files.
    pub fn describe_allowed(&self) -> String {
        if self.requirements.is_empty() {
            return "Your code should not create any files.".to_owned();
        }
        let mut description = "Your code may only create these files:\n".to_owned();
        for requirement in &self.requirements {
            let _line_write = writeln!(description, "- \"{}\"", requirement.pattern);
        }
        description.trim_end().to_owned()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::assertions_on_result_states,
    reason = "Tests unwrap and assert on results directly"
)]
mod tests {
    use super::*;

    fn requirements() -> OutputFileRequirements {
        OutputFileRequirements::new()
            .with(
                OutputFileRequirement::text_file("results.txt")
                    .as_primary()
                    .with_content_check(ContentCheck::RequiredPhrases(vec!["p-value".to_owned()])),
            )
            .with(OutputFileRequirement::data_files("*.csv", 1))
    }

    fn created(files: &[(&str, Option<&str>)]) -> BTreeMap<String, Option<String>> {
        files
            .iter()
            .map(|(file, content)| ((*file).to_owned(), content.map(str::to_owned)))
            .collect()
    }

    #[test]
    fn test_all_requirements_met() {
        let issues = requirements().check(&created(&[
            ("results.txt", Some("p-value: 0.01")),
            ("clean.csv", None),
        ]));
        assert!(issues.is_empty());
    }

    #[test]
    fn test_missing_and_undeclared_files() {
        let issues = requirements().check(&created(&[("notes.md", Some("x"))]));
        let problems: Vec<CodeProblem> = issues.iter().map(|issue| issue.code_problem).collect();
        assert_eq!(
            problems,
            vec![
                CodeProblem::RuntimeError,
                CodeProblem::MissingOutputFiles,
                CodeProblem::MissingOutputFiles
            ]
        );
        assert_eq!(issues.problem(), CodeProblem::RuntimeError);
    }

    #[test]
    fn test_content_checks() {
        let issues = requirements().check(&created(&[
            ("results.txt", Some("mean: 3")),
            ("clean.csv", None),
        ]));
        assert_eq!(issues.problem(), CodeProblem::OutputFileAnnotation);
        assert!(issues.feedback_message().contains("\"p-value\""));
    }

    #[test]
    fn test_required_headers_in_order() {
        let check = ContentCheck::RequiredHeaders(vec!["# Summary".to_owned(), "# Table".to_owned()]);
        assert!(check.check("out.txt", "# Summary\nx\n# Table\ny").is_empty());
        assert_eq!(check.check("out.txt", "# Table\ny\n# Summary").len(), 1);
    }

    #[test]
    fn test_grouping_and_primary() {
        let requirements = requirements();
        let grouped = requirements.group(["results.txt", "a.csv", "b.csv"]);
        assert_eq!(grouped["*.csv"].len(), 2);
        assert_eq!(
            requirements.primary_file(["a.csv", "results.txt"]),
            Some("results.txt")
        );
        assert!(requirements.keeps_content("results.txt"));
        assert!(!requirements.keeps_content("a.csv"));
    }
}

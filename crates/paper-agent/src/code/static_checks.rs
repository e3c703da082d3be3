//! Checks run on extracted code before it is executed.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::issues::{CodeProblem, RunIssue, RunIssues};

/// Matches `import a, b.c as d`.
static IMPORT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| match Regex::new(r"(?m)^[ \t]*import[ \t]+([^\n#]+)") {
        Ok(regex) => regex,
        Err(err) => panic!("Import regex is invalid: {err}"),
    });

/// Matches `from a.b import c, d`.
static FROM_IMPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"(?m)^[ \t]*from[ \t]+([\w.]+)[ \t]+import[ \t]+\(?([^\n#)]+)") {
        Ok(regex) => regex,
        Err(err) => panic!("From-import regex is invalid: {err}"),
    }
});

/// Symbols commonly imported from the wrong package, with their real home.
const MISIMPORT_HINTS: &[(&str, &str)] = &[
    ("multipletests", "statsmodels.stats.multitest"),
    ("ttest_ind", "scipy.stats"),
    ("ttest_rel", "scipy.stats"),
    ("f_oneway", "scipy.stats"),
    ("chi2_contingency", "scipy.stats"),
    ("pearsonr", "scipy.stats"),
    ("spearmanr", "scipy.stats"),
    ("ols", "statsmodels.formula.api"),
    ("logit", "statsmodels.formula.api"),
    ("train_test_split", "sklearn.model_selection"),
    ("LogisticRegression", "sklearn.linear_model"),
    ("StandardScaler", "sklearn.preprocessing"),
];

/// What the code is allowed to contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeRules {
    /// Builtins the sandbox refuses to run
    pub forbidden_functions: Vec<String>,
    /// Top-level packages the code may import
    pub allowed_packages: Vec<String>,
    /// Modules the code must never import
    pub forbidden_modules: Vec<String>,
    /// Comment headers that must appear, in order
    pub required_headers: Vec<String>,
    /// Text that must appear in the code
    pub required_phrases: Vec<String>,
    /// Text that must not appear in the code
    pub forbidden_phrases: Vec<String>,
}

impl Default for CodeRules {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|item| (*item).to_owned()).collect();
        Self {
            forbidden_functions: owned(&["print", "input", "exit", "quit", "eval", "exec"]),
            allowed_packages: owned(&[
                "pandas",
                "numpy",
                "scipy",
                "statsmodels",
                "sklearn",
                "pickle",
                "math",
                "statistics",
                "collections",
                "itertools",
                "functools",
                "warnings",
                "typing",
                "datetime",
                "re",
                "json",
            ]),
            forbidden_modules: owned(&["os", "sys", "subprocess", "shutil"]),
            required_headers: Vec::new(),
            required_phrases: Vec::new(),
            forbidden_phrases: Vec::new(),
        }
    }
}

impl CodeRules {
    /// Adds a required comment header.
    #[must_use]
    pub fn with_required_header(mut self, header: impl Into<String>) -> Self {
        self.required_headers.push(header.into());
        self
    }

    /// Adds forbidden text.
    #[must_use]
    pub fn with_forbidden_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.forbidden_phrases.push(phrase.into());
        self
    }

    /// Adds required text.
    #[must_use]
    pub fn with_required_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.required_phrases.push(phrase.into());
        self
    }
}

/// An import statement found in the code.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Import {
    /// Full module path
    module: String,
    /// Names imported from the module, for `from` imports
    names: Vec<String>,
}

impl Import {
    fn top_level(&self) -> &str {
        self.module.split('.').next().unwrap_or_default()
    }
}

fn find_imports(code: &str) -> Vec<Import> {
    let mut imports = Vec::new();
    for captures in IMPORT_REGEX.captures_iter(code) {
        for item in captures[1].split(',') {
            let module = item.split_whitespace().next().unwrap_or_default();
            if !module.is_empty() {
                imports.push(Import {
                    module: module.to_owned(),
                    names: Vec::new(),
                });
            }
        }
    }
    for captures in FROM_IMPORT_REGEX.captures_iter(code) {
        let names = captures[2]
            .split(',')
            .filter_map(|item| item.split_whitespace().next())
            .map(str::to_owned)
            .collect();
        imports.push(Import {
            module: captures[1].to_owned(),
            names,
        });
    }
    imports
}

fn check_imports(code: &str, rules: &CodeRules, issues: &mut RunIssues) {
    let mut reported = BTreeSet::new();
    for import in find_imports(code) {
        let top_level = import.top_level().to_owned();
        if rules.forbidden_modules.contains(&top_level) {
            if reported.insert(top_level.clone()) {
                issues.push(
                    RunIssue::new(
                        "Imports",
                        format!("Your code imports the module `{top_level}`, which is not allowed."),
                        CodeProblem::StaticCheck,
                    )
                    .with_instructions(
                        "Do not use this module. Read and write files only with pandas or `open`.",
                    ),
                );
            }
            continue;
        }
        if !rules.allowed_packages.contains(&top_level) {
            if reported.insert(top_level.clone()) {
                issues.push(
                    RunIssue::new(
                        "Imports",
                        format!("Your code imports `{top_level}`, which is not an available package."),
                        CodeProblem::StaticCheck,
                    )
                    .with_instructions(format!(
                        "You may only use these packages: {}.",
                        rules.allowed_packages.join(", ")
                    )),
                );
            }
            continue;
        }
        for name in &import.names {
            let hint = MISIMPORT_HINTS
                .iter()
                .find(|(symbol, home)| symbol == name && *home != import.module);
            if let Some((symbol, home)) = hint {
                issues.push(
                    RunIssue::new(
                        "Imports",
                        format!("`{symbol}` cannot be imported from `{}`.", import.module),
                        CodeProblem::StaticCheck,
                    )
                    .with_instructions(format!("Use `from {home} import {symbol}` instead.")),
                );
            }
        }
    }
}

fn check_headers(code: &str, headers: &[String], issues: &mut RunIssues) {
    let lines: Vec<&str> = code.lines().map(str::trim).collect();
    let mut missing = Vec::new();
    let mut misplaced = Vec::new();
    let mut last_position = None;
    for header in headers {
        let Some(position) = lines.iter().position(|line| *line == header.trim()) else {
            missing.push(header.as_str());
            continue;
        };
        if last_position.is_some_and(|last| position < last) {
            misplaced.push(header.as_str());
        } else {
            last_position = Some(position);
        }
    }

    let instructions = format!(
        "The code must contain these headers as separate comment lines, in this order:\n{}",
        headers.join("\n")
    );
    if !missing.is_empty() {
        issues.push(
            RunIssue::new(
                "Code structure",
                format!("Your code is missing these section headers: {}.", missing.join(", ")),
                CodeProblem::StaticCheck,
            )
            .with_instructions(instructions.clone()),
        );
    }
    if !misplaced.is_empty() {
        issues.push(
            RunIssue::new(
                "Code structure",
                format!(
                    "These section headers are out of order: {}.",
                    misplaced.join(", ")
                ),
                CodeProblem::StaticCheck,
            )
            .with_instructions(instructions),
        );
    }
}

/// Runs all pre-execution checks on `code`.
pub fn run_static_checks(code: &str, rules: &CodeRules) -> RunIssues {
    let mut issues = RunIssues::new();
    check_imports(code, rules, &mut issues);
    check_headers(code, &rules.required_headers, &mut issues);
    for phrase in &rules.required_phrases {
        if !code.contains(phrase.as_str()) {
            issues.push(RunIssue::new(
                "Code content",
                format!("Your code must contain `{phrase}`."),
                CodeProblem::StaticCheck,
            ));
        }
    }
    for phrase in &rules.forbidden_phrases {
        if code.contains(phrase.as_str()) {
            issues.push(RunIssue::new(
                "Code content",
                format!("Your code must not contain `{phrase}`."),
                CodeProblem::StaticCheck,
            ));
        }
    }
    issues
}

/// Flags a revision that dropped too much of the previous code.
///
/// Only non-blank lines are counted.
pub fn check_small_change(code: &str, previous: &str, min_ratio: f64) -> Option<RunIssue> {
    let count = |text: &str| text.lines().filter(|line| !line.trim().is_empty()).count();
    let (lines, previous_lines) = (count(code), count(previous));
    if (lines as f64) >= min_ratio * previous_lines as f64 {
        return None;
    }
    Some(
        RunIssue::new(
            "Code modification",
            format!(
                "Your code has {lines} lines, while the code you were asked to modify has \
                 {previous_lines}. It looks like you rewrote or dropped parts of it."
            ),
            CodeProblem::StaticCheck,
        )
        .with_instructions(
            "Please send the complete code again, changing only what was requested.",
        )
        .with_comment("small change requested"),
    )
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

    #[test]
    fn test_clean_code_passes() {
        let code = "import pandas as pd\nimport numpy as np\nfrom scipy import stats\n\ndf = pd.read_csv('data.csv')\n";
        assert!(run_static_checks(code, &CodeRules::default()).is_empty());
    }

    #[test]
    fn test_forbidden_and_unavailable_imports() {
        let code = "import os, sys\nimport torch\nfrom os.path import join\n";
        let issues = run_static_checks(code, &CodeRules::default());
        let messages: Vec<&str> = issues.iter().map(|issue| issue.issue.as_str()).collect();
        assert_eq!(messages.len(), 3);
        assert!(messages[0].contains("`os`"));
        assert!(messages[1].contains("`sys`"));
        assert!(messages[2].contains("`torch`"));
        assert_eq!(issues.problem(), CodeProblem::StaticCheck);
    }

    #[test]
    fn test_misimport_hint() {
        let code = "from scipy.stats import multipletests, ttest_ind\n";
        let issues = run_static_checks(code, &CodeRules::default());
        assert_eq!(issues.len(), 1);
        let issue = issues.iter().next().unwrap();
        assert_eq!(
            issue.instructions.as_deref(),
            Some("Use `from statsmodels.stats.multitest import multipletests` instead.")
        );
    }

    #[test]
    fn test_required_headers_and_phrases() {
        let rules = CodeRules::default()
            .with_required_header("# LOAD DATA")
            .with_required_header("# ANALYSIS")
            .with_forbidden_phrase("to_latex");
        let code = "# ANALYSIS\nx = 1\n# LOAD DATA\ndf.to_latex()\n";
        let issues = run_static_checks(code, &rules);
        assert_eq!(issues.len(), 2);
        let messages: Vec<&str> = issues.iter().map(|issue| issue.issue.as_str()).collect();
        assert_eq!(messages[0], "These section headers are out of order: # ANALYSIS.");
        assert!(issues.feedback_message().contains("# ANALYSIS"));
    }

    #[test]
    fn test_missing_and_misplaced_headers_reported_separately() {
        let rules = CodeRules::default()
            .with_required_header("# LOAD DATA")
            .with_required_header("# PREPROCESSING")
            .with_required_header("# ANALYSIS");
        let code = "# ANALYSIS\nx = 1\n# LOAD DATA\n";
        let issues = run_static_checks(code, &rules);
        let messages: Vec<&str> = issues.iter().map(|issue| issue.issue.as_str()).collect();
        assert_eq!(
            messages,
            [
                "Your code is missing these section headers: # PREPROCESSING.",
                "These section headers are out of order: # ANALYSIS.",
            ]
        );

        let ordered = "# LOAD DATA\n# PREPROCESSING\n# ANALYSIS\n";
        assert!(run_static_checks(ordered, &rules).is_empty());
    }

    #[test]
    fn test_small_change() {
        let previous = "a = 1\nb = 2\nc = 3\nd = 4\ne = 5\n";
        assert!(check_small_change("a = 1\nb = 2\nc = 3\nd = 4\ne = 6\n", previous, 0.9).is_none());
        assert!(check_small_change("a = 1\n", previous, 0.9).is_some());
    }
}

//! Project description loaded from `project.toml`.

use anyhow::{Context as _, Result};
use paper_agent::{CodeRules, OutputFileRequirement, OutputFileRequirements};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// File describing the research project inside the project directory.
pub const PROJECT_FILE: &str = "project.toml";

/// File holding the pipeline configuration inside the project directory.
pub const CONFIG_FILE: &str = "config.toml";

/// What the code step should achieve and with which data.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectDescription {
    /// The research goal
    pub research_goal: String,
    /// Data files, relative to the project directory
    pub data_files: Vec<String>,
    /// Description of the data files, shown to the model
    #[serde(default)]
    pub data_file_descriptions: Option<String>,
    /// Questions asked about the output of accepted code
    #[serde(default)]
    pub review_questions: Vec<String>,
    /// Files the code must create
    #[serde(default = "default_outputs")]
    pub outputs: Vec<OutputFileRequirement>,
    /// Code rules; the defaults forbid printing and system modules
    #[serde(default)]
    pub rules: CodeRules,
}

fn default_outputs() -> Vec<OutputFileRequirement> {
    vec![OutputFileRequirement::text_file("results.txt").as_primary()]
}

impl ProjectDescription {
    /// Loads `project.toml` from the project directory.
    ///
    /// # Errors
    /// Returns an error if the file is missing or malformed, or names no data file.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(PROJECT_FILE);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid {}", path.display()))
    }

    /// Parses a project description.
    ///
    /// # Errors
    /// Returns an error if the TOML is malformed or names no data file.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let description: Self = toml::from_str(contents)?;
        if description.data_files.is_empty() {
            anyhow::bail!("At least one data file is required");
        }
        Ok(description)
    }

    /// Output requirements of the code step.
    pub fn output_requirements(&self) -> OutputFileRequirements {
        self.outputs
            .iter()
            .cloned()
            .fold(OutputFileRequirements::new(), OutputFileRequirements::with)
    }

    /// Goal text handed to the code request.
    pub fn goal_text(&self) -> String {
        match &self.data_file_descriptions {
            Some(descriptions) => format!(
                "Research goal:\n{}\n\nDescription of the data:\n{}",
                self.research_goal.trim(),
                descriptions.trim()
            ),
            None => format!("Research goal:\n{}", self.research_goal.trim()),
        }
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
    use paper_agent::ContentCheck;

    #[test]
    fn test_minimal_project_uses_default_outputs() {
        let project = ProjectDescription::from_toml_str(
            r#"
research_goal = "Does BMI differ between smokers and non-smokers?"
data_files = ["health.csv"]
"#,
        )
        .unwrap();
        let requirements = project.output_requirements();
        assert!(requirements.keeps_content("results.txt"));
        assert_eq!(
            requirements.primary_file(["results.txt"]),
            Some("results.txt")
        );
        assert_eq!(project.rules, CodeRules::default());
        assert!(project.goal_text().starts_with("Research goal:\nDoes BMI"));
    }

    #[test]
    fn test_full_project() {
        let project = ProjectDescription::from_toml_str(
            r##"
research_goal = "Does BMI differ between smokers and non-smokers?"
data_files = ["health.csv"]
data_file_descriptions = "One row per participant."
review_questions = ["Is a p-value reported for every test?"]

[[outputs]]
pattern = "results.txt"
max_count = 1
keep_content = true
primary = true
content_checks = [{ check = "required_phrases", value = ["p-value"] }]

[[outputs]]
pattern = "*.csv"
min_count = 0

[rules]
required_headers = ["# LOAD DATA", "# ANALYSIS"]
"##,
        )
        .unwrap();
        assert_eq!(project.outputs.len(), 2);
        assert_eq!(project.outputs[0].min_count, 1);
        assert_eq!(
            project.outputs[0].content_checks,
            vec![ContentCheck::RequiredPhrases(vec!["p-value".to_owned()])]
        );
        assert_eq!(project.outputs[1].min_count, 0);
        assert_eq!(project.rules.required_headers.len(), 2);
        assert!(project.rules.forbidden_functions.contains(&"print".to_owned()));
        assert!(project.goal_text().contains("One row per participant."));
    }

    #[test]
    fn test_project_without_data_is_rejected() {
        let result = ProjectDescription::from_toml_str(
            "research_goal = \"x\"\ndata_files = []\n",
        );
        assert!(result.is_err());
    }
}

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// A dataframe read or write performed by the code, reported by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DataframeOperation {
    /// A CSV file was loaded into a dataframe
    Read {
        /// File that was read
        file: String,
        /// Columns of the loaded dataframe
        columns: Vec<String>,
    },
    /// A dataframe was saved to a CSV file
    Save {
        /// File that was written
        file: String,
        /// Columns of the saved dataframe
        columns: Vec<String>,
    },
}

impl DataframeOperation {
    /// File the operation touched.
    pub fn file(&self) -> &str {
        match self {
            Self::Read { file, .. } | Self::Save { file, .. } => file,
        }
    }
}

/// Accepted code together with everything its run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeAndOutput {
    /// The accepted code
    pub code: String,
    /// Content of the primary text output, if the step declares one
    pub output: Option<String>,
    /// Created files grouped by the requirement pattern that allowed them
    pub created_files: BTreeMap<String, BTreeSet<String>>,
    /// Text content of created files that were read back
    #[serde(default)]
    pub output_file_contents: BTreeMap<String, String>,
    /// Dataframe reads and writes performed by the code
    #[serde(default)]
    pub dataframe_operations: Vec<DataframeOperation>,
    /// Explanation of the code, once requested
    #[serde(default)]
    pub explanation: Option<String>,
}

impl CodeAndOutput {
    /// Creates an artifact holding only code.
    pub fn new<T: Into<String>>(code: T) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    /// All created files, in name order.
    pub fn all_created_files(&self) -> BTreeSet<&str> {
        self.created_files
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Files created under a requirement pattern.
    pub fn created_files_for(&self, pattern: &str) -> Vec<&str> {
        self.created_files
            .get(pattern)
            .map(|files| files.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Human-readable summary of the dataframe operations, one line per operation.
    pub fn describe_dataframe_operations(&self) -> String {
        let mut description = String::new();
        for operation in &self.dataframe_operations {
            let (verb, file, columns) = match operation {
                DataframeOperation::Read { file, columns } => ("Read", file, columns),
                DataframeOperation::Save { file, columns } => ("Saved", file, columns),
            };
            let _write_result = writeln!(
                description,
                "{verb} `{file}` ({} columns: {})",
                columns.len(),
                columns.join(", ")
            );
        }
        description
    }

    /// Code and output rendered for a downstream prompt.
    pub fn to_prompt_text(&self) -> String {
        let mut text = format!("Code:\n```python\n{}\n```\n", self.code.trim_end());
        if let Some(output) = &self.output {
            let _output_write = write!(text, "\nOutput:\n```output\n{}\n```\n", output.trim_end());
        }
        for (file, content) in &self.output_file_contents {
            if self.output.as_deref() != Some(content.as_str()) {
                let _file_write = write!(text, "\n\"{file}\":\n```output\n{}\n```\n", content.trim_end());
            }
        }
        text
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

    fn sample() -> CodeAndOutput {
        let mut code_and_output = CodeAndOutput::new("import pandas as pd\n");
        code_and_output.output = Some("mean: 3.2".to_owned());
        code_and_output.created_files.insert(
            "*.txt".to_owned(),
            BTreeSet::from(["results.txt".to_owned()]),
        );
        code_and_output.created_files.insert(
            "*.csv".to_owned(),
            BTreeSet::from(["clean.csv".to_owned(), "agg.csv".to_owned()]),
        );
        code_and_output.dataframe_operations = vec![
            DataframeOperation::Read {
                file: "data.csv".to_owned(),
                columns: vec!["age".to_owned(), "bmi".to_owned()],
            },
            DataframeOperation::Save {
                file: "clean.csv".to_owned(),
                columns: vec!["age".to_owned()],
            },
        ];
        code_and_output
    }

    #[test]
    fn test_created_files() {
        let code_and_output = sample();
        assert_eq!(
            code_and_output.all_created_files().into_iter().collect::<Vec<_>>(),
            vec!["agg.csv", "clean.csv", "results.txt"]
        );
        assert_eq!(code_and_output.created_files_for("*.txt"), vec!["results.txt"]);
        assert!(code_and_output.created_files_for("*.png").is_empty());
    }

    #[test]
    fn test_describe_dataframe_operations() {
        let description = sample().describe_dataframe_operations();
        assert_eq!(
            description,
            "Read `data.csv` (2 columns: age, bmi)\nSaved `clean.csv` (1 columns: age)\n"
        );
    }

    #[test]
    fn test_prompt_text_includes_output() {
        let text = sample().to_prompt_text();
        assert!(text.contains("```python\nimport pandas as pd\n```"));
        assert!(text.contains("mean: 3.2"));
    }
}

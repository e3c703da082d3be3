//! Shared fixtures: a scripted sandbox and canned code responses.

#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::unwrap_used,
        clippy::missing_panics_doc,
        reason = "Test fixture allows"
    )
)]

use async_trait::async_trait;
use paper_agent::{
    CodeExecutor, ExecutionFailure, OutputFileRequirement, OutputFileRequirements, RunOutcome,
    RunRequest,
};
use paper_core::{ActionsAndConversations, ConversationManager, DataframeOperation, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Sandbox deciding the outcome from the code text instead of running it.
///
/// - code calling `print(` fails with a forbidden function
/// - code mentioning `bad.csv` raises `FileNotFoundError`
/// - anything else creates `results.txt`
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    /// Every code string run, in order
    runs: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeExecutor for ScriptedExecutor {
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        self.runs.lock().unwrap().push(request.code.clone());

        if request.code.contains("print(") {
            return Ok(RunOutcome {
                failure: Some(ExecutionFailure::ForbiddenFunction {
                    name: "print".to_owned(),
                }),
                ..RunOutcome::default()
            });
        }
        if request.code.contains("bad.csv") {
            return Ok(RunOutcome {
                failure: Some(ExecutionFailure::Exception {
                    type_name: "FileNotFoundError".to_owned(),
                    message: "[Errno 2] No such file or directory: 'bad.csv'".to_owned(),
                    traceback: String::new(),
                }),
                ..RunOutcome::default()
            });
        }

        let content = if request.code.contains("p_value") {
            "mean: 3.2\np-value: 0.01\n"
        } else {
            "mean: 3.2\n"
        };
        Ok(RunOutcome {
            output: String::new(),
            created_files: BTreeMap::from([("results.txt".to_owned(), Some(content.to_owned()))]),
            dataframe_operations: vec![DataframeOperation::Read {
                file: "good.csv".to_owned(),
                columns: vec!["age".to_owned(), "bmi".to_owned()],
            }],
            failure: None,
        })
    }
}

/// A code-writing conversation holding only its system prompt.
pub fn code_conversation() -> ConversationManager {
    let manager = ConversationManager::new(ActionsAndConversations::new(), "data_analysis_code").unwrap();
    manager.initialize("You write Python code.").unwrap();
    manager
}

/// Requirements of the scripted sandbox's output.
pub fn results_file() -> OutputFileRequirements {
    OutputFileRequirements::new().with(OutputFileRequirement::text_file("results.txt").as_primary())
}

/// Working analysis code, fenced.
pub const GOOD_CODE: &str = "Here is the code:\n```python\nimport pandas as pd\n\ndf = pd.read_csv('good.csv')\nwith open('results.txt', 'w') as file:\n    file.write(f'mean: {df.bmi.mean()}')\n```";

/// Code reading a file that is not a data file.
pub const BAD_FILE_CODE: &str = "```python\nimport pandas as pd\n\ndf = pd.read_csv('bad.csv')\nwith open('results.txt', 'w') as file:\n    file.write(f'mean: {df.bmi.mean()}')\n```";

/// Code using a forbidden builtin.
pub const PRINT_CODE: &str = "```python\nimport pandas as pd\n\ndf = pd.read_csv('good.csv')\nprint(df.bmi.mean())\n```";

/// Code importing a forbidden module.
pub const OS_CODE: &str = "```python\nimport os\nimport pandas as pd\n\ndf = pd.read_csv(os.path.join('.', 'good.csv'))\n```";

//! Reusable [`ResultChecker`] strategies.

use std::collections::BTreeMap;

use serde_json::Value;

use super::extract::{extract_fenced_block, extract_json_object};
use super::outcome::ValidationOutcome;
use super::result::{ResultChecker, ValidResult};

/// Instructions posted when a JSON object is missing or malformed.
const JSON_FORMAT_INSTRUCTIONS: &str = "Please return your answer as a single JSON object \
mapping each issue to a suggested fix, enclosed in a ```json block. \
Return an empty object `{}` if there are no issues.";

/// Accepts a JSON object mapping issue names to suggested fixes.
///
/// An empty object means "no issues".
#[derive(Debug, Clone, Default)]
pub struct JsonObjectChecker {
    /// Keys every non-empty answer must not contain
    forbidden_keys: Vec<String>,
}

impl JsonObjectChecker {
    /// Creates a checker accepting any string-keyed object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects objects containing `key`.
    #[must_use]
    pub fn with_forbidden_key(mut self, key: impl Into<String>) -> Self {
        self.forbidden_keys.push(key.into());
        self
    }
}

impl ResultChecker for JsonObjectChecker {
    type Value = BTreeMap<String, String>;

    fn extract(&mut self, response: &str) -> Result<String, ValidationOutcome> {
        extract_json_object(response)
            .map(|map| Value::Object(map).to_string())
            .map_err(|message| {
                ValidationOutcome::new("Failed to extract JSON", message)
                    .with_formatting_instructions(JSON_FORMAT_INSTRUCTIONS)
            })
    }

    fn check(
        &mut self,
        extracted: &str,
        valid_result: &mut ValidResult<Self::Value>,
    ) -> Result<(), ValidationOutcome> {
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(extracted) else {
            return Err(ValidationOutcome::new(
                "Failed to extract JSON",
                "The JSON in your response must be an object.",
            ));
        };
        if let Some(key) = self
            .forbidden_keys
            .iter()
            .find(|key| map.contains_key(key.as_str()))
        {
            return Err(ValidationOutcome::new(
                "Unexpected issue",
                format!("Please do not include \"{key}\" in the JSON object."),
            ));
        }
        let issues = map
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(text) => (key, text),
                other => (key, other.to_string()),
            })
            .collect();
        valid_result.set(issues);
        Ok(())
    }

    fn fresh_looking_response(&self, response: &str, extracted: Option<&str>) -> String {
        extracted.map_or_else(|| response.to_owned(), |json| format!("```json\n{json}\n```"))
    }
}

/// Accepts the content of a block fenced with a given label.
#[derive(Debug, Clone)]
pub struct FencedBlockChecker {
    /// Info string of the block, e.g. `latex`
    label: String,
}

impl FencedBlockChecker {
    /// Accepts blocks labelled `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ResultChecker for FencedBlockChecker {
    type Value = String;

    fn extract(&mut self, response: &str) -> Result<String, ValidationOutcome> {
        extract_fenced_block(response, &self.label).ok_or_else(|| {
            ValidationOutcome::new(
                "Missing block",
                format!("Your response must contain a ```{} block.", self.label),
            )
        })
    }

    fn check(
        &mut self,
        extracted: &str,
        valid_result: &mut ValidResult<Self::Value>,
    ) -> Result<(), ValidationOutcome> {
        if extracted.trim().is_empty() {
            return Err(ValidationOutcome::new(
                "Empty block",
                format!("The ```{} block in your response is empty.", self.label),
            ));
        }
        valid_result.set(extracted.trim().to_owned());
        Ok(())
    }

    fn fresh_looking_response(&self, response: &str, extracted: Option<&str>) -> String {
        extracted.map_or_else(
            || response.to_owned(),
            |content| format!("```{}\n{content}\n```", self.label),
        )
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

    #[test]
    fn test_json_checker_accepts_empty_object() {
        let mut checker = JsonObjectChecker::new();
        let mut result = ValidResult::new();
        let extracted = checker.extract("All good: {}").unwrap();
        checker.check(&extracted, &mut result).unwrap();
        assert!(result.get().is_some_and(BTreeMap::is_empty));
    }

    #[test]
    fn test_json_checker_stringifies_values() {
        let mut checker = JsonObjectChecker::new();
        let mut result = ValidResult::new();
        let extracted = checker
            .extract("```json\n{\"rows\": 3, \"p-value\": \"too small\"}\n```")
            .unwrap();
        checker.check(&extracted, &mut result).unwrap();
        let issues = result.get().unwrap();
        assert_eq!(issues["rows"], "3");
        assert_eq!(issues["p-value"], "too small");
        assert_eq!(
            checker.fresh_looking_response("ignored", Some(&extracted)),
            format!("```json\n{extracted}\n```")
        );
    }

    #[test]
    fn test_json_checker_reports_missing_object() {
        let mut checker = JsonObjectChecker::new();
        let outcome = checker.extract("There are no issues.").unwrap_err();
        assert!(outcome.feedback_message().contains("```json"));
    }

    #[test]
    fn test_fenced_block_checker() {
        let mut checker = FencedBlockChecker::new("latex");
        let mut result = ValidResult::new();
        assert!(checker.extract("plain text").is_err());

        let extracted = checker.extract("```latex\n\\section{Code}\n```").unwrap();
        checker.check(&extracted, &mut result).unwrap();
        assert_eq!(result.get().map(String::as_str), Some("\\section{Code}"));
        assert!(checker.check("  ", &mut result).is_err());
    }
}

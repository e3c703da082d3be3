//! Extraction of structured content from free-text LLM responses.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use thiserror::Error;

/// Matches a line starting with a bullet or an enumeration marker.
static BULLET_REGEX: LazyLock<Regex> =
    LazyLock::new(|| match Regex::new(r"(?m)^\s*(?:[-*•]|\d+[.)])\s+\S") {
        Ok(regex) => regex,
        Err(err) => panic!("Bullet regex is invalid: {err}"),
    });

/// A triple-backtick block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// Info string after the opening fence, e.g. `python`
    pub label: String,
    /// Lines between the fences
    pub content: String,
}

/// Result of scanning a response for fenced blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FencedBlocks {
    /// Complete blocks in order
    pub blocks: Vec<FencedBlock>,
    /// Whether the response ends inside an unclosed block
    pub unclosed: bool,
}

/// Scans a response for fenced blocks.
///
/// A fence line inside a block that carries an info string is treated as
/// content, so nested openings do not close the enclosing block.
pub fn parse_fenced_blocks(text: &str) -> FencedBlocks {
    let mut blocks = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            match current.take() {
                None => current = Some((rest.trim().to_owned(), Vec::new())),
                Some((label, lines)) if rest.trim().is_empty() => blocks.push(FencedBlock {
                    label,
                    content: lines.join("\n"),
                }),
                Some((label, mut lines)) => {
                    lines.push(line);
                    current = Some((label, lines));
                }
            }
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }

    FencedBlocks {
        blocks,
        unclosed: current.is_some(),
    }
}

/// Why a single code block could not be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodeBlockError {
    /// The response has no code block
    #[error("no code block found")]
    NoBlock,
    /// The response has more than one code block
    #[error("{0} code blocks found, expected exactly one")]
    MultipleBlocks(usize),
    /// The response ends inside an unclosed block
    #[error("the code block is incomplete")]
    Incomplete,
}

/// Extracts the single code block labelled `language` (or unlabelled).
///
/// # Errors
/// Returns a [`CodeBlockError`] if the block is missing, ambiguous or cut off.
pub fn extract_code_block(text: &str, language: &str) -> Result<String, CodeBlockError> {
    let parsed = parse_fenced_blocks(text);
    if parsed.unclosed {
        return Err(CodeBlockError::Incomplete);
    }
    let mut candidates = parsed
        .blocks
        .into_iter()
        .filter(|block| block.label.is_empty() || block.label.eq_ignore_ascii_case(language));
    match (candidates.next(), candidates.count()) {
        (None, _) => Err(CodeBlockError::NoBlock),
        (Some(block), 0) => Ok(block.content),
        (Some(_), extra) => Err(CodeBlockError::MultipleBlocks(extra + 1)),
    }
}

/// Content of the first block labelled `label`.
pub fn extract_fenced_block(text: &str, label: &str) -> Option<String> {
    parse_fenced_blocks(text)
        .blocks
        .into_iter()
        .find(|block| block.label.eq_ignore_ascii_case(label))
        .map(|block| block.content)
}

/// Extracts a JSON object, from a `json` block if there is one, else from the
/// outermost braces of the response.
///
/// # Errors
/// Returns a description of the problem if no object can be parsed.
pub fn extract_json_object(text: &str) -> Result<Map<String, Value>, String> {
    let candidate = match extract_fenced_block(text, "json") {
        Some(block) => block,
        None => {
            let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
                return Err("Your response does not contain a JSON object.".to_owned());
            };
            if end < start {
                return Err("Your response does not contain a JSON object.".to_owned());
            }
            text[start..=end].to_owned()
        }
    };
    match serde_json::from_str::<Value>(&candidate) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("The JSON in your response must be an object (a dict).".to_owned()),
        Err(err) => Err(format!("I could not parse the JSON in your response: {err}")),
    }
}

/// Whether the text contains at least one bulleted or enumerated line.
pub fn is_bulleted_list(text: &str) -> bool {
    BULLET_REGEX.is_match(text)
}

/// Heuristic for a response cut off by the completion length limit.
pub fn looks_truncated(text: &str) -> bool {
    if parse_fenced_blocks(text).unclosed {
        return true;
    }
    let unbalanced = |open: char, close: char| text.matches(open).count() > text.matches(close).count();
    unbalanced('(', ')') || unbalanced('[', ']') || unbalanced('{', '}')
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
    fn test_single_python_block() {
        let text = "Here is the code:\n```python\nimport pandas as pd\nx = 1\n```\nDone.";
        assert_eq!(
            extract_code_block(text, "python"),
            Ok("import pandas as pd\nx = 1".to_owned())
        );
    }

    #[test]
    fn test_other_labels_are_ignored() {
        let text = "```output\n3.2\n```\n```python\nprint(1)\n```";
        assert_eq!(extract_code_block(text, "python"), Ok("print(1)".to_owned()));
    }

    #[test]
    fn test_missing_multiple_and_incomplete_blocks() {
        assert_eq!(
            extract_code_block("no code here", "python"),
            Err(CodeBlockError::NoBlock)
        );
        assert_eq!(
            extract_code_block("```python\na\n```\n```python\nb\n```", "python"),
            Err(CodeBlockError::MultipleBlocks(2))
        );
        assert_eq!(
            extract_code_block("```python\nimport pandas as pd\ndf = pd.read_csv(", "python"),
            Err(CodeBlockError::Incomplete)
        );
    }

    #[test]
    fn test_nested_labelled_fence_is_content() {
        let parsed = parse_fenced_blocks("```markdown\n```python\nx\n```");
        assert!(!parsed.unclosed);
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].label, "markdown");
        assert_eq!(parsed.blocks[0].content, "```python\nx");
    }

    #[test]
    fn test_extract_json_object() {
        let map = extract_json_object("Sure:\n```json\n{\"p-value\": \"report it\"}\n```").unwrap();
        assert_eq!(map["p-value"], "report it");

        assert!(extract_json_object("The output looks fine: {}").unwrap().is_empty());
        assert!(extract_json_object("[1, 2]").is_err());
        assert!(extract_json_object("{not json}").is_err());
        assert!(extract_json_object("nothing").is_err());
    }

    #[test]
    fn test_is_bulleted_list() {
        assert!(is_bulleted_list("Some issues:\n- fix the axis\n- add units"));
        assert!(is_bulleted_list("1. first\n2. second"));
        assert!(!is_bulleted_list("I hereby approve the analysis."));
        assert!(!is_bulleted_list("p-value - 0.05 is fine"));
    }

    #[test]
    fn test_looks_truncated() {
        assert!(looks_truncated("```python\nx = f(1,"));
        assert!(looks_truncated("values = [1, 2"));
        assert!(!looks_truncated("```python\nx = f(1)\n```"));
    }
}

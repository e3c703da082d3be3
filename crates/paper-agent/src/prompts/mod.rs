//! Prompt loading utilities
//!
//! Prompts live in the repository's `prompts/` directory as markdown documents
//! with Usage and Prompt sections, and are embedded at compile time using
//! `include_str!`. Placeholders are written `{name}`.

use paper_core::{Error, Result};

const CODE_WRITER_SYSTEM_MD: &str = include_str!("../../../../prompts/code_writer_system.md");
const CODE_REQUEST_MD: &str = include_str!("../../../../prompts/code_request.md");
const CODE_REVISION_MD: &str = include_str!("../../../../prompts/code_revision.md");
const OUTPUT_REVIEW_MD: &str = include_str!("../../../../prompts/output_review.md");
const CODE_EXPLANATION_MD: &str = include_str!("../../../../prompts/code_explanation.md");

/// Loads a prompt by name
///
/// # Errors
/// Returns an error if the prompt name is unknown or the prompt section cannot be extracted
pub fn load_prompt(name: &str) -> Result<String> {
    let content = match name {
        "code_writer_system" => CODE_WRITER_SYSTEM_MD,
        "code_request" => CODE_REQUEST_MD,
        "code_revision" => CODE_REVISION_MD,
        "output_review" => OUTPUT_REVIEW_MD,
        "code_explanation" => CODE_EXPLANATION_MD,
        _ => return Err(Error::Other(format!("Unknown prompt: {name}"))),
    };

    extract_prompt_section(content)
}

/// Loads a prompt and fills in its placeholders.
///
/// Placeholders without a value are left as written, so literal braces in a
/// prompt (such as an empty JSON object) survive.
///
/// # Errors
/// Returns an error if the prompt cannot be loaded
pub fn render_prompt(name: &str, values: &[(&str, &str)]) -> Result<String> {
    let mut prompt = load_prompt(name)?;
    for (key, value) in values {
        prompt = prompt.replace(&format!("{{{key}}}"), value);
    }
    Ok(prompt)
}

/// Extracts the Prompt section from a markdown file
///
/// # Errors
/// Returns an error if the Prompt section cannot be found
fn extract_prompt_section(content: &str) -> Result<String> {
    let prompt_start = content
        .find("## Prompt")
        .ok_or_else(|| Error::Other("Prompt section not found".to_owned()))?;

    let prompt_content_start = content[prompt_start..]
        .find('\n')
        .ok_or_else(|| Error::Other("Invalid prompt format".to_owned()))?
        + prompt_start
        + 1;

    // ## Prompt is always the last section
    Ok(content[prompt_content_start..].trim().to_owned())
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
    fn test_extract_prompt_section() {
        let markdown = "# Test Prompt\n\n## Usage\n\nThis is usage info.\n\n## Prompt\n\nThe actual prompt.\n\nOn two lines.\n";
        assert_eq!(
            extract_prompt_section(markdown).unwrap(),
            "The actual prompt.\n\nOn two lines."
        );
        assert!(extract_prompt_section("# No prompt here").is_err());
    }

    #[test]
    fn test_all_prompts_load_without_usage() {
        for name in [
            "code_writer_system",
            "code_request",
            "code_revision",
            "output_review",
            "code_explanation",
        ] {
            let prompt = load_prompt(name).unwrap();
            assert!(!prompt.is_empty(), "{name} is empty");
            assert!(!prompt.contains("## Usage"), "{name} includes its usage");
        }
        assert!(load_prompt("nonexistent").is_err());
    }

    #[test]
    fn test_render_keeps_unknown_braces() {
        let prompt = render_prompt("output_review", &[("question", "Are the p-values sane?")]).unwrap();
        assert!(prompt.contains("Are the p-values sane?"));
        assert!(prompt.contains("{output}"));
        assert!(prompt.contains("`{}`"));
    }
}

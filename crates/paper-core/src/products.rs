//! Typed registry of the products a research run accumulates.
//!
//! Product fields have a textual form such as `codes:data_analysis` used in
//! configuration and logs; it is parsed once into [`ProductField`] and
//! dispatched by `match` from then on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::code_output::CodeAndOutput;
use crate::{Error, Result};

/// Pipeline stage a product becomes available at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Data files have been described
    Data,
    /// Data exploration code has run
    Exploration,
    /// The research goal is set
    Goal,
    /// Preprocessing code has run
    Preprocessing,
    /// Analysis code has run
    Analysis,
}

/// A step of the pipeline that produces code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeStep {
    /// Exploratory summary of the data
    DataExploration,
    /// Cleaning and transforming the data
    DataPreprocessing,
    /// The analysis answering the research goal
    DataAnalysis,
}

impl CodeStep {
    /// All code steps in pipeline order.
    pub const ALL: [Self; 3] = [
        Self::DataExploration,
        Self::DataPreprocessing,
        Self::DataAnalysis,
    ];

    /// Identifier used in product names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DataExploration => "data_exploration",
            Self::DataPreprocessing => "data_preprocessing",
            Self::DataAnalysis => "data_analysis",
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::DataExploration => "Data Exploration",
            Self::DataPreprocessing => "Data Preprocessing",
            Self::DataAnalysis => "Data Analysis",
        }
    }

    /// Stage at which the step's code exists.
    #[must_use]
    pub const fn stage(self) -> Stage {
        match self {
            Self::DataExploration => Stage::Exploration,
            Self::DataPreprocessing => Stage::Preprocessing,
            Self::DataAnalysis => Stage::Analysis,
        }
    }
}

impl fmt::Display for CodeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeStep {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == text)
            .ok_or_else(|| Error::Other(format!("Unknown code step: {text}")))
    }
}

/// A product that can be requested by a prompt or stored after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProductField {
    /// Description of the data files
    DataFileDescriptions,
    /// The research goal
    ResearchGoal,
    /// Code of a step
    Codes(CodeStep),
    /// Output of a step
    Outputs(CodeStep),
    /// Code and output of a step
    CodesAndOutputs(CodeStep),
    /// Explanation of a step's code
    CodeExplanation(CodeStep),
}

impl ProductField {
    /// Short name shown in prompts.
    pub fn name(self) -> String {
        match self {
            Self::DataFileDescriptions => "Description of the Dataset".to_owned(),
            Self::ResearchGoal => "Research Goal".to_owned(),
            Self::Codes(step) => format!("{} Code", step.title()),
            Self::Outputs(step) => format!("Output of the {} Code", step.title()),
            Self::CodesAndOutputs(step) => format!("{} Code and Output", step.title()),
            Self::CodeExplanation(step) => format!("Explanation of the {} Code", step.title()),
        }
    }

    /// One-line description.
    pub fn description(self) -> String {
        match self {
            Self::DataFileDescriptions => "The description of the data files we have".to_owned(),
            Self::ResearchGoal => "The research goal of the study".to_owned(),
            Self::Codes(step) => format!("The code we wrote for the {} step", step.title()),
            Self::Outputs(step) => format!("The output of the {} code", step.title()),
            Self::CodesAndOutputs(step) => {
                format!("The code and output of the {} step", step.title())
            }
            Self::CodeExplanation(step) => {
                format!("An explanation of what the {} code does", step.title())
            }
        }
    }

    /// Stage from which the product is available.
    pub const fn stage(self) -> Stage {
        match self {
            Self::DataFileDescriptions => Stage::Data,
            Self::ResearchGoal => Stage::Goal,
            Self::Codes(step)
            | Self::Outputs(step)
            | Self::CodesAndOutputs(step)
            | Self::CodeExplanation(step) => step.stage(),
        }
    }
}

impl fmt::Display for ProductField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataFileDescriptions => f.write_str("data_file_descriptions"),
            Self::ResearchGoal => f.write_str("research_goal"),
            Self::Codes(step) => write!(f, "codes:{step}"),
            Self::Outputs(step) => write!(f, "outputs:{step}"),
            Self::CodesAndOutputs(step) => write!(f, "codes_and_outputs:{step}"),
            Self::CodeExplanation(step) => write!(f, "code_explanation:{step}"),
        }
    }
}

impl FromStr for ProductField {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let field = match text.split_once(':') {
            None => match text {
                "data_file_descriptions" => Self::DataFileDescriptions,
                "research_goal" => Self::ResearchGoal,
                _ => return Err(Error::Other(format!("Unknown product field: {text}"))),
            },
            Some((kind, step)) => {
                let step = step.parse::<CodeStep>()?;
                match kind {
                    "codes" => Self::Codes(step),
                    "outputs" => Self::Outputs(step),
                    "codes_and_outputs" => Self::CodesAndOutputs(step),
                    "code_explanation" => Self::CodeExplanation(step),
                    _ => return Err(Error::Other(format!("Unknown product field: {text}"))),
                }
            }
        };
        Ok(field)
    }
}

/// Products accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Products {
    /// Description of the data files
    pub data_file_descriptions: Option<String>,
    /// The research goal
    pub research_goal: Option<String>,
    /// Accepted code per step
    pub codes_and_outputs: BTreeMap<CodeStep, CodeAndOutput>,
}

impl Products {
    /// Stores the accepted code of a step, replacing any earlier version.
    pub fn insert_code(&mut self, step: CodeStep, code_and_output: CodeAndOutput) {
        self.codes_and_outputs.insert(step, code_and_output);
    }

    /// Whether the product has been produced.
    pub fn is_available(&self, field: ProductField) -> bool {
        self.text(field).is_some()
    }

    /// Text of a product, if available.
    pub fn text(&self, field: ProductField) -> Option<String> {
        match field {
            ProductField::DataFileDescriptions => self.data_file_descriptions.clone(),
            ProductField::ResearchGoal => self.research_goal.clone(),
            ProductField::Codes(step) => Some(self.codes_and_outputs.get(&step)?.code.clone()),
            ProductField::Outputs(step) => self.codes_and_outputs.get(&step)?.output.clone(),
            ProductField::CodesAndOutputs(step) => {
                Some(self.codes_and_outputs.get(&step)?.to_prompt_text())
            }
            ProductField::CodeExplanation(step) => {
                self.codes_and_outputs.get(&step)?.explanation.clone()
            }
        }
    }

    /// Product rendered as a titled prompt section.
    ///
    /// # Errors
    /// Returns [`Error::FailedCreatingProduct`] if the product is not available.
    pub fn describe(&self, field: ProductField) -> Result<String> {
        let text = self
            .text(field)
            .ok_or_else(|| Error::FailedCreatingProduct(field.to_string()))?;
        Ok(format!("# {}\n{}", field.name(), text.trim_end()))
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
    fn test_textual_form() {
        let field: ProductField = "codes:data_analysis".parse().unwrap();
        assert_eq!(field, ProductField::Codes(CodeStep::DataAnalysis));
        assert_eq!(field.to_string(), "codes:data_analysis");

        let goal: ProductField = "research_goal".parse().unwrap();
        assert_eq!(goal, ProductField::ResearchGoal);

        assert!("codes:unknown".parse::<ProductField>().is_err());
        assert!("figures:data_analysis".parse::<ProductField>().is_err());
    }

    #[test]
    fn test_stage_of_parametrized_field() {
        assert_eq!(
            ProductField::CodeExplanation(CodeStep::DataExploration).stage(),
            Stage::Exploration
        );
        assert!(ProductField::ResearchGoal.stage() < ProductField::Codes(CodeStep::DataAnalysis).stage());
    }

    #[test]
    fn test_products_text() {
        let mut products = Products::default();
        assert!(!products.is_available(ProductField::Codes(CodeStep::DataAnalysis)));

        let mut code = CodeAndOutput::new("print(1)");
        code.output = Some("1".to_owned());
        products.insert_code(CodeStep::DataAnalysis, code);

        assert_eq!(
            products.text(ProductField::Outputs(CodeStep::DataAnalysis)),
            Some("1".to_owned())
        );
        assert!(products
            .describe(ProductField::Codes(CodeStep::DataAnalysis))
            .unwrap()
            .starts_with("# Data Analysis Code\n"));
        assert!(matches!(
            products.describe(ProductField::ResearchGoal),
            Err(Error::FailedCreatingProduct(_))
        ));
    }
}

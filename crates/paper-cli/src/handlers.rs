//! Command handlers for CLI operations

use anyhow::{Context as _, Result};
use paper_agent::{CodeRevisionOrchestrator, PythonSandbox, load_prompt};
use paper_core::{
    ActionLogWriter, ActionsAndConversations, CodeAndOutput, CodeStep, ConversationManager,
    LlmClient, PipelineConfig, ProductField, Products, RecordingMode, TracingObserver,
};
use paper_providers::{
    LlmCallLog, OpenAiProvider, RecordingClient, ReplayClient, RetryingClient,
};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs as async_fs;
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use crate::project::{CONFIG_FILE, ProjectDescription};

/// Log filter used when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "paper_agent=info,paper_core=info,paper_providers=info,paper_cli=info";

/// Files written to the output directory.
pub const ACTIONS_FILE: &str = "actions.jsonl";
/// Accepted code.
pub const CODE_FILE: &str = "code.py";
/// Products of the run.
pub const PRODUCTS_FILE: &str = "products.json";

/// Arguments of the `run` command.
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// Project directory
    pub project: PathBuf,
    /// Code step to run
    pub step: CodeStep,
    /// Output directory
    pub output: PathBuf,
    /// Recording mode override
    pub recording: Option<RecordingMode>,
}

/// Initializes tracing to `debug.log` in the output directory and to stderr.
///
/// # Errors
/// Returns an error if the log file cannot be created.
pub fn init_logging(output_dir: &Path) -> Result<()> {
    let debug_log = output_dir.join("debug.log");
    let log_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&debug_log)
        .with_context(|| format!("Failed to create {}", debug_log.display()))?;

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(
            fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false)
                .with_target(true)
                .with_level(true),
        )
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .init();
    Ok(())
}

/// Loads the pipeline configuration of a project, applying a recording override.
///
/// # Errors
/// Returns an error if the configuration is malformed or invalid.
pub fn load_config(project: &Path, recording: Option<RecordingMode>) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load_or_default(&project.join(CONFIG_FILE))?;
    if let Some(mode) = recording {
        config.recording.mode = mode;
    }
    config.validate()?;
    Ok(config)
}

/// Builds the LLM client stack for the configured recording mode.
///
/// Live calls go through the OpenAI-compatible provider wrapped in retries;
/// recording wraps that stack, replay serves the call log and, unless strict,
/// falls back to the live stack.
///
/// # Errors
/// Returns an error if the live provider cannot be configured or the call
/// log cannot be read.
pub fn build_llm_client(config: &PipelineConfig, output_dir: &Path) -> Result<Arc<dyn LlmClient>> {
    let calls_path = output_dir.join(&config.recording.llm_calls_file);
    let live = || -> Result<Arc<dyn LlmClient>> {
        let provider = Arc::new(OpenAiProvider::from_config(&config.llm)?);
        Ok(Arc::new(RetryingClient::from_config(provider, &config.llm)))
    };

    match config.recording.mode {
        RecordingMode::Live => live(),
        RecordingMode::Record => {
            info!("Recording LLM calls to {}", calls_path.display());
            Ok(Arc::new(RecordingClient::new(live()?, calls_path)))
        }
        RecordingMode::Replay => {
            let log = LlmCallLog::load(&calls_path)
                .with_context(|| format!("Failed to read {}", calls_path.display()))?;
            let replay = ReplayClient::new(log, config.recording.strict);
            if config.recording.strict {
                Ok(Arc::new(replay))
            } else {
                Ok(Arc::new(replay.with_fallback(live()?)))
            }
        }
    }
}

/// Copies the data files into the run folder.
async fn stage_data(project: &ProjectDescription, project_dir: &Path, run_folder: &Path) -> Result<()> {
    async_fs::create_dir_all(run_folder).await?;
    for file in &project.data_files {
        let source = project_dir.join(file);
        async_fs::copy(&source, run_folder.join(file))
            .await
            .with_context(|| format!("Failed to copy data file {}", source.display()))?;
    }
    Ok(())
}

/// Writes the accepted code, its output and the products.
async fn write_results(
    output_dir: &Path,
    step: CodeStep,
    project: &ProjectDescription,
    accepted: &CodeAndOutput,
) -> Result<()> {
    async_fs::write(output_dir.join(CODE_FILE), &accepted.code).await?;
    if let Some(output) = &accepted.output {
        async_fs::write(output_dir.join("output.txt"), output).await?;
    }
    if let Some(explanation) = &accepted.explanation {
        async_fs::write(output_dir.join("explanation.md"), explanation).await?;
    }

    let mut products = Products {
        data_file_descriptions: project.data_file_descriptions.clone(),
        research_goal: Some(project.research_goal.clone()),
        ..Products::default()
    };
    products.insert_code(step, accepted.clone());
    async_fs::write(
        output_dir.join(PRODUCTS_FILE),
        serde_json::to_string_pretty(&products)?,
    )
    .await?;
    Ok(())
}

/// Runs one code step end to end.
///
/// # Errors
/// Returns an error if the project cannot be loaded, the step fails to
/// produce accepted code, or the results cannot be written.
pub async fn handle_run(args: RunArgs) -> Result<()> {
    async_fs::create_dir_all(&args.output).await?;
    init_logging(&args.output)?;

    let config = load_config(&args.project, args.recording)?;
    let project = ProjectDescription::load(&args.project)?;
    info!(
        "Running {} for {} with {} data file(s)",
        args.step,
        args.project.display(),
        project.data_files.len()
    );

    let registry = ActionsAndConversations::new();
    registry.add_observer(Arc::new(TracingObserver));
    registry.add_observer(Arc::new(ActionLogWriter::create(
        &args.output.join(ACTIONS_FILE),
    )?));

    let llm = build_llm_client(&config, &args.output)?;
    let manager = ConversationManager::new(registry.clone(), &format!("{}_code", args.step))?;
    manager.initialize(&load_prompt("code_writer_system")?)?;
    let checkpoint = registry.mark_stage(args.step.as_str());
    info!(
        "Stage {} starts at action {}",
        checkpoint.stage, checkpoint.action_count
    );

    let run_folder = args.output.join("run");
    stage_data(&project, &args.project, &run_folder).await?;

    let mut orchestrator = CodeRevisionOrchestrator::new(
        args.step,
        manager,
        llm,
        Arc::new(PythonSandbox::from_config(&config.debugger)),
        config,
    )
    .with_data(run_folder, project.data_files.clone())
    .with_output_requirements(project.output_requirements())
    .with_rules(project.rules.clone())
    .with_goal(project.goal_text());
    for question in &project.review_questions {
        orchestrator = orchestrator.with_review_question(question.clone());
    }

    match orchestrator.run().await {
        Ok(accepted) => {
            write_results(&args.output, args.step, &project, &accepted).await?;
            info!(
                "{} accepted; results written to {}",
                ProductField::Codes(args.step).name(),
                args.output.display()
            );
            Ok(())
        }
        Err(err) if err.is_failed_product() => {
            error!("Step {} failed: {err}", args.step);
            Err(err).context(format!(
                "No accepted code for {}; the conversation log is in {}",
                args.step,
                args.output.join(ACTIONS_FILE).display()
            ))
        }
        Err(err) => {
            error!("Unexpected error in step {}: {err}", args.step);
            Err(err.into())
        }
    }
}

/// Renders the effective configuration as TOML.
///
/// # Errors
/// Returns an error if the configuration cannot be loaded or serialized.
pub fn handle_config(project: &Path) -> Result<String> {
    let config = load_config(project, None)?;
    Ok(toml::to_string_pretty(&config)?)
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
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_recording_override() {
        let temp = TempDir::new().unwrap();
        let config = load_config(temp.path(), Some(RecordingMode::Replay)).unwrap();
        assert_eq!(config.recording.mode, RecordingMode::Replay);
    }

    #[test]
    fn test_replay_requires_call_log() {
        let temp = TempDir::new().unwrap();
        let config = load_config(temp.path(), Some(RecordingMode::Replay)).unwrap();
        assert!(build_llm_client(&config, temp.path()).is_err());
    }

    #[test]
    fn test_strict_replay_needs_no_api_key() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("llm_calls.json"), "[]").unwrap();
        let config = load_config(temp.path(), Some(RecordingMode::Replay)).unwrap();
        let client = build_llm_client(&config, temp.path()).unwrap();
        assert_eq!(client.name(), "replay");
    }

    #[test]
    fn test_config_renders_defaults() {
        let temp = TempDir::new().unwrap();
        let rendered = handle_config(temp.path()).unwrap();
        assert!(rendered.contains("max_debug_iterations = 12"));
    }

    #[tokio::test]
    async fn test_write_results() {
        let temp = TempDir::new().unwrap();
        let project = ProjectDescription::from_toml_str(
            "research_goal = \"goal\"\ndata_files = [\"data.csv\"]\n",
        )
        .unwrap();
        let mut accepted = CodeAndOutput::new("x = 1\n");
        accepted.output = Some("mean: 1".to_owned());

        write_results(temp.path(), CodeStep::DataAnalysis, &project, &accepted)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(temp.path().join(CODE_FILE)).unwrap(), "x = 1\n");
        assert_eq!(fs::read_to_string(temp.path().join("output.txt")).unwrap(), "mean: 1");
        let products: Products =
            serde_json::from_str(&fs::read_to_string(temp.path().join(PRODUCTS_FILE)).unwrap())
                .unwrap();
        assert_eq!(products.codes_and_outputs[&CodeStep::DataAnalysis], accepted);
        assert_eq!(products.research_goal.as_deref(), Some("goal"));
    }
}

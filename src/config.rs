use serde::Deserialize;
use std::path::PathBuf;

use crate::sandbox::output::{
    RenderLimits, DEFAULT_MAX_LINES, DEFAULT_MAX_LINE_LENGTH, DEFAULT_SCROLLBACK,
};

/// Hard ceiling on parallel expert branches per consultation.
pub const MAX_EXPERTS_LIMIT: usize = 5;

/// Providers `llm::from_config` knows how to build.
pub const SUPPORTED_PROVIDERS: &[&str] = &["anthropic", "openai"];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    pub llm: LlmConfig,
    /// Model used for expert consultations; defaults to `[llm]`
    #[serde(default)]
    pub expert_llm: Option<LlmConfig>,
    #[serde(default)]
    pub experts: ExpertsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Root holding `core/` and `projects/`
    #[serde(default = "default_sandbox_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,
    /// Arguments placed before the permission flags
    #[serde(default = "default_interpreter_args")]
    pub interpreter_args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Upper bound on progress latency under continuous output
    #[serde(default)]
    pub progress_max_wait_ms: Option<u64>,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// "anthropic" or "openai" (any OpenAI-compatible endpoint)
    pub provider: String,
    pub model: String,
    /// Supports ${ENV_VAR} substitution
    pub api_key: String,
    /// Overrides the provider's default endpoint
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_request: u32,
    /// Extended thinking budget (anthropic only)
    #[serde(default)]
    pub thinking_budget: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExpertsConfig {
    #[serde(default = "default_max_experts")]
    pub max_experts: usize,
    #[serde(default = "default_experts")]
    pub default_experts: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_sandbox_dir() -> PathBuf {
    PathBuf::from("./sandbox")
}

fn default_interpreter() -> PathBuf {
    PathBuf::from("deno")
}

fn default_interpreter_args() -> Vec<String> {
    vec!["run".to_string()]
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_max_lines() -> usize {
    DEFAULT_MAX_LINES
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_scrollback_lines() -> usize {
    DEFAULT_SCROLLBACK
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_experts() -> usize {
    MAX_EXPERTS_LIMIT
}

fn default_experts() -> usize {
    3
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            dir: default_sandbox_dir(),
            interpreter: default_interpreter(),
            interpreter_args: default_interpreter_args(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            progress_max_wait_ms: None,
            max_lines: default_max_lines(),
            max_line_length: default_max_line_length(),
            scrollback_lines: default_scrollback_lines(),
        }
    }
}

impl Default for ExpertsConfig {
    fn default() -> Self {
        Self {
            max_experts: default_max_experts(),
            default_experts: default_experts(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl ExecutionConfig {
    pub fn render_limits(&self) -> RenderLimits {
        RenderLimits {
            max_lines: self.max_lines,
            max_line_length: self.max_line_length,
        }
    }
}

impl LlmConfig {
    /// Human-readable description, e.g. `"anthropic (claude-sonnet-4-5)"`
    pub fn description(&self) -> String {
        format!("{} ({})", self.provider, self.model)
    }

    fn validate(&self, section: &str) -> anyhow::Result<()> {
        if !SUPPORTED_PROVIDERS.contains(&self.provider.as_str()) {
            anyhow::bail!(
                "[{section}] unknown provider '{}' (expected one of: {})",
                self.provider,
                SUPPORTED_PROVIDERS.join(", ")
            );
        }
        if self.model.trim().is_empty() {
            anyhow::bail!("[{section}] model must not be empty");
        }
        if self.max_tokens_per_request == 0 {
            anyhow::bail!("[{section}] max_tokens_per_request must be positive");
        }
        if let Some(ref base_url) = self.base_url {
            let parsed = url::Url::parse(base_url)
                .map_err(|e| anyhow::anyhow!("[{section}] invalid base_url '{base_url}': {e}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("[{section}] base_url must be http or https: {base_url}");
            }
        }
        if let Some(budget) = self.thinking_budget {
            if budget >= self.max_tokens_per_request {
                anyhow::bail!(
                    "[{section}] thinking_budget ({budget}) must be below max_tokens_per_request ({})",
                    self.max_tokens_per_request
                );
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${ANTHROPIC_API_KEY}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.validate("llm")?;
        if let Some(ref expert) = self.expert_llm {
            expert.validate("expert_llm")?;
        }

        let execution = &self.execution;
        if execution.max_lines == 0 || execution.max_line_length == 0 {
            anyhow::bail!("[execution] max_lines and max_line_length must be positive");
        }
        if execution.scrollback_lines < execution.max_lines {
            anyhow::bail!(
                "[execution] scrollback_lines ({}) must be at least max_lines ({})",
                execution.scrollback_lines,
                execution.max_lines
            );
        }
        if execution.progress_interval_ms == 0 {
            anyhow::bail!("[execution] progress_interval_ms must be positive");
        }

        let experts = &self.experts;
        if experts.max_experts == 0 || experts.max_experts > MAX_EXPERTS_LIMIT {
            anyhow::bail!(
                "[experts] max_experts must be between 1 and {MAX_EXPERTS_LIMIT}, got {}",
                experts.max_experts
            );
        }
        if experts.default_experts == 0 || experts.default_experts > experts.max_experts {
            anyhow::bail!(
                "[experts] default_experts must be between 1 and max_experts ({}), got {}",
                experts.max_experts,
                experts.default_experts
            );
        }
        Ok(())
    }

    /// Model configuration for expert consultations
    pub fn expert_llm(&self) -> &LlmConfig {
        self.expert_llm.as_ref().unwrap_or(&self.llm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[llm]
provider = "anthropic"
model = "claude-sonnet-4-5"
api_key = "test-key"
"#;

    /// Helper to build a Config with a given experts section
    fn config_with_experts(max_experts: usize, default_experts: usize) -> Config {
        let mut config = Config::parse(MINIMAL).unwrap();
        config.experts.max_experts = max_experts;
        config.experts.default_experts = default_experts;
        config
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.sandbox.dir, PathBuf::from("./sandbox"));
        assert_eq!(config.sandbox.interpreter, PathBuf::from("deno"));
        assert_eq!(config.sandbox.interpreter_args, vec!["run"]);
        assert_eq!(config.execution.max_lines, 200);
        assert_eq!(config.execution.max_line_length, 500);
        assert_eq!(config.execution.scrollback_lines, 100_000);
        assert_eq!(config.execution.progress_max_wait_ms, None);
        assert_eq!(config.llm.max_tokens_per_request, 4096);
        assert_eq!(config.experts.max_experts, 5);
        assert_eq!(config.experts.default_experts, 3);
    }

    #[test]
    fn test_expert_llm_falls_back_to_llm() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.expert_llm().model, "claude-sonnet-4-5");

        let with_expert = format!(
            "{MINIMAL}\n[expert_llm]\nprovider = \"openai\"\nmodel = \"deepseek-reasoner\"\napi_key = \"k\"\nbase_url = \"https://api.deepseek.com\"\n"
        );
        let config = Config::parse(&with_expert).unwrap();
        assert_eq!(config.expert_llm().provider, "openai");
        assert_eq!(config.expert_llm().description(), "openai (deepseek-reasoner)");
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("SYZYGY_TEST_API_KEY", "from-env");
        let content = MINIMAL.replace("test-key", "${SYZYGY_TEST_API_KEY}");
        let config = Config::parse(&content).unwrap();
        assert_eq!(config.llm.api_key, "from-env");
    }

    #[test]
    fn test_missing_env_var_is_error() {
        let content = MINIMAL.replace("test-key", "${SYZYGY_TEST_UNSET_VARIABLE_XYZ}");
        assert!(Config::parse(&content).is_err());
    }

    #[test]
    fn test_render_limits_from_execution() {
        let content = format!("{MINIMAL}\n[execution]\nmax_lines = 20\nmax_line_length = 80\n");
        let config = Config::parse(&content).unwrap();
        let limits = config.execution.render_limits();
        assert_eq!(limits.max_lines, 20);
        assert_eq!(limits.max_line_length, 80);
    }

    // ── validate tests ──────────────────────────────────

    #[test]
    fn test_rejects_unknown_provider() {
        let content = MINIMAL.replace("anthropic", "ollama");
        let err = Config::parse(&content).unwrap_err();
        assert!(err.to_string().contains("unknown provider 'ollama'"));
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let content = format!("{MINIMAL}base_url = \"not a url\"\n");
        assert!(Config::parse(&content).is_err());

        let content = format!("{MINIMAL}base_url = \"ftp://example.com\"\n");
        assert!(Config::parse(&content).is_err());
    }

    #[test]
    fn test_rejects_thinking_budget_above_max_tokens() {
        let content = format!("{MINIMAL}thinking_budget = 8000\n");
        assert!(Config::parse(&content).is_err());

        let content = format!("{MINIMAL}max_tokens_per_request = 16000\nthinking_budget = 8000\n");
        assert!(Config::parse(&content).is_ok());
    }

    #[test]
    fn test_rejects_too_many_experts() {
        assert!(config_with_experts(6, 3).validate().is_err());
        assert!(config_with_experts(0, 0).validate().is_err());
        assert!(config_with_experts(5, 5).validate().is_ok());
    }

    #[test]
    fn test_rejects_default_above_max() {
        assert!(config_with_experts(2, 3).validate().is_err());
        assert!(config_with_experts(2, 2).validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let content = format!("{MINIMAL}\n[execution]\nmax_lines = 0\n");
        assert!(Config::parse(&content).is_err());

        let content = format!("{MINIMAL}\n[execution]\nmax_lines = 300\nscrollback_lines = 100\n");
        assert!(Config::parse(&content).is_err());
    }
}

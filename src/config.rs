//! Runtime configuration for the vigil kernel.
//!
//! All tunables come from environment variables (with `.env` support via
//! `dotenvy`) plus a handful of CLI flags. `KernelConfig::from_env` reads the
//! process environment; `from_vars` takes an explicit map so tests never
//! mutate global state.

use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default per-agent turn budget.
pub const DEFAULT_MAX_TURNS: u32 = 60;

/// Default prompt character budget per LLM call.
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 400_000;

/// Default fan-out concurrency for vulnerability-analysis and exploitation.
pub const DEFAULT_PARALLEL_LIMIT: usize = 5;

/// Default serialized-history size that triggers compression.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 300_000;

/// Default recent-turn window preserved by compression.
pub const DEFAULT_COMPRESSION_WINDOW: usize = 15;

/// Default turn budget for sub-agent conversations.
pub const DEFAULT_SUBAGENT_MAX_TURNS: u32 = 12;

/// Default byte cap on a sub-agent's returned summary.
pub const DEFAULT_SUBAGENT_TRUNCATE_LIMIT: usize = 8_000;

/// Default wall-clock limit for a single shell tool call.
pub const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 60;

/// Sessions idle longer than this are demoted from in-progress to interrupted.
pub const DEFAULT_SESSION_STALE_SECS: u64 = 45 * 60;

/// Running agents whose last audit event is older than this are reconciled to failed.
pub const DEFAULT_RUNNING_STALE_SECS: u64 = 30 * 60;

/// Runtime configuration assembled from environment and CLI flags.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Base URL of the chat-completions endpoint.
    pub llm_base_url: String,
    /// Model identifier sent with each request.
    pub model: String,
    /// API key for the endpoint.
    pub api_key: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Default turn budget per agent.
    pub max_turns: u32,
    /// Per-agent turn budget overrides keyed by agent name.
    pub max_turns_overrides: HashMap<String, u32>,
    /// Prompt character budget; prompts are always shrunk below this.
    pub max_prompt_chars: usize,
    /// USD price per million prompt tokens.
    pub prompt_token_price: f64,
    /// USD price per million completion tokens.
    pub completion_token_price: f64,
    /// Fan-out concurrency cap.
    pub parallel_limit: usize,
    /// Serialized-history size that triggers compression.
    pub compression_threshold: usize,
    /// Recent-turn window preserved by compression.
    pub compression_window: usize,
    /// Sub-agent turn budget.
    pub subagent_max_turns: u32,
    /// Byte cap on sub-agent summaries.
    pub subagent_truncate_limit: usize,
    /// Maximum sub-agent nesting depth.
    pub subagent_max_depth: u32,
    /// Maximum concurrent sub-agents per parent.
    pub subagent_max_concurrent: usize,
    /// Shell tool call timeout.
    pub shell_timeout: Duration,
    /// Staleness threshold for in-progress sessions.
    pub session_stale_after: Duration,
    /// Staleness threshold for running agents during reconciliation.
    pub running_stale_after: Duration,
    /// External scanners to skip, by name.
    pub skipped_scanners: Vec<String>,
    /// HTTP proxy propagated to child shells.
    pub http_proxy: Option<String>,
    /// HTTPS proxy propagated to child shells.
    pub https_proxy: Option<String>,
    /// Optional tool-server manifest path.
    pub toolservers_file: Option<PathBuf>,
    /// Debug/verbose flag.
    pub debug: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            llm_base_url: "http://localhost:4000/v1".to_string(),
            model: "default".to_string(),
            api_key: String::new(),
            temperature: 0.2,
            max_turns: DEFAULT_MAX_TURNS,
            max_turns_overrides: HashMap::new(),
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
            prompt_token_price: 0.0,
            completion_token_price: 0.0,
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            compression_window: DEFAULT_COMPRESSION_WINDOW,
            subagent_max_turns: DEFAULT_SUBAGENT_MAX_TURNS,
            subagent_truncate_limit: DEFAULT_SUBAGENT_TRUNCATE_LIMIT,
            subagent_max_depth: 2,
            subagent_max_concurrent: 1,
            shell_timeout: Duration::from_secs(DEFAULT_SHELL_TIMEOUT_SECS),
            session_stale_after: Duration::from_secs(DEFAULT_SESSION_STALE_SECS),
            running_stale_after: Duration::from_secs(DEFAULT_RUNNING_STALE_SECS),
            skipped_scanners: Vec::new(),
            http_proxy: None,
            https_proxy: None,
            toolservers_file: None,
            debug: false,
        }
    }
}

impl KernelConfig {
    /// Load configuration from the process environment.
    ///
    /// Loads `.env` first if present so local development setups work
    /// without exporting anything.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Build configuration from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = vars.get("VIGIL_LLM_BASE_URL") {
            config.llm_base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = vars.get("VIGIL_MODEL") {
            config.model = v.clone();
        }
        if let Some(v) = vars.get("VIGIL_API_KEY") {
            config.api_key = v.clone();
        }
        if let Some(v) = vars.get("VIGIL_TEMPERATURE") {
            config.temperature = v
                .parse()
                .map_err(|_| anyhow!("VIGIL_TEMPERATURE must be a number, got '{v}'"))?;
        }
        if let Some(v) = vars.get("VIGIL_MAX_TURNS") {
            config.max_turns = parse_positive(v, "VIGIL_MAX_TURNS")?;
        }
        if let Some(v) = vars.get("VIGIL_MAX_PROMPT_CHARS") {
            config.max_prompt_chars = parse_positive(v, "VIGIL_MAX_PROMPT_CHARS")? as usize;
        }
        if let Some(v) = vars.get("VIGIL_PROMPT_TOKEN_PRICE") {
            config.prompt_token_price = v
                .parse()
                .map_err(|_| anyhow!("VIGIL_PROMPT_TOKEN_PRICE must be a number, got '{v}'"))?;
        }
        if let Some(v) = vars.get("VIGIL_COMPLETION_TOKEN_PRICE") {
            config.completion_token_price = v.parse().map_err(|_| {
                anyhow!("VIGIL_COMPLETION_TOKEN_PRICE must be a number, got '{v}'")
            })?;
        }
        if let Some(v) = vars.get("VIGIL_PARALLEL_LIMIT") {
            config.parallel_limit = parse_positive(v, "VIGIL_PARALLEL_LIMIT")? as usize;
        }
        if let Some(v) = vars.get("VIGIL_COMPRESSION_THRESHOLD") {
            config.compression_threshold = parse_positive(v, "VIGIL_COMPRESSION_THRESHOLD")? as usize;
        }
        if let Some(v) = vars.get("VIGIL_COMPRESSION_WINDOW") {
            config.compression_window = parse_positive(v, "VIGIL_COMPRESSION_WINDOW")? as usize;
        }
        if let Some(v) = vars.get("VIGIL_SUBAGENT_MAX_TURNS") {
            config.subagent_max_turns = parse_positive(v, "VIGIL_SUBAGENT_MAX_TURNS")?;
        }
        if let Some(v) = vars.get("VIGIL_SUBAGENT_TRUNCATE_LIMIT") {
            config.subagent_truncate_limit =
                parse_positive(v, "VIGIL_SUBAGENT_TRUNCATE_LIMIT")? as usize;
        }
        if let Some(v) = vars.get("VIGIL_SUBAGENT_MAX_DEPTH") {
            config.subagent_max_depth = parse_positive(v, "VIGIL_SUBAGENT_MAX_DEPTH")?;
        }
        if let Some(v) = vars.get("VIGIL_SUBAGENT_MAX_CONCURRENT") {
            config.subagent_max_concurrent =
                parse_positive(v, "VIGIL_SUBAGENT_MAX_CONCURRENT")? as usize;
        }
        if let Some(v) = vars.get("VIGIL_SHELL_TIMEOUT_SECS") {
            config.shell_timeout = Duration::from_secs(parse_positive(v, "VIGIL_SHELL_TIMEOUT_SECS")? as u64);
        }
        if let Some(v) = vars.get("VIGIL_SESSION_STALE_SECS") {
            config.session_stale_after =
                Duration::from_secs(parse_positive(v, "VIGIL_SESSION_STALE_SECS")? as u64);
        }
        if let Some(v) = vars.get("VIGIL_RUNNING_STALE_SECS") {
            config.running_stale_after =
                Duration::from_secs(parse_positive(v, "VIGIL_RUNNING_STALE_SECS")? as u64);
        }
        if let Some(v) = vars.get("VIGIL_TOOLSERVERS_FILE") {
            config.toolservers_file = Some(PathBuf::from(v));
        }

        config.http_proxy = vars
            .get("HTTP_PROXY")
            .or_else(|| vars.get("http_proxy"))
            .cloned();
        config.https_proxy = vars
            .get("HTTPS_PROXY")
            .or_else(|| vars.get("https_proxy"))
            .cloned();

        config.debug = vars
            .get("VIGIL_DEBUG")
            .map(|v| v != "0" && v != "false")
            .unwrap_or(false);

        // Scanner skip flags: VIGIL_SKIP_NMAP=1, VIGIL_SKIP_SEMGREP=1, ...
        for (key, value) in vars {
            if let Some(scanner) = key.strip_prefix("VIGIL_SKIP_") {
                if value != "0" && value != "false" {
                    config.skipped_scanners.push(scanner.to_lowercase());
                }
            }
            // Per-agent turn overrides: VIGIL_MAX_TURNS_SQLI_VULN=40
            if let Some(agent) = key.strip_prefix("VIGIL_MAX_TURNS_") {
                let turns = parse_positive(value, key)?;
                config
                    .max_turns_overrides
                    .insert(agent.to_lowercase().replace('_', "-"), turns);
            }
        }
        config.skipped_scanners.sort();

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(anyhow!(
                "temperature must be in [0.0, 2.0], got {}",
                self.temperature
            ));
        }
        if self.compression_window == 0 {
            return Err(anyhow!("compression window must be at least 1 turn"));
        }
        if self.parallel_limit == 0 {
            return Err(anyhow!("parallel limit must be at least 1"));
        }
        if self.subagent_max_depth == 0 {
            return Err(anyhow!("sub-agent depth must be at least 1"));
        }
        Ok(())
    }

    /// Turn budget for a specific agent, honoring overrides.
    pub fn max_turns_for(&self, agent: &str) -> u32 {
        self.max_turns_overrides
            .get(agent)
            .copied()
            .unwrap_or(self.max_turns)
    }

    /// Whether an external scanner is skipped by configuration.
    pub fn scanner_skipped(&self, scanner: &str) -> bool {
        self.skipped_scanners
            .iter()
            .any(|s| s == &scanner.to_lowercase())
    }

    /// Proxy environment propagated to child shells, as key/value pairs.
    pub fn proxy_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(p) = &self.http_proxy {
            env.push(("HTTP_PROXY".to_string(), p.clone()));
            env.push(("http_proxy".to_string(), p.clone()));
        }
        if let Some(p) = &self.https_proxy {
            env.push(("HTTPS_PROXY".to_string(), p.clone()));
            env.push(("https_proxy".to_string(), p.clone()));
        }
        env
    }

    /// Cost in USD for a token usage sample at the configured prices.
    pub fn cost_usd(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.prompt_token_price
            + completion_tokens as f64 * self.completion_token_price)
            / 1_000_000.0
    }
}

fn parse_positive(value: &str, key: &str) -> Result<u32> {
    let parsed: u32 = value
        .parse()
        .with_context(|| format!("{key} must be a positive integer, got '{value}'"))?;
    if parsed == 0 {
        return Err(anyhow!("{key} must be greater than zero"));
    }
    Ok(parsed)
}

/// A declarative target profile referenced by `--config`.
///
/// The kernel never interprets the contents beyond checking it parses;
/// prompt templates consume the authentication and rule hints.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TargetProfile {
    #[serde(default)]
    pub auth: serde_json::Value,
    #[serde(default)]
    pub rules: serde_json::Value,
}

impl TargetProfile {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read target profile: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse target profile: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = KernelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_turns, DEFAULT_MAX_TURNS);
        assert_eq!(config.parallel_limit, DEFAULT_PARALLEL_LIMIT);
        assert_eq!(config.shell_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_from_vars_reads_core_settings() {
        let config = KernelConfig::from_vars(&vars(&[
            ("VIGIL_LLM_BASE_URL", "https://llm.example.com/v1/"),
            ("VIGIL_MODEL", "assessor-large"),
            ("VIGIL_API_KEY", "sk-test"),
            ("VIGIL_MAX_TURNS", "40"),
            ("VIGIL_PARALLEL_LIMIT", "3"),
        ]))
        .unwrap();

        // Trailing slash is normalized away
        assert_eq!(config.llm_base_url, "https://llm.example.com/v1");
        assert_eq!(config.model, "assessor-large");
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.max_turns, 40);
        assert_eq!(config.parallel_limit, 3);
    }

    #[test]
    fn test_from_vars_rejects_zero_parallel_limit() {
        let result = KernelConfig::from_vars(&vars(&[("VIGIL_PARALLEL_LIMIT", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_vars_rejects_bad_temperature() {
        let result = KernelConfig::from_vars(&vars(&[("VIGIL_TEMPERATURE", "9.5")]));
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("temperature must be in")
        );
    }

    #[test]
    fn test_per_agent_turn_overrides() {
        let config = KernelConfig::from_vars(&vars(&[
            ("VIGIL_MAX_TURNS", "50"),
            ("VIGIL_MAX_TURNS_SQLI_VULN", "30"),
        ]))
        .unwrap();

        assert_eq!(config.max_turns_for("sqli-vuln"), 30);
        assert_eq!(config.max_turns_for("recon"), 50);
    }

    #[test]
    fn test_scanner_skip_flags() {
        let config = KernelConfig::from_vars(&vars(&[
            ("VIGIL_SKIP_NMAP", "1"),
            ("VIGIL_SKIP_SEMGREP", "true"),
            ("VIGIL_SKIP_SUBFINDER", "false"),
        ]))
        .unwrap();

        assert!(config.scanner_skipped("nmap"));
        assert!(config.scanner_skipped("SEMGREP"));
        assert!(!config.scanner_skipped("subfinder"));
        assert!(!config.scanner_skipped("whatweb"));
    }

    #[test]
    fn test_proxy_env_propagation() {
        let config = KernelConfig::from_vars(&vars(&[(
            "HTTP_PROXY",
            "http://proxy.internal:3128",
        )]))
        .unwrap();

        let env = config.proxy_env();
        assert!(
            env.iter()
                .any(|(k, v)| k == "http_proxy" && v == "http://proxy.internal:3128")
        );
        assert!(env.iter().all(|(k, _)| !k.starts_with("HTTPS")));
    }

    #[test]
    fn test_cost_computation() {
        let config = KernelConfig::from_vars(&vars(&[
            ("VIGIL_PROMPT_TOKEN_PRICE", "3.0"),
            ("VIGIL_COMPLETION_TOKEN_PRICE", "15.0"),
        ]))
        .unwrap();

        // 1M prompt tokens at $3/M plus 200k completion at $15/M
        let cost = config.cost_usd(1_000_000, 200_000);
        assert!((cost - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_zero_when_unpriced() {
        let config = KernelConfig::default();
        assert_eq!(config.cost_usd(1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn test_stale_thresholds() {
        let config = KernelConfig::from_vars(&vars(&[
            ("VIGIL_SESSION_STALE_SECS", "120"),
            ("VIGIL_RUNNING_STALE_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.session_stale_after, Duration::from_secs(120));
        assert_eq!(config.running_stale_after, Duration::from_secs(60));
    }

    #[test]
    fn test_target_profile_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(
            &path,
            r#"{"auth": {"username": "tester"}, "rules": {"scope": "staging"}}"#,
        )
        .unwrap();

        let profile = TargetProfile::load(&path).unwrap();
        assert_eq!(profile.auth["username"], "tester");
        assert_eq!(profile.rules["scope"], "staging");
    }

    #[test]
    fn test_target_profile_load_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(TargetProfile::load(&path).is_err());
    }
}

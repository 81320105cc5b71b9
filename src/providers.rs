use serde::{Deserialize, Serialize};

/// What a backend can do. Gating happens in the dispatcher before the
/// request leaves the process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub supports_streaming: bool,
    pub supports_json_mode: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_tools: true,
            supports_vision: true,
            supports_streaming: true,
            supports_json_mode: true,
        }
    }
}

/// A resolved backend endpoint. Descriptors for registered providers are
/// rebuilt on every lookup so environment overrides take effect without a
/// restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub base_url: String,
    pub api_path: String,
    pub api_key_env: Option<String>,
    pub capabilities: Capabilities,
    /// Probe paths tried in order on first use; any 2xx marks the
    /// provider healthy.
    pub health_paths: Vec<String>,
    /// Shell command shown to the user when the provider is down.
    pub start_command: Option<String>,
    pub is_local: bool,
}

impl ProviderDescriptor {
    pub fn chat_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.api_path)
    }
}

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

fn env_first(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|v| !v.is_empty())
}

fn ollama() -> ProviderDescriptor {
    let base = env_first(&["OLLAMA_HOST", "OLLAMA_BASE_URL"])
        .unwrap_or_else(|| "http://localhost:11434".to_string());
    ProviderDescriptor {
        name: "ollama".to_string(),
        base_url: base,
        api_path: CHAT_COMPLETIONS_PATH.to_string(),
        api_key_env: Some("OLLAMA_API_KEY".to_string()),
        capabilities: Capabilities::default(),
        health_paths: vec!["/api/tags".to_string(), "/v1/models".to_string()],
        start_command: Some("ollama serve".to_string()),
        is_local: true,
    }
}

fn lmstudio() -> ProviderDescriptor {
    let base = env_first(&["LMSTUDIO_BASE_URL"])
        .unwrap_or_else(|| "http://localhost:1234".to_string());
    ProviderDescriptor {
        name: "lmstudio".to_string(),
        base_url: base,
        api_path: CHAT_COMPLETIONS_PATH.to_string(),
        api_key_env: Some("LMSTUDIO_API_KEY".to_string()),
        capabilities: Capabilities::default(),
        health_paths: vec!["/v1/models".to_string()],
        start_command: Some("lms server start".to_string()),
        is_local: true,
    }
}

fn vllm() -> ProviderDescriptor {
    let base =
        env_first(&["VLLM_BASE_URL"]).unwrap_or_else(|| "http://localhost:8000".to_string());
    ProviderDescriptor {
        name: "vllm".to_string(),
        base_url: base,
        api_path: CHAT_COMPLETIONS_PATH.to_string(),
        api_key_env: Some("VLLM_API_KEY".to_string()),
        capabilities: Capabilities::default(),
        health_paths: vec!["/v1/models".to_string()],
        start_command: Some("vllm serve <model>".to_string()),
        is_local: true,
    }
}

fn mlx() -> ProviderDescriptor {
    let base =
        env_first(&["MLX_BASE_URL"]).unwrap_or_else(|| "http://localhost:8080".to_string());
    ProviderDescriptor {
        name: "mlx".to_string(),
        base_url: base,
        api_path: CHAT_COMPLETIONS_PATH.to_string(),
        api_key_env: Some("MLX_API_KEY".to_string()),
        capabilities: Capabilities {
            // mlx_lm.server has no native tool-call support
            supports_tools: false,
            supports_vision: false,
            ..Capabilities::default()
        },
        health_paths: vec!["/v1/models".to_string()],
        start_command: Some("mlx_lm.server --port 8080".to_string()),
        is_local: true,
    }
}

fn openrouter() -> ProviderDescriptor {
    ProviderDescriptor {
        name: "openrouter".to_string(),
        base_url: OPENROUTER_BASE_URL.to_string(),
        api_path: CHAT_COMPLETIONS_PATH.to_string(),
        api_key_env: Some("OPENROUTER_API_KEY".to_string()),
        capabilities: Capabilities::default(),
        health_paths: Vec::new(),
        start_command: None,
        is_local: false,
    }
}

/// Prefixes accepted in model ids, checked in declaration order.
const PREFIXES: &[(&str, fn() -> ProviderDescriptor)] = &[
    ("ollama/", ollama),
    ("ollama:", ollama),
    ("lmstudio/", lmstudio),
    ("lmstudio:", lmstudio),
    ("vllm/", vllm),
    ("vllm:", vllm),
    ("mlx/", mlx),
    ("mlx:", mlx),
];

/// Registry resolving a model identifier to a backend descriptor plus the
/// model name to send upstream.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry;

impl ProviderRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Resolution order: provider prefix, absolute URL, custom base URL
    /// override, hosted aggregator.
    pub fn resolve(&self, model_id: &str) -> (ProviderDescriptor, String) {
        for (prefix, build) in PREFIXES {
            if let Some(rest) = model_id.strip_prefix(prefix) {
                return (build(), rest.to_string());
            }
        }

        if model_id.starts_with("http://") || model_id.starts_with("https://") {
            if let Some((base, model)) = split_url_model(model_id) {
                return (
                    ProviderDescriptor {
                        name: "custom-url".to_string(),
                        base_url: base,
                        api_path: CHAT_COMPLETIONS_PATH.to_string(),
                        api_key_env: None,
                        capabilities: Capabilities::default(),
                        health_paths: vec!["/v1/models".to_string()],
                        start_command: None,
                        is_local: true,
                    },
                    model,
                );
            }
        }

        if let Some(base) = env_first(&["CLAUDISH_BASE_URL"]) {
            return (
                ProviderDescriptor {
                    name: "custom".to_string(),
                    base_url: base,
                    api_path: CHAT_COMPLETIONS_PATH.to_string(),
                    api_key_env: None,
                    capabilities: Capabilities::default(),
                    health_paths: vec!["/v1/models".to_string()],
                    start_command: None,
                    is_local: true,
                },
                model_id.to_string(),
            );
        }

        (openrouter(), model_id.to_string())
    }

    /// API key for a descriptor: its own env var first, then the generic
    /// local fallback. Unauthenticated local servers get no credential.
    pub fn api_key(&self, provider: &ProviderDescriptor) -> Option<String> {
        if let Some(env) = &provider.api_key_env {
            if let Some(key) = env_first(&[env.as_str()]) {
                return Some(key);
            }
        }
        if provider.is_local {
            return env_first(&["CLAUDISH_LOCAL_API_KEY"]);
        }
        None
    }
}

/// Split an absolute URL into a base and the trailing path segment as the
/// model name, e.g. `http://localhost:8000/qwen3:4b` ->
/// (`http://localhost:8000`, `qwen3:4b`). A `/v1` suffix on the base is
/// dropped since the api path re-adds it.
fn split_url_model(url: &str) -> Option<(String, String)> {
    let scheme_end = url.find("://")? + 3;
    let trimmed = url.trim_end_matches('/');
    let split_at = trimmed.rfind('/')?;
    if split_at < scheme_end {
        return None;
    }
    let model = &trimmed[split_at + 1..];
    if model.is_empty() {
        return None;
    }
    let base = trimmed[..split_at].trim_end_matches("/v1");
    Some((base.to_string(), model.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_resolves_and_strips() {
        let registry = ProviderRegistry::new();
        let (provider, model) = registry.resolve("ollama/qwen3:8b");
        assert_eq!(provider.name, "ollama");
        assert_eq!(model, "qwen3:8b");

        let (provider, model) = registry.resolve("lmstudio:meta-llama-3.1-8b");
        assert_eq!(provider.name, "lmstudio");
        assert_eq!(model, "meta-llama-3.1-8b");
    }

    #[test]
    fn bare_model_routes_to_aggregator() {
        let registry = ProviderRegistry::new();
        let (provider, model) = registry.resolve("qwen/qwen3-coder:free");
        assert_eq!(provider.name, "openrouter");
        assert!(!provider.is_local);
        assert_eq!(model, "qwen/qwen3-coder:free");
    }

    #[test]
    fn absolute_url_builds_ad_hoc_provider() {
        let registry = ProviderRegistry::new();
        let (provider, model) = registry.resolve("http://192.168.1.20:8000/qwen3:4b");
        assert_eq!(provider.name, "custom-url");
        assert_eq!(provider.base_url, "http://192.168.1.20:8000");
        assert_eq!(model, "qwen3:4b");
    }

    #[test]
    fn url_without_model_segment_is_not_ad_hoc() {
        assert!(split_url_model("http://localhost:8000").is_none());
        assert!(split_url_model("http://localhost:8000/").is_none());
    }

    #[test]
    fn url_with_v1_base_does_not_double_the_api_path() {
        let (base, model) = split_url_model("http://localhost:8000/v1/qwen3:4b").unwrap();
        assert_eq!(base, "http://localhost:8000");
        assert_eq!(model, "qwen3:4b");
    }

    #[test]
    fn chat_url_joins_without_double_slash() {
        let mut provider = ollama();
        provider.base_url = "http://localhost:11434/".to_string();
        assert_eq!(provider.chat_url(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn mlx_lacks_tool_support() {
        let registry = ProviderRegistry::new();
        let (provider, _) = registry.resolve("mlx/mistral-7b-instruct");
        assert!(!provider.capabilities.supports_tools);
    }
}

pub mod providers;
pub mod retry;
pub mod streaming;

use redraft_core::config::{AppConfig, ModelConfig};
use redraft_core::error::{RedraftError, Result};
use redraft_core::traits::GenerationService;

pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create a generation client for a single model config.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn GenerationService>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiClient::new(config.clone()))),
        other if providers::presets::get_preset(other).is_some() => {
            Ok(Box::new(OpenAiClient::new(config.clone())))
        }
        // Custom OpenAI-compatible endpoints must say where they live
        _ if config.base_url.is_some() => Ok(Box::new(OpenAiClient::new(config.clone()))),
        other => Err(RedraftError::UnsupportedProvider(other.to_string())),
    }
}

/// Build the primary client plus fallbacks, wrapped in retry handling.
pub fn create_retrying_client(config: &AppConfig) -> Result<RetryingClient> {
    let primary = create_client(&config.model)?;
    let mut fallbacks = Vec::with_capacity(config.fallback_models.len());
    for fb in &config.fallback_models {
        fallbacks.push((fb.model_id.clone(), create_client(fb)?));
    }
    let retry = config.model.retry.clone().unwrap_or_default();
    Ok(RetryingClient::new(primary, fallbacks, retry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(provider: &str, base_url: Option<&str>) -> ModelConfig {
        toml::from_str::<ModelConfig>(&format!(
            "provider = \"{}\"\nmodel_id = \"m\"\n{}",
            provider,
            base_url
                .map(|u| format!("base_url = \"{}\"", u))
                .unwrap_or_default()
        ))
        .unwrap()
    }

    #[test]
    fn test_create_client_known_providers() {
        assert!(create_client(&model("openai", None)).is_ok());
        assert!(create_client(&model("ollama", None)).is_ok());
        assert!(create_client(&model("vllm", Some("http://localhost:8000/v1/chat/completions"))).is_ok());
    }

    #[test]
    fn test_create_client_unknown_provider() {
        let err = create_client(&model("carrier-pigeon", None)).err().unwrap();
        assert!(matches!(err, RedraftError::UnsupportedProvider(_)));
    }
}

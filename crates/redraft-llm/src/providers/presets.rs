use std::collections::HashMap;

/// A named provider preset for OpenAI-compatible APIs.
pub struct ProviderPreset {
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    pub extra_headers: Headers,
}

pub type Headers = &'static [(&'static str, &'static str)];

const NO_HEADERS: Headers = &[];
const OPENROUTER_HEADERS: Headers = &[("X-Title", "redraft")];

/// Look up a provider preset by name.
pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    let (default_base_url, needs_api_key, extra_headers) = match provider {
        "ollama" => ("http://localhost:11434/v1/chat/completions", false, NO_HEADERS),
        "groq" => ("https://api.groq.com/openai/v1/chat/completions", true, NO_HEADERS),
        "openrouter" => (
            "https://openrouter.ai/api/v1/chat/completions",
            true,
            OPENROUTER_HEADERS,
        ),
        "together" => ("https://api.together.xyz/v1/chat/completions", true, NO_HEADERS),
        "mistral" => ("https://api.mistral.ai/v1/chat/completions", true, NO_HEADERS),
        "deepseek" => ("https://api.deepseek.com/v1/chat/completions", true, NO_HEADERS),
        _ => return None,
    };
    Some(ProviderPreset {
        default_base_url,
        needs_api_key,
        extra_headers,
    })
}

/// Build extra headers from a preset + user config overrides.
pub fn build_extra_headers(
    preset: &ProviderPreset,
    user_headers: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = preset
        .extra_headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    for (k, v) in user_headers {
        // User overrides take precedence
        match headers.iter_mut().find(|(hk, _)| hk.eq_ignore_ascii_case(k)) {
            Some(existing) => existing.1 = v.clone(),
            None => headers.push((k.clone(), v.clone())),
        }
    }

    headers
}

//! Static provider -> endpoint table.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::credentials::ProviderCredential;
use super::translation::Dialect;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Azure,
    Bedrock,
    Vertex,
    Groq,
    #[serde(rename = "deepseek")]
    DeepSeek,
    Xai,
    Mistral,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl ProviderName {
    pub const ALL: [ProviderName; 10] = [
        ProviderName::OpenAi,
        ProviderName::Anthropic,
        ProviderName::Azure,
        ProviderName::Bedrock,
        ProviderName::Vertex,
        ProviderName::Groq,
        ProviderName::DeepSeek,
        ProviderName::Xai,
        ProviderName::Mistral,
        ProviderName::OpenRouter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderName::OpenAi => "openai",
            ProviderName::Anthropic => "anthropic",
            ProviderName::Azure => "azure",
            ProviderName::Bedrock => "bedrock",
            ProviderName::Vertex => "vertex",
            ProviderName::Groq => "groq",
            ProviderName::DeepSeek => "deepseek",
            ProviderName::Xai => "xai",
            ProviderName::Mistral => "mistral",
            ProviderName::OpenRouter => "openrouter",
        }
    }

    pub fn auth_style(self) -> AuthStyle {
        match self {
            ProviderName::Anthropic => AuthStyle::Header("x-api-key"),
            ProviderName::Azure => AuthStyle::Header("api-key"),
            ProviderName::Bedrock => AuthStyle::SigV4 { service: "bedrock" },
            _ => AuthStyle::Bearer,
        }
    }

    /// Fixed headers every request to this provider carries.
    pub fn static_headers(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ProviderName::Anthropic => &[("anthropic-version", "2023-06-01")],
            _ => &[],
        }
    }

    /// Wire dialect the provider expects for `model`.
    pub fn dialect_for(self, model: &str) -> Dialect {
        match self {
            ProviderName::Anthropic => Dialect::Anthropic,
            ProviderName::Bedrock | ProviderName::Vertex if is_claude_model(model) => {
                Dialect::Anthropic
            }
            _ => Dialect::OpenAi,
        }
    }

    /// Whether the model name travels in the URL path instead of the body.
    pub fn is_path_addressed(self, model: &str) -> bool {
        matches!(self, ProviderName::Azure)
            || (matches!(self, ProviderName::Bedrock | ProviderName::Vertex)
                && is_claude_model(model))
    }

    fn default_base_url(self) -> &'static str {
        match self {
            ProviderName::OpenAi => "https://api.openai.com",
            ProviderName::Anthropic => "https://api.anthropic.com",
            ProviderName::Azure => "https://{resource}.openai.azure.com",
            ProviderName::Bedrock => "https://bedrock-runtime.{region}.amazonaws.com",
            ProviderName::Vertex => "https://{region}-aiplatform.googleapis.com",
            ProviderName::Groq => "https://api.groq.com/openai",
            ProviderName::DeepSeek => "https://api.deepseek.com",
            ProviderName::Xai => "https://api.x.ai",
            ProviderName::Mistral => "https://api.mistral.ai",
            ProviderName::OpenRouter => "https://openrouter.ai/api",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderName {
    type Err = UnknownProvider;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        ProviderName::ALL
            .into_iter()
            .find(|provider| provider.as_str() == normalized)
            .ok_or_else(|| UnknownProvider(raw.to_string()))
    }
}

pub fn is_claude_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("claude")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    Header(&'static str),
    SigV4 { service: &'static str },
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("{provider} requires credential setting {setting:?}")]
    MissingSetting {
        provider: ProviderName,
        setting: &'static str,
    },
    #[error("invalid endpoint url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";

/// Base URLs per provider, with optional overrides from configuration.
///
/// Templates may reference `{region}`, `{project}` and `{resource}`; those are filled from the
/// credential's region and settings.
#[derive(Clone, Debug, Default)]
pub struct ProviderTable {
    overrides: BTreeMap<ProviderName, String>,
}

impl ProviderTable {
    pub fn new(overrides: BTreeMap<ProviderName, String>) -> Self {
        Self { overrides }
    }

    pub fn base_url_template(&self, provider: ProviderName) -> &str {
        self.overrides
            .get(&provider)
            .map(String::as_str)
            .unwrap_or_else(|| provider.default_base_url())
    }

    pub fn base_url(
        &self,
        provider: ProviderName,
        credential: &ProviderCredential,
    ) -> Result<String, EndpointError> {
        let mut base = self
            .base_url_template(provider)
            .trim_end_matches('/')
            .to_string();
        for (placeholder, setting) in [
            ("{region}", "region"),
            ("{project}", "project_id"),
            ("{resource}", "resource_name"),
        ] {
            if !base.contains(placeholder) {
                continue;
            }
            let value = credential
                .setting(setting)
                .ok_or(EndpointError::MissingSetting { provider, setting })?;
            base = base.replace(placeholder, value);
        }
        Ok(base)
    }

    /// Full request URL for one attempt.
    pub fn endpoint(
        &self,
        provider: ProviderName,
        model: &str,
        stream: bool,
        credential: &ProviderCredential,
    ) -> Result<Url, EndpointError> {
        let base = self.base_url(provider, credential)?;
        let url = match provider {
            ProviderName::Anthropic => format!("{base}/v1/messages"),
            ProviderName::Azure => {
                let api_version = credential
                    .setting("api_version")
                    .unwrap_or(DEFAULT_AZURE_API_VERSION);
                format!(
                    "{base}/openai/deployments/{model}/chat/completions?api-version={api_version}"
                )
            }
            ProviderName::Bedrock if is_claude_model(model) => {
                let action = if stream {
                    "invoke-with-response-stream"
                } else {
                    "invoke"
                };
                format!("{base}/model/{model}/{action}")
            }
            ProviderName::Bedrock => format!("{base}/openai/v1/chat/completions"),
            ProviderName::Vertex => {
                let region = credential.setting("region").ok_or(EndpointError::MissingSetting {
                    provider,
                    setting: "region",
                })?;
                let project =
                    credential
                        .setting("project_id")
                        .ok_or(EndpointError::MissingSetting {
                            provider,
                            setting: "project_id",
                        })?;
                if is_claude_model(model) {
                    let action = if stream {
                        "streamRawPredict"
                    } else {
                        "rawPredict"
                    };
                    format!(
                        "{base}/v1/projects/{project}/locations/{region}/publishers/anthropic/models/{model}:{action}"
                    )
                } else {
                    format!(
                        "{base}/v1/projects/{project}/locations/{region}/endpoints/openapi/chat/completions"
                    )
                }
            }
            _ => format!("{base}/v1/chat/completions"),
        };
        Url::parse(&url).map_err(|err| EndpointError::InvalidUrl {
            reason: err.to_string(),
            url,
        })
    }
}

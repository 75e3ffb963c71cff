//! Model routing strings: `"<model>/<provider>,<model>/<provider>,..."`.

use std::fmt;

use thiserror::Error;

use super::providers::ProviderName;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteCandidate {
    pub model: String,
    pub provider: ProviderName,
}

impl fmt::Display for RouteCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.provider)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteParseError {
    #[error("invalid model string {0:?}: expected <model>/<provider>")]
    Shape(String),
    #[error("invalid model string {raw:?}: unknown provider {provider:?}")]
    UnknownProvider { raw: String, provider: String },
}

/// Ordered candidate list. Entries are kept raw and validated one at a time, so a malformed
/// entry fails only its own attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelRoute {
    entries: Vec<String>,
}

impl ModelRoute {
    pub fn parse(routing: &str) -> Self {
        let entries = routing
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

pub fn parse_candidate(raw: &str) -> Result<RouteCandidate, RouteParseError> {
    let segments = raw.split('/').collect::<Vec<_>>();
    let [model, provider] = segments.as_slice() else {
        return Err(RouteParseError::Shape(raw.to_string()));
    };
    let (model, provider) = (model.trim(), provider.trim());
    if model.is_empty() || provider.is_empty() {
        return Err(RouteParseError::Shape(raw.to_string()));
    }
    let provider = provider
        .parse::<ProviderName>()
        .map_err(|_| RouteParseError::UnknownProvider {
            raw: raw.to_string(),
            provider: provider.to_string(),
        })?;
    Ok(RouteCandidate {
        model: model.to_string(),
        provider,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_trims_the_routing_string() {
        let route = ModelRoute::parse(" gpt-4o/openai , ,claude-3-haiku/anthropic ");
        assert_eq!(route.entries(), ["gpt-4o/openai", "claude-3-haiku/anthropic"]);
        assert!(ModelRoute::parse(" , ").is_empty());
    }

    #[test]
    fn candidates_need_exactly_two_non_empty_segments() {
        assert_eq!(
            parse_candidate("gpt-4o/openai").unwrap(),
            RouteCandidate {
                model: "gpt-4o".to_string(),
                provider: ProviderName::OpenAi,
            }
        );
        for raw in ["gpt-4o", "/openai", "gpt-4o/", "a/b/openai"] {
            assert_eq!(
                parse_candidate(raw),
                Err(RouteParseError::Shape(raw.to_string())),
                "{raw}"
            );
        }
        assert!(matches!(
            parse_candidate("a/unknownprovider"),
            Err(RouteParseError::UnknownProvider { .. })
        ));
    }
}

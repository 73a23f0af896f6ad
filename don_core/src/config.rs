//! Request configuration.
//!
//! External collaborators (CLI, deployment tooling) populate a
//! [`RequestConfig`] from files and environment; this crate only ever sees
//! the validated value.

use crate::error::{DonError, Result};
use crate::secrets::SecretsMap;
use crate::value::ReturnType;
use serde::{Deserialize, Serialize};

/// Default callback gas limit for a request.
pub const DEFAULT_GAS_LIMIT: u32 = 100_000;

/// Where the request's source code lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLocation {
    #[serde(alias = "Inline")]
    Inline,
    #[serde(alias = "Remote")]
    Remote,
}

impl CodeLocation {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            CodeLocation::Inline => 0,
            CodeLocation::Remote => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CodeLocation::Inline),
            1 => Some(CodeLocation::Remote),
            _ => None,
        }
    }
}

/// The language the source code is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    #[serde(alias = "JavaScript")]
    JavaScript,
}

impl CodeLanguage {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            CodeLanguage::JavaScript => 0,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CodeLanguage::JavaScript),
            _ => None,
        }
    }
}

/// Everything needed to build one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub source: String,
    pub code_location: CodeLocation,
    pub code_language: CodeLanguage,
    pub args: Vec<String>,
    /// DON-wide secrets, readable by every node
    pub secrets: SecretsMap,
    /// One secrets map per node slot
    pub per_node_secrets: Vec<SecretsMap>,
    pub gas_limit: u32,
    pub expected_return_type: ReturnType,
}

/// On-disk shape of a request config; secret values are still untyped.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestConfigFile {
    source: String,
    #[serde(default = "default_location")]
    code_location: CodeLocation,
    #[serde(default = "default_language")]
    code_language: CodeLanguage,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    secrets: Option<serde_json::Value>,
    #[serde(default)]
    per_node_secrets: Vec<serde_json::Value>,
    #[serde(default = "default_gas_limit")]
    gas_limit: u32,
    expected_return_type: ReturnType,
}

fn default_location() -> CodeLocation {
    CodeLocation::Inline
}

fn default_language() -> CodeLanguage {
    CodeLanguage::JavaScript
}

fn default_gas_limit() -> u32 {
    DEFAULT_GAS_LIMIT
}

impl RequestConfig {
    /// Creates an inline JavaScript request with no args or secrets.
    pub fn new(source: impl Into<String>, expected_return_type: ReturnType) -> Self {
        Self {
            source: source.into(),
            code_location: CodeLocation::Inline,
            code_language: CodeLanguage::JavaScript,
            args: Vec::new(),
            secrets: SecretsMap::new(),
            per_node_secrets: Vec::new(),
            gas_limit: DEFAULT_GAS_LIMIT,
            expected_return_type,
        }
    }

    /// Parses a JSON request config.
    ///
    /// Secret values that are not plain strings fail with
    /// `InvalidSecretsFormat`; any other shape problem is `InvalidConfig`.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: RequestConfigFile =
            serde_json::from_str(text).map_err(|e| DonError::InvalidConfig(e.to_string()))?;

        let secrets = match &file.secrets {
            Some(value) => SecretsMap::from_json(value)?,
            None => SecretsMap::new(),
        };
        let per_node_secrets = file
            .per_node_secrets
            .iter()
            .map(SecretsMap::from_json)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            source: file.source,
            code_location: file.code_location,
            code_language: file.code_language,
            args: file.args,
            secrets,
            per_node_secrets,
            gas_limit: file.gas_limit,
            expected_return_type: file.expected_return_type,
        })
    }

    /// Sets the args.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a DON-wide secret.
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name, value);
        self
    }

    /// Sets the per-node secrets, one map per slot.
    pub fn with_per_node_secrets(mut self, per_node: Vec<SecretsMap>) -> Self {
        self.per_node_secrets = per_node;
        self
    }

    /// Gives every one of `node_count` slots an empty per-node map.
    pub fn with_empty_node_secrets(mut self, node_count: usize) -> Self {
        self.per_node_secrets = vec![SecretsMap::new(); node_count];
        self
    }

    /// Sets the callback gas limit.
    pub fn with_gas_limit(mut self, gas_limit: u32) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    /// Sets the code location.
    pub fn with_code_location(mut self, location: CodeLocation) -> Self {
        self.code_location = location;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const CONFIG: &str = r#"{
        "codeLocation": "inline",
        "codeLanguage": "javascript",
        "source": "return Functions.encodeUint256(1)",
        "args": ["David", "40000"],
        "secrets": { "googleMapsApiKey": "maps-key" },
        "perNodeSecrets": [{ "apiKey": "a" }, { "apiKey": "b" }],
        "gasLimit": 250000,
        "expectedReturnType": "int256"
    }"#;

    #[test]
    fn test_from_json() {
        let config = RequestConfig::from_json(CONFIG).unwrap();

        assert_eq!(config.code_location, CodeLocation::Inline);
        assert_eq!(config.args, vec!["David", "40000"]);
        assert_eq!(config.secrets.get("googleMapsApiKey"), Some("maps-key"));
        assert_eq!(config.per_node_secrets.len(), 2);
        assert_eq!(config.per_node_secrets[1].get("apiKey"), Some("b"));
        assert_eq!(config.gas_limit, 250_000);
        assert_eq!(config.expected_return_type, ReturnType::Int256);
    }

    #[test]
    fn test_defaults_applied() {
        let config = RequestConfig::from_json(
            r#"{"source": "x", "expectedReturnType": "Buffer"}"#,
        )
        .unwrap();

        assert_eq!(config.code_language, CodeLanguage::JavaScript);
        assert_eq!(config.gas_limit, DEFAULT_GAS_LIMIT);
        assert!(config.secrets.is_empty());
        assert_eq!(config.expected_return_type, ReturnType::Bytes);
    }

    #[test]
    fn test_nested_secret_rejected() {
        let err = RequestConfig::from_json(
            r#"{"source": "x", "expectedReturnType": "uint",
                "secrets": {"apiKey": {"nested": "no"}}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSecretsFormat);
    }

    #[test]
    fn test_unset_node_secret_rejected() {
        let err = RequestConfig::from_json(
            r#"{"source": "x", "expectedReturnType": "uint",
                "perNodeSecrets": [{"apiKey": null}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSecretsFormat);
    }

    #[test]
    fn test_unknown_return_type_is_config_error() {
        let err = RequestConfig::from_json(r#"{"source": "x", "expectedReturnType": "float"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}

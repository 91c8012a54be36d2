use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Version of the configuration and response format.
pub const VERSION: &str = "1.0";

/// Path of the health route, which answers any method with an empty `200 OK`.
pub const HEALTH_PATH: &str = "/health";

/// Name of the form field carrying the shared secret.
pub const TOKEN_FIELD: &str = "token";

/// Tokens shorter than this many characters are rejected when loading.
pub const MIN_TOKEN_LEN: usize = 20;

/// The whole configuration file, endpoint path to spec.
pub type ConfigFile = BTreeMap<String, EndpointSpec>;

/// Describes what a single endpoint runs.
///
/// # Serialized Example
/// ```
/// # let ser = r#"
/// {
///     "commands": ["git -C /srv/%s pull", "systemctl restart %s"],
///     "token": "12345678901234567890",
///     "args": ["repo", "service"],
///     "async": true
/// }
/// # "#;
/// # let deser: rusty_webhook_api::api::EndpointSpec
/// #    = serde_json::from_str(ser).expect("failed parsing");
/// # assert_eq!(deser.commands.len(), 2);
/// # assert!(deser.asynchronous);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Command templates, run in order through the platform shell.
    ///
    /// Each `%s` is replaced by the next value of [`Self::args`], `%%` is a literal `%`.
    /// Also accepted as `cmds` or `cmd`, and as a single string instead of a list.
    #[serde(
        default,
        alias = "cmds",
        alias = "cmd",
        deserialize_with = "one_or_many"
    )]
    pub commands: Vec<String>,
    /// Shared secret, compared exactly against the `token` form field.
    ///
    /// A missing token decodes as empty and is then rejected as too short.
    #[serde(default)]
    pub token: String,
    /// Names of the form fields filled into the templates, in marker order.
    #[serde(default)]
    pub args: Vec<String>,
    /// Run the commands detached from the request and answer immediately.
    #[serde(rename = "async", default)]
    pub asynchronous: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(command) => vec![command],
        OneOrMany::Many(commands) => commands,
    })
}

/// The json body of every error response.
///
/// # Serialized Example
/// ```
/// # let ser = r#"
/// { "error": "Missing argument: name" }
/// # "#;
/// # let deser: rusty_webhook_api::api::ErrorResponse
/// #    = serde_json::from_str(ser).expect("failed parsing");
/// # assert_eq!(deser.error, "Missing argument: name");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let spec: EndpointSpec =
            serde_json::from_str(r#"{"commands": ["true"], "token": "12345678901234567890"}"#)
                .expect("valid spec");
        assert!(spec.args.is_empty());
        assert!(!spec.asynchronous);
    }

    #[test]
    fn command_aliases() {
        for key in ["commands", "cmds", "cmd"] {
            let json = format!(r#"{{"{key}": ["echo a", "echo b"], "token": "x"}}"#);
            let spec: EndpointSpec = serde_json::from_str(&json).expect("valid spec");
            assert_eq!(spec.commands, ["echo a", "echo b"], "key {key}");
        }
    }

    #[test]
    fn single_command_string() {
        let spec: EndpointSpec =
            serde_json::from_str(r#"{"cmd": "echo %s", "token": "x", "args": ["name"]}"#)
                .expect("valid spec");
        assert_eq!(spec.commands, ["echo %s"]);
    }

    #[test]
    fn missing_commands_decode_empty() {
        let spec: EndpointSpec = serde_json::from_str(r#"{"token": "x"}"#).expect("valid spec");
        assert!(spec.commands.is_empty());
    }

    #[test]
    fn missing_token_decodes_empty() {
        let spec: EndpointSpec = serde_json::from_str(r#"{"cmd": "true"}"#).expect("valid spec");
        assert!(spec.token.is_empty());
    }

    #[test]
    fn args_keep_order() {
        let spec: EndpointSpec =
            serde_json::from_str(r#"{"cmd": "x", "token": "x", "args": ["z", "a", "m"]}"#)
                .expect("valid spec");
        assert_eq!(spec.args, ["z", "a", "m"]);
    }

    #[test]
    fn error_body() {
        let body = serde_json::to_string(&ErrorResponse::new("Missing argument: name"))
            .expect("serializable");
        assert_eq!(body, r#"{"error":"Missing argument: name"}"#);
    }
}

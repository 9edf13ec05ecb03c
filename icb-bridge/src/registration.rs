//! Application-service registration for the home server.
//!
//! `--genyaml` prints this document; the home server admin adds it to the
//! server's list of application services.

use crate::config::{BridgeConfig, DEFAULT_USER_PREFIX};

/// Default localpart of the bridge's sender user.
pub const DEFAULT_SENDER_LOCALPART: &str = "icb";

/// Errors from building the registration document.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// A required key is absent or empty.
    #[error("missing required config key `{0}`")]
    Missing(&'static str),

    /// `bridge.url` is not a valid URL.
    #[error("invalid bridge.url `{url}`: {source}")]
    InvalidUrl {
        /// The configured value.
        url: String,
        /// Parse failure.
        source: url::ParseError,
    },
}

/// Renders the registration YAML from the bridge config.
///
/// # Errors
///
/// Returns [`RegistrationError`] if `bridge.id`, `bridge.url`,
/// `bridge.as_token` or `bridge.hs_token` is missing, or the URL does not
/// parse.
pub fn render(config: &BridgeConfig) -> Result<String, RegistrationError> {
    let id = required(config, "bridge.id")?;
    let raw_url = required(config, "bridge.url")?;
    let url = url::Url::parse(raw_url).map_err(|source| RegistrationError::InvalidUrl {
        url: raw_url.to_string(),
        source,
    })?;
    let as_token = required(config, "bridge.as_token")?;
    let hs_token = required(config, "bridge.hs_token")?;
    let localpart = config.get_or("bridge.sender_localpart", DEFAULT_SENDER_LOCALPART);
    let prefix = config.get_or("bridge.user_prefix", DEFAULT_USER_PREFIX);

    // Url normalises a bare origin to end in '/'.
    let url = url.as_str().trim_end_matches('/');

    Ok(format!(
        "id: {id}\n\
         url: {url}\n\
         as_token: {as_token}\n\
         hs_token: {hs_token}\n\
         sender_localpart: {localpart}\n\
         rate_limited: false\n\
         namespaces:\n  \
           users:\n    \
             - exclusive: true\n      \
               regex: {regex}\n  \
           aliases: []\n  \
           rooms: []\n",
        id = double_quoted(id),
        url = double_quoted(url),
        as_token = double_quoted(as_token),
        hs_token = double_quoted(hs_token),
        localpart = double_quoted(localpart),
        regex = single_quoted(&format!("{}.*", regex_escape(prefix))),
    ))
}

fn required<'a>(config: &'a BridgeConfig, key: &'static str) -> Result<&'a str, RegistrationError> {
    match config.get(key) {
        "" => Err(RegistrationError::Missing(key)),
        value => Ok(value),
    }
}

fn regex_escape(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn double_quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn single_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

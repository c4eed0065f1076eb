//! Environment sanitization for delegated CLI agents.

use std::collections::BTreeMap;

/// Variables passed through to a delegated agent process.
///
/// API keys are deliberately absent: the CLIs authenticate on their own and
/// anything in the environment is readable by the model through `env`.
pub(crate) const KEEP_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "TMPDIR",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "XDG_CACHE_HOME",
    "DOCKER_HOST",
    "DOCKER_TLS_VERIFY",
    "DOCKER_CERT_PATH",
];

/// Keeps only allow-listed variables.
pub(crate) fn sanitized_env<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| KEEP_KEYS.contains(&key.as_str()))
        .collect()
}

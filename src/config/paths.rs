use regex::Regex;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{ExpError, Result};

fn env_token() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"\$\{(\w+)\}").expect("static regex"))
}

/// Expand `${VAR}` references, `~` and make the path absolute.
///
/// Only the braced form is accepted; a bare `$VAR` or a variable that is not
/// set leaves a `$` behind and fails with [`ExpError::EnvVar`].
pub fn resolve_path(raw: &str) -> Result<PathBuf> {
    let mut path = raw.to_string();
    if path.contains('$') {
        if !env_token().is_match(&path) {
            return Err(ExpError::EnvVar(format!(
                "wrong specification for env variable in '{raw}', use ${{VAR}}"
            )));
        }
        path = env_token()
            .replace_all(&path, |caps: &regex::Captures<'_>| {
                env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
            })
            .into_owned();
    }
    if path.contains('$') {
        return Err(ExpError::EnvVar(format!(
            "invalid path '{path}', empty env variable"
        )));
    }

    let expanded = expand_home(&path);
    Ok(std::path::absolute(&expanded)?)
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), env::var_os("HOME")) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            Path::new(&home).join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(path),
    }
}

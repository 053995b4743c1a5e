//! Loading the parameter and proxy lists the run draws from.

use std::path::Path;

use rand::seq::SliceRandom;

use crate::error::SetupError;
use crate::proxy::Proxy;

/// Read a list file, failing if it cannot be opened.
fn read_list(path: &Path) -> Result<String, SetupError> {
    std::fs::read_to_string(path).map_err(|source| SetupError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse query fragments, one per line. Blank lines are skipped.
pub fn parse_parameter_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse proxy addresses, one per line. Blank lines and `#` comments are skipped.
pub fn parse_proxy_list(content: &str) -> Vec<Proxy> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || !line.contains(':') {
                None
            } else {
                Some(Proxy::new(line))
            }
        })
        .collect()
}

/// Load and shuffle the parameter list.
pub fn load_parameters(path: &Path) -> Result<Vec<String>, SetupError> {
    let mut parameters = parse_parameter_list(&read_list(path)?);
    if parameters.is_empty() {
        return Err(SetupError::EmptyList {
            kind: "parameters",
            path: path.to_path_buf(),
        });
    }
    parameters.shuffle(&mut rand::rng());
    Ok(parameters)
}

/// Load and shuffle the candidate proxy list.
pub fn load_proxies(path: &Path) -> Result<Vec<Proxy>, SetupError> {
    let mut proxies = parse_proxy_list(&read_list(path)?);
    if proxies.is_empty() {
        return Err(SetupError::EmptyList {
            kind: "proxies",
            path: path.to_path_buf(),
        });
    }
    proxies.shuffle(&mut rand::rng());
    Ok(proxies)
}

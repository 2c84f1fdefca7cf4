pub mod logging;

use anyhow::{Context, Result};
use std::path::PathBuf;
use url::Url;
use which::which;

/// Finds a database client tool in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).with_context(|| {
        format!(
            "{} executable not found in PATH. Please ensure the database client tools are installed and in your PATH.",
            name
        )
    })
}

/// Masks the password of a connection URI so it can be logged.
pub fn redact_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut parsed) if parsed.password().is_some() => {
            // Only fails for cannot-be-a-base URLs, which carry no password.
            let _ = parsed.set_password(Some("****"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable uri>".to_string(),
    }
}

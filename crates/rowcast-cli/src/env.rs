use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

/// The dotenv file name for an environment: `.env` or `.env.{ENV}`.
fn dotenv_name(env: Option<&str>) -> String {
    match env {
        Some(env) => format!(".env.{env}"),
        None => ".env".to_string(),
    }
}

/// Find the nearest dotenv file, searching from `start` up to the filesystem root.
fn find_dotenv(start: &Path, name: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

/// Load `.env` (or `.env.{ENV}`) from the current directory or any parent.
///
/// A missing `.env` is fine since every setting can come from the real
/// environment. A missing `.env.{ENV}` is an error: the operator asked for it.
pub fn load_dotenv(env: Option<&str>) -> Result<Option<PathBuf>> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let name = dotenv_name(env);

    let Some(path) = find_dotenv(&cwd, &name) else {
        if env.is_some() {
            anyhow::bail!(
                "No {name} file found.\n\n\
                Searched from {} to filesystem root.",
                cwd.display()
            );
        }
        return Ok(None);
    };

    dotenvy::from_path(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    info!("Loaded {}", path.display());
    Ok(Some(path))
}

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const APP_HOME_DIR: &str = ".tubetimeout";

/// Resolve (and create on first use) the per-user app directory and return
/// the full path for the given config file name.
pub fn config_file_path(file_name: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("failed to get home directory")?;
    let app_dir = home.join(APP_HOME_DIR);
    fs::create_dir_all(&app_dir)
        .with_context(|| format!("failed to create app directory {}", app_dir.display()))?;
    Ok(app_dir.join(file_name))
}

/// Write `<path>.tmp`, fsync, rename to `<path>`. Every persisted file goes
/// through here so a crash mid-write never leaves a torn file behind.
pub fn safe_write_via_temp(path: &Path, data: &str) -> Result<()> {
    let temp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });

    {
        use std::io::Write;
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("failed to create temp file {}", temp_path.display()))?;
        file.write_all(data.as_bytes()).context("failed to write data")?;
        file.sync_all().context("failed to sync temp file")?;
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("failed to rename temp file to {}", path.display()))?;

    Ok(())
}

/// Read a YAML config file. A missing file is expected: an empty file is
/// created and the caller's fresh default is returned. A malformed file is
/// surfaced with its path and never rewritten.
pub fn load_yaml<T: DeserializeOwned>(path: &Path, new_instance: impl FnOnce() -> T) -> Result<T> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            safe_write_via_temp(path, "")
                .with_context(|| format!("failed to create config file {}", path.display()))?;
            return Ok(new_instance());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config file {}", path.display()))
        }
    };

    if data.trim().is_empty() {
        return Ok(new_instance());
    }

    serde_yaml::from_str(&data)
        .with_context(|| format!("error unmarshalling config {}", path.display()))
}

pub fn save_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_yaml::to_string(value).context("error marshalling config")?;
    safe_write_via_temp(path, &data)
}

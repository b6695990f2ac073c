use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

const CACHE_DIR: &str = "matchup_ensemble";

/// Directory holding learned state: `ENSEMBLE_STATE_DIR`, else the XDG cache.
pub fn state_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("ENSEMBLE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return Some(PathBuf::from(dir));
        }
    }
    if let Ok(base) = std::env::var("XDG_CACHE_HOME") {
        if !base.trim().is_empty() {
            return Some(PathBuf::from(base).join(CACHE_DIR));
        }
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(CACHE_DIR))
}

pub fn state_path(file: &str) -> Option<PathBuf> {
    state_dir().map(|dir| dir.join(file))
}

/// Writes through a sibling temp file and renames it into place.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create state dir {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value).context("serialize state")?;
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("swap {}", path.display()))?;
    Ok(())
}

/// `Ok(None)` when the file does not exist yet.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value = serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("matchup_ensemble_persist_{}_{name}", std::process::id()))
            .join("state.json")
    }

    #[test]
    fn save_then_load_leaves_no_temp_file() {
        let path = scratch("roundtrip");
        let mut value = BTreeMap::new();
        value.insert("Elo Rating".to_string(), 0.4);
        save_json(&path, &value).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        let back: Option<BTreeMap<String, f64>> = load_json(&path).unwrap();
        assert_eq!(back, Some(value));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_file_is_none_and_garbage_is_error() {
        let path = scratch("missing");
        assert!(load_json::<Vec<f64>>(&path).unwrap().is_none());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        assert!(load_json::<Vec<f64>>(&path).is_err());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}

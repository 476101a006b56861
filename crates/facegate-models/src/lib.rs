use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the checksum manifest kept next to the model files.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Model file descriptor: expected filename and human-readable size.
pub struct ModelFile {
    pub name: &'static str,
    pub size_display: &'static str,
}

impl ModelFile {
    /// Upstream download URL for this file.
    pub fn url(&self) -> String {
        format!("{WEIGHTS_BASE}/{}", self.name)
    }
}

const WEIGHTS_BASE: &str =
    "https://raw.githubusercontent.com/justadudewhohacks/face-api.js/master/weights";

// Tiny face detector plus the tiny 68-point landmark net, as loaded by the
// browser client from `/models`.
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: "tiny_face_detector_model-weights_manifest.json",
        size_display: "3 KB",
    },
    ModelFile {
        name: "tiny_face_detector_model-shard1",
        size_display: "189 KB",
    },
    ModelFile {
        name: "face_landmark_68_tiny_model-weights_manifest.json",
        size_display: "4 KB",
    },
    ModelFile {
        name: "face_landmark_68_tiny_model-shard1",
        size_display: "75 KB",
    },
];

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: String, path: PathBuf },

    #[error("model manifest not found: {path}")]
    MissingManifest { path: PathBuf },

    #[error("model {name} is not listed in {path}")]
    UnlistedModel { name: &'static str, path: PathBuf },

    #[error("invalid model manifest {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write model manifest: {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// One `[[model]]` entry of `manifest.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub sha256: String,
}

/// Determine the model directory shared by `facegate setup` and `facegated`.
///
/// `FACEGATE_MODEL_DIR` wins. Otherwise root (UID 0) uses
/// `/var/lib/facegate/models` and everyone else
/// `$XDG_DATA_HOME/facegate/models` (~/.local/share/facegate/models).
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACEGATE_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    if is_root() {
        PathBuf::from("/var/lib/facegate/models")
    } else {
        user_data_dir().join("models")
    }
}

/// `$XDG_DATA_HOME/facegate`, falling back to `~/.local/share/facegate`.
pub fn user_data_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.local/share")
    });
    PathBuf::from(data_home).join("facegate")
}

fn is_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}

/// Checksums recorded for the files in a model directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "model", default)]
    pub models: Vec<ManifestEntry>,
}

impl Manifest {
    /// Read `manifest.toml` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ModelIntegrityError> {
        let path = model_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(ModelIntegrityError::MissingManifest { path });
        }
        let text = fs::read_to_string(&path).map_err(|source| ModelIntegrityError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ModelIntegrityError::InvalidManifest {
            path,
            reason: e.to_string(),
        })
    }

    /// Write the manifest to `model_dir/manifest.toml`, replacing any existing one.
    pub fn save(&self, model_dir: &Path) -> Result<(), ModelIntegrityError> {
        let path = model_dir.join(MANIFEST_FILE);
        let text = toml::to_string_pretty(self).map_err(|e| {
            ModelIntegrityError::InvalidManifest {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        fs::write(&path, text).map_err(|source| ModelIntegrityError::Write { path, source })
    }

    pub fn entry(&self, name: &str) -> Option<&ManifestEntry> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Insert or replace the checksum recorded for `name`.
    pub fn record(&mut self, name: &str, sha256: String) {
        match self.models.iter_mut().find(|m| m.name == name) {
            Some(entry) => entry.sha256 = sha256,
            None => self.models.push(ManifestEntry {
                name: name.to_string(),
                sha256,
            }),
        }
    }
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_file_sha256(
    name: &str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if !digest.eq_ignore_ascii_case(expected_sha256) {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: name.to_string(),
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

/// Check every required model file against the directory's manifest.
pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    let manifest = Manifest::load(model_dir)?;
    for model in MODELS {
        let entry = manifest
            .entry(model.name)
            .ok_or_else(|| ModelIntegrityError::UnlistedModel {
                name: model.name,
                path: model_dir.join(MANIFEST_FILE),
            })?;
        let path = model_dir.join(model.name);
        verify_file_sha256(model.name, &path, &entry.sha256)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_all_models(dir: &Path) -> Manifest {
        let mut manifest = Manifest::default();
        for (i, model) in MODELS.iter().enumerate() {
            let path = dir.join(model.name);
            fs::write(&path, format!("weights-{i}")).unwrap();
            manifest.record(model.name, sha256_file_hex(&path).unwrap());
        }
        manifest.save(dir).unwrap();
        manifest
    }

    #[test]
    fn verify_file_sha256_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope-shard1");

        let err = verify_file_sha256("nope-shard1", &path, "00").unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { .. }));
    }

    #[test]
    fn verify_file_sha256_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model-shard1");
        fs::write(&path, b"hello").unwrap();

        let err = verify_file_sha256("model-shard1", &path, "00").unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));
    }

    #[test]
    fn verify_file_sha256_accepts_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model-shard1");
        fs::write(&path, b"hello").unwrap();

        // sha256("hello")
        assert_eq!(
            sha256_file_hex(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let digest = sha256_file_hex(&path).unwrap().to_uppercase();
        verify_file_sha256("model-shard1", &path, &digest).unwrap();
    }

    #[test]
    fn verify_models_dir_requires_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_models_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingManifest { .. }));
    }

    #[test]
    fn verify_models_dir_accepts_complete_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_all_models(dir.path());
        verify_models_dir(dir.path()).unwrap();
    }

    #[test]
    fn verify_models_dir_reports_unlisted_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = write_all_models(dir.path());
        manifest.models.retain(|m| m.name != MODELS[1].name);
        manifest.save(dir.path()).unwrap();

        let err = verify_models_dir(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            ModelIntegrityError::UnlistedModel { name, .. } if name == MODELS[1].name
        ));
    }

    #[test]
    fn verify_models_dir_reports_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        write_all_models(dir.path());
        fs::write(dir.path().join(MODELS[3].name), b"tampered").unwrap();

        let err = verify_models_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));
    }

    #[test]
    fn manifest_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "[[model]]\nname = 3\n").unwrap();
        let err = Manifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::InvalidManifest { .. }));
    }

    #[test]
    fn record_replaces_existing_entry() {
        let mut manifest = Manifest::default();
        manifest.record("a", "11".into());
        manifest.record("a", "22".into());
        assert_eq!(manifest.models.len(), 1);
        assert_eq!(manifest.entry("a").unwrap().sha256, "22");
    }

    #[test]
    fn model_dir_env_override_wins() {
        std::env::set_var("FACEGATE_MODEL_DIR", "/srv/facegate/weights");
        let dir = default_model_dir();
        std::env::remove_var("FACEGATE_MODEL_DIR");
        assert_eq!(dir, PathBuf::from("/srv/facegate/weights"));

        let fallback = default_model_dir();
        assert!(fallback.ends_with("facegate/models"));
    }
}

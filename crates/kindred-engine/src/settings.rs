use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Engine configuration.
///
/// Loaded from an optional TOML file with `KINDRED_*` environment
/// overrides, then threaded explicitly through pipeline and service calls.
/// Matching and grouping never read ambient global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Similarity at or above which a face is assigned without user
    /// confirmation. User-adjustable; such boxes stay one-tap removable.
    pub auto_accept_threshold: f32,
    /// Matching threshold for suggestion lists.
    pub suggest_threshold: f32,
    pub suggest_top_k: usize,
    /// Bonus for people already confirmed present in the session.
    pub boost_bonus: f32,
    /// Photos further apart than this start a new candidate encounter.
    /// What counts as one gathering is product policy, hence configurable.
    pub group_gap_minutes: i64,
    /// With GPS on both photos, a jump beyond this also splits groups.
    pub group_radius_meters: f64,
    /// Default per-run photo limit for library scans.
    pub scan_batch_limit: usize,
    /// Locate-face probe side, as a fraction of the shorter image
    /// dimension (before zoom correction).
    pub locate_crop_fraction: f32,
    pub db_path: PathBuf,
    /// Directory containing the ArcFace ONNX model.
    pub model_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("kindred");

        Self {
            auto_accept_threshold: 0.85,
            suggest_threshold: 0.5,
            suggest_top_k: 5,
            boost_bonus: 0.05,
            group_gap_minutes: 180,
            group_radius_meters: 500.0,
            scan_batch_limit: 50,
            locate_crop_fraction: 0.30,
            db_path: data_dir.join("kindred.db"),
            model_dir: data_dir.join("models"),
        }
    }
}

impl Settings {
    /// Load settings: defaults, overlaid by the TOML file (when present),
    /// overlaid by `KINDRED_*` environment variables.
    pub fn load(path: Option<&Path>) -> Self {
        let mut settings = match path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => match toml::from_str::<Settings>(&text) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "bad settings file, using defaults");
                        Settings::default()
                    }
                },
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "no settings file");
                    Settings::default()
                }
            },
            None => Settings::default(),
        };
        settings.apply_env();
        settings
    }

    fn apply_env(&mut self) {
        self.auto_accept_threshold =
            env_f32("KINDRED_AUTO_ACCEPT_THRESHOLD", self.auto_accept_threshold);
        self.suggest_threshold = env_f32("KINDRED_SUGGEST_THRESHOLD", self.suggest_threshold);
        self.suggest_top_k = env_usize("KINDRED_SUGGEST_TOP_K", self.suggest_top_k);
        self.boost_bonus = env_f32("KINDRED_BOOST_BONUS", self.boost_bonus);
        self.group_gap_minutes = env_i64("KINDRED_GROUP_GAP_MINUTES", self.group_gap_minutes);
        self.group_radius_meters = env_f64("KINDRED_GROUP_RADIUS_METERS", self.group_radius_meters);
        self.scan_batch_limit = env_usize("KINDRED_SCAN_BATCH_LIMIT", self.scan_batch_limit);
        self.locate_crop_fraction =
            env_f32("KINDRED_LOCATE_CROP_FRACTION", self.locate_crop_fraction);
        if let Ok(path) = std::env::var("KINDRED_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("KINDRED_MODEL_DIR") {
            self.model_dir = PathBuf::from(path);
        }
    }

    /// Path to the ArcFace embedding model.
    pub fn embed_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn group_gap(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.group_gap_minutes)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// registry.rs
//! Source-root registry backed by the JSON data file.
//!
//! Every tracked repository has one [`SourceRootManifest`], keyed by the exact
//! `(owner, name)` pair GitHub reports. Unknown repositories can be provisioned
//! on first sight when [`SourceRootOptions::create_by_request`] is on and the
//! owner is allow-listed. The allow-list check ignores ASCII case; the
//! identity lookup does not.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("data file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("data file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Shape of the persisted data file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_time: Option<u64>,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub source_roots: Vec<SourceRootManifest>,
    #[serde(default)]
    pub source_root_options: SourceRootOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordConfig {
    pub token: String,
    #[serde(default)]
    pub owner_ids: Vec<u64>,
    #[serde(default)]
    pub broadcast_channel_id: u64,
}

/// One tracked repository mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRootManifest {
    pub abs_path: String,
    pub github: GithubSource,
    /// Epoch milliseconds of the last applied push. Never moves backwards.
    #[serde(default)]
    pub last_updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubSource {
    /// Empty means signature verification is disabled for this repository.
    #[serde(default)]
    pub secret: String,
    pub repo_name: String,
    pub repo_owner: String,
    #[serde(default)]
    pub filter: String,
}

impl SourceRootManifest {
    fn matches(&self, owner: &str, repo: &str) -> bool {
        self.github.repo_owner == owner && self.github.repo_name == repo
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRootOptions {
    #[serde(default)]
    pub create_by_request: bool,
    #[serde(default)]
    pub dynamic_create_repo_owners: Vec<String>,
    #[serde(default = "default_created_source_root")]
    pub created_source_root: String,
}

impl Default for SourceRootOptions {
    fn default() -> Self {
        Self {
            create_by_request: false,
            dynamic_create_repo_owners: Vec::new(),
            created_source_root: default_created_source_root(),
        }
    }
}

fn default_created_source_root() -> String {
    "~/".to_string()
}

impl SourceRootOptions {
    fn allows_owner(&self, owner: &str) -> bool {
        self.dynamic_create_repo_owners
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(owner))
    }

    fn path_for(&self, owner: &str, repo: &str) -> String {
        format!("{}{}/{}", self.created_source_root, owner, repo)
    }
}

/// Result of [`SourceRegistry::resolve_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The repository was already tracked.
    Existing(String),
    /// A manifest was created by this call; the caller should persist.
    Provisioned(String),
}

impl Resolution {
    pub fn path(&self) -> &str {
        match self {
            Resolution::Existing(path) | Resolution::Provisioned(path) => path,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        matches!(self, Resolution::Provisioned(_))
    }
}

/// In-memory registry of source roots, written back to `path` on demand.
///
/// All reads and the check-then-create in [`resolve_path`](Self::resolve_path)
/// go through one lock, so concurrent first sightings of the same repository
/// produce a single manifest.
#[derive(Debug)]
pub struct SourceRegistry {
    path: PathBuf,
    state: RwLock<ConfigFile>,
    save_lock: tokio::sync::Mutex<()>,
}

impl SourceRegistry {
    pub fn new(path: impl Into<PathBuf>, file: ConfigFile) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(file),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reads and parses the data file at `path`.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let raw = tokio::fs::read_to_string(&path).await?;
        let file: ConfigFile = serde_json::from_str(&raw)?;
        info!(
            path = %path.display(),
            source_roots = file.source_roots.len(),
            "Loaded data file"
        );
        Ok(Self::new(path, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, ConfigFile> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConfigFile> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn port(&self) -> u16 {
        self.read().port.unwrap_or(DEFAULT_PORT)
    }

    pub fn backup_time(&self) -> Option<u64> {
        self.read().backup_time
    }

    pub fn discord_bot_token(&self) -> String {
        self.read().discord.token.clone()
    }

    pub fn broadcast_channel_id(&self) -> u64 {
        self.read().discord.broadcast_channel_id
    }

    pub fn is_user_owner(&self, id: u64) -> bool {
        self.read().discord.owner_ids.contains(&id)
    }

    /// Finds the source root path for a repository, provisioning one if policy allows.
    ///
    /// Provisioned manifests get an empty secret and the path
    /// `createdSourceRoot + owner/repo`. Returns `None` when the repository is
    /// unknown and either dynamic creation is off or the owner isn't allow-listed.
    pub fn resolve_path(&self, owner: &str, repo: &str) -> Option<Resolution> {
        {
            let state = self.read();
            if let Some(manifest) = state.source_roots.iter().find(|m| m.matches(owner, repo)) {
                return Some(Resolution::Existing(manifest.abs_path.clone()));
            }
            if !state.source_root_options.create_by_request {
                return None;
            }
        }

        let mut state = self.write();
        // Re-check under the write lock; another request may have provisioned it meanwhile.
        if let Some(manifest) = state.source_roots.iter().find(|m| m.matches(owner, repo)) {
            return Some(Resolution::Existing(manifest.abs_path.clone()));
        }

        let options = &state.source_root_options;
        if !options.create_by_request || !options.allows_owner(owner) {
            debug!(owner, repo, "Owner not allowed to create source roots");
            return None;
        }

        let path = options.path_for(owner, repo);
        state.source_roots.push(SourceRootManifest {
            abs_path: path.clone(),
            github: GithubSource {
                secret: String::new(),
                repo_name: repo.to_string(),
                repo_owner: owner.to_string(),
                filter: String::new(),
            },
            last_updated_at: 0,
        });
        info!(owner, repo, path = %path, "Provisioned source root");

        Some(Resolution::Provisioned(path))
    }

    /// Looks up a manifest by exact `(owner, repo)`. Never provisions.
    pub fn resolve_manifest(&self, owner: &str, repo: &str) -> Option<SourceRootManifest> {
        self.read()
            .source_roots
            .iter()
            .find(|m| m.matches(owner, repo))
            .cloned()
    }

    /// Builds a fresh manifest without registering it.
    ///
    /// With `with_secret`, the secret is a random v4 UUID (122 random bits).
    pub fn create_manifest(&self, owner: &str, repo: &str, with_secret: bool) -> SourceRootManifest {
        let secret = if with_secret {
            uuid::Uuid::new_v4().to_string()
        } else {
            String::new()
        };

        SourceRootManifest {
            abs_path: self.read().source_root_options.path_for(owner, repo),
            github: GithubSource {
                secret,
                repo_name: repo.to_string(),
                repo_owner: owner.to_string(),
                filter: String::new(),
            },
            last_updated_at: 0,
        }
    }

    pub fn exists(&self, owner: &str, repo: &str) -> bool {
        self.resolve_manifest(owner, repo).is_some()
    }

    /// Advances `lastUpdatedAt` to `at` unless it is already later.
    ///
    /// Returns `false` if the repository isn't tracked.
    pub fn mark_updated(&self, owner: &str, repo: &str, at: i64) -> bool {
        let mut state = self.write();
        match state.source_roots.iter_mut().find(|m| m.matches(owner, repo)) {
            Some(manifest) => {
                manifest.last_updated_at = manifest.last_updated_at.max(at);
                true
            }
            None => false,
        }
    }

    /// Copy of the whole data file as currently held in memory.
    pub fn snapshot(&self) -> ConfigFile {
        self.read().clone()
    }

    /// Writes the data file, returning the number of bytes written.
    ///
    /// The file is replaced through a sibling temp file so readers never see a partial write.
    pub async fn save(&self) -> Result<usize, RegistryError> {
        let _guard = self.save_lock.lock().await;
        let encoded = serde_json::to_vec_pretty(&self.snapshot())?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &encoded).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), bytes = encoded.len(), "Saved data file");
        Ok(encoded.len())
    }

    /// Saves the data file, logging failures instead of returning them.
    pub async fn persist(&self) {
        if let Err(e) = self.save().await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist data file");
        }
    }
}

//! Persistent profile registry.
//!
//! This module provides a thread-safe store for imported VPN profiles. The
//! registry persists to JSON at `<data_dir>/profiles.json` and keeps profiles
//! in import order. Imported files are referenced in place unless
//! `copy_on_import` is set, in which case the configuration and the key
//! material it references are copied under `<data_dir>/profiles/<id>/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Context;
use protocol::{now_ms, ErrorKind, Profile, ProfileId, VpnError, REGISTRY_VERSION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

/// Directives that mark a file as an OpenVPN client configuration.
const KNOWN_DIRECTIVES: &[&str] = &[
    "client",
    "remote",
    "dev",
    "dev-type",
    "proto",
    "port",
    "ca",
    "cert",
    "key",
    "pkcs12",
    "tls-auth",
    "tls-crypt",
    "tls-client",
    "auth-user-pass",
    "pull",
    "nobind",
    "persist-key",
    "persist-tun",
    "cipher",
    "data-ciphers",
    "auth",
    "remote-cert-tls",
    "resolv-retry",
    "redirect-gateway",
    "route",
    "ifconfig",
    "secret",
    "key-direction",
    "compress",
    "comp-lzo",
    "verb",
    "<ca>",
    "<cert>",
    "<key>",
    "<tls-auth>",
    "<tls-crypt>",
    "<connection>",
];

/// Directives whose first argument names a file that belongs to the profile.
const FILE_DIRECTIVES: &[&str] = &["ca", "cert", "key", "tls-auth", "tls-crypt", "pkcs12"];

/// Errors returned by profile operations.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("invalid profile format: {path}: {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("profile not found: {0}")]
    NotFound(ProfileId),

    #[error("profile storage error: {0}")]
    Storage(String),
}

impl ProfileError {
    /// Returns the machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProfileError::InvalidFormat { .. } => ErrorKind::InvalidProfileFormat,
            ProfileError::NotFound(_) => ErrorKind::ProfileNotFound,
            ProfileError::Storage(_) => ErrorKind::Storage,
        }
    }

    fn invalid(path: &Path, reason: impl Into<String>) -> Self {
        ProfileError::InvalidFormat {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn storage(err: anyhow::Error) -> Self {
        ProfileError::Storage(format!("{:#}", err))
    }
}

impl From<ProfileError> for VpnError {
    fn from(err: ProfileError) -> Self {
        match err {
            ProfileError::InvalidFormat { .. } => VpnError::InvalidProfileFormat(err.to_string()),
            ProfileError::NotFound(profile_id) => VpnError::ProfileNotFound { profile_id },
            ProfileError::Storage(message) => VpnError::Storage(message),
        }
    }
}

/// Registry entry as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredProfile {
    #[serde(flatten)]
    profile: Profile,
    /// Original location of a copied profile, used to detect re-imports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_path: Option<PathBuf>,
}

impl StoredProfile {
    fn imported_from(&self) -> &Path {
        self.source_path
            .as_deref()
            .unwrap_or(self.profile.config_path.as_path())
    }
}

/// Wrapper for serializing the registry.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryData {
    /// Version of the registry format.
    version: u32,
    /// Profiles in import order.
    profiles: Vec<StoredProfile>,
}

/// Thread-safe registry of imported profiles.
///
/// Mutations hold the write lock for the whole operation, including the
/// registry write, so concurrent imports and removals are serialized.
pub struct ProfileStore {
    /// The path to the JSON registry.
    path: PathBuf,
    /// Where copied profiles live.
    profiles_dir: PathBuf,
    /// Whether imports copy files instead of referencing them.
    copy_on_import: bool,
    /// Profiles in import order.
    profiles: RwLock<Vec<StoredProfile>>,
}

impl ProfileStore {
    /// Creates a store persisting to `path`.
    ///
    /// This does not load the file; call `load()` to read existing data.
    pub fn new<P: AsRef<Path>>(path: P, profiles_dir: P, copy_on_import: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            profiles_dir: profiles_dir.as_ref().to_path_buf(),
            copy_on_import,
            profiles: RwLock::new(Vec::new()),
        }
    }

    /// Creates a store from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.registry_path(),
            config.profiles_dir(),
            config.profiles.copy_on_import,
        )
    }

    /// Returns the path to the registry file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the registry from disk.
    ///
    /// A missing file leaves the store empty.
    pub fn load(&self) -> Result<(), ProfileError> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "Profile registry not found, starting empty");
            return Ok(());
        }

        let data = read_registry(&self.path).map_err(ProfileError::storage)?;
        if data.version != REGISTRY_VERSION {
            return Err(ProfileError::Storage(format!(
                "unsupported registry version {} in {}",
                data.version,
                self.path.display()
            )));
        }

        let mut profiles = self.write()?;
        *profiles = data.profiles;

        tracing::info!(
            count = profiles.len(),
            path = %self.path.display(),
            "Loaded profile registry"
        );
        Ok(())
    }

    /// Imports the configuration at `path`.
    ///
    /// Re-importing a file that is already registered returns the existing
    /// profile.
    pub fn import<P: AsRef<Path>>(&self, path: P) -> Result<Profile, ProfileError> {
        let path = path.as_ref();
        let source = fs::canonicalize(path)
            .map_err(|e| ProfileError::invalid(path, format!("cannot read file: {}", e)))?;
        let contents = read_config(&source)?;
        validate_config(&source, &contents)?;

        let mut profiles = self.write()?;

        if let Some(existing) = profiles.iter().find(|p| p.imported_from() == source) {
            tracing::debug!(
                profile_id = %existing.profile.id,
                path = %source.display(),
                "Profile already imported"
            );
            return Ok(existing.profile.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        let display_name = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.clone());

        let (config_path, source_path) = if self.copy_on_import {
            let copied = self
                .copy_profile(&id, &source, &contents)
                .map_err(ProfileError::storage)?;
            (copied, Some(source.clone()))
        } else {
            (source.clone(), None)
        };

        let stored = StoredProfile {
            profile: Profile {
                id: id.clone(),
                display_name,
                config_path,
                imported_at: now_ms(),
            },
            source_path,
        };
        profiles.push(stored.clone());

        if let Err(e) = self.save_locked(&profiles) {
            profiles.pop();
            if stored.source_path.is_some() {
                let _ = fs::remove_dir_all(self.profiles_dir.join(&id));
            }
            return Err(e);
        }

        tracing::info!(
            profile_id = %id,
            name = %stored.profile.display_name,
            path = %stored.profile.config_path.display(),
            copied = stored.source_path.is_some(),
            "Imported profile"
        );
        Ok(stored.profile)
    }

    /// Lists profiles in import order.
    pub fn list(&self) -> Result<Vec<Profile>, ProfileError> {
        Ok(self.read()?.iter().map(|p| p.profile.clone()).collect())
    }

    /// Gets a profile by id.
    pub fn get(&self, id: &str) -> Result<Option<Profile>, ProfileError> {
        Ok(self
            .read()?
            .iter()
            .find(|p| p.profile.id == id)
            .map(|p| p.profile.clone()))
    }

    /// Removes a profile and, if it was copied, its files.
    pub fn remove(&self, id: &str) -> Result<Profile, ProfileError> {
        let mut profiles = self.write()?;
        let index = profiles
            .iter()
            .position(|p| p.profile.id == id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;

        let removed = profiles.remove(index);
        if let Err(e) = self.save_locked(&profiles) {
            profiles.insert(index, removed);
            return Err(e);
        }

        if removed.source_path.is_some() {
            let dir = self.profiles_dir.join(&removed.profile.id);
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!(
                    profile_id = %id,
                    dir = %dir.display(),
                    error = %e,
                    "Failed to delete copied profile files"
                );
            }
        }

        tracing::info!(profile_id = %id, name = %removed.profile.display_name, "Removed profile");
        Ok(removed.profile)
    }

    /// Returns the number of registered profiles.
    pub fn len(&self) -> Result<usize, ProfileError> {
        Ok(self.read()?.len())
    }

    /// Returns true if no profile is registered.
    pub fn is_empty(&self) -> Result<bool, ProfileError> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<StoredProfile>>, ProfileError> {
        self.profiles
            .read()
            .map_err(|_| ProfileError::Storage("profile registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<StoredProfile>>, ProfileError> {
        self.profiles
            .write()
            .map_err(|_| ProfileError::Storage("profile registry lock poisoned".to_string()))
    }

    fn save_locked(&self, profiles: &[StoredProfile]) -> Result<(), ProfileError> {
        write_registry(&self.path, profiles).map_err(ProfileError::storage)
    }

    /// Copies the configuration and the files it references into the
    /// profile's own directory, rewriting references to the copies.
    fn copy_profile(&self, id: &str, source: &Path, contents: &str) -> anyhow::Result<PathBuf> {
        let dir = self.profiles_dir.join(id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create profile directory: {}", dir.display()))?;

        let base = source.parent().unwrap_or_else(|| Path::new("/"));
        let mut rewritten = String::with_capacity(contents.len());

        for line in contents.lines() {
            match referenced_file(line) {
                Some((directive, reference, rest)) => {
                    let referenced = base.join(reference);
                    match referenced.file_name() {
                        Some(name) if referenced.is_file() => {
                            let target = dir.join(name);
                            fs::copy(&referenced, &target).with_context(|| {
                                format!("Failed to copy {}", referenced.display())
                            })?;
                            rewritten.push_str(directive);
                            rewritten.push(' ');
                            rewritten.push_str(&target.to_string_lossy());
                            for arg in rest {
                                rewritten.push(' ');
                                rewritten.push_str(arg);
                            }
                        }
                        _ => {
                            tracing::warn!(
                                file = %referenced.display(),
                                "Referenced file not found, keeping directive unchanged"
                            );
                            rewritten.push_str(line);
                        }
                    }
                }
                None => rewritten.push_str(line),
            }
            rewritten.push('\n');
        }

        let file_name = source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "profile.ovpn".into());
        let target = dir.join(file_name);
        fs::write(&target, rewritten)
            .with_context(|| format!("Failed to write {}", target.display()))?;

        Ok(target)
    }
}

/// Reads a configuration file, decoding invalid UTF-8 lossily.
fn read_config(path: &Path) -> Result<String, ProfileError> {
    let bytes = fs::read(path)
        .map_err(|e| ProfileError::invalid(path, format!("cannot read file: {}", e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Checks that the text looks like an OpenVPN configuration.
fn validate_config(path: &Path, contents: &str) -> Result<(), ProfileError> {
    if contents.trim().is_empty() {
        return Err(ProfileError::invalid(path, "file is empty"));
    }

    let recognized = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with(';'))
        .filter_map(|l| l.split_whitespace().next())
        .any(|token| KNOWN_DIRECTIVES.contains(&token.to_ascii_lowercase().as_str()));

    if recognized {
        Ok(())
    } else {
        Err(ProfileError::invalid(
            path,
            "no recognizable configuration directives",
        ))
    }
}

/// Splits a file-referencing directive into the directive, the file and the
/// remaining arguments. Inline files (`[inline]`) are not references.
fn referenced_file(line: &str) -> Option<(&str, &str, Vec<&str>)> {
    let mut tokens = line.split_whitespace();
    let directive = tokens.next()?;
    if !FILE_DIRECTIVES.contains(&directive) {
        return None;
    }
    let reference = tokens.next()?.trim_matches(|c| c == '"' || c == '\'');
    if reference.is_empty() || reference == "[inline]" {
        return None;
    }
    Some((directive, reference, tokens.collect()))
}

fn read_registry(path: &Path) -> anyhow::Result<RegistryData> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile registry: {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse profile registry: {}", path.display()))
}

/// Writes the registry atomically (temp file, then rename).
fn write_registry(path: &Path, profiles: &[StoredProfile]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create registry directory: {}", parent.display())
        })?;
    }

    let data = RegistryData {
        version: REGISTRY_VERSION,
        profiles: profiles.to_vec(),
    };
    let contents =
        serde_json::to_string_pretty(&data).context("Failed to serialize profile registry")?;

    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &contents)
        .with_context(|| format!("Failed to write temp registry: {}", temp_path.display()))?;
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename temp registry {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    tracing::debug!(count = profiles.len(), path = %path.display(), "Saved profile registry");
    Ok(())
}

//! Model registry: discovers `.gguf` files under the models directory and
//! resolves user-facing names to descriptors.
//!
//! The active catalog is an immutable snapshot behind an `Arc`. `reload`
//! builds a fresh catalog and swaps the pointer, so readers either see the
//! old set or the new one, never a mix.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use llama_runtime::ModelParams;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const MODEL_EXTENSION: &str = "gguf";

//  Types

/// Per-model parameter overrides (`model_settings` in the config file).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_gpu_layers: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<u32>,
}

impl ModelOverrides {
    fn apply(&self, base: &ModelParams) -> ModelParams {
        ModelParams {
            ctx_size: self.ctx_size.unwrap_or(base.ctx_size),
            n_gpu_layers: self.n_gpu_layers.unwrap_or(base.n_gpu_layers),
            n_threads: self.n_threads.unwrap_or(base.n_threads),
            use_mmap: base.use_mmap,
        }
    }
}

/// Everything the registry needs to (re)build its catalog.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub models_dir: PathBuf,
    pub defaults: ModelParams,
    pub overrides: HashMap<String, ModelOverrides>,
    pub default_model: Option<String>,
}

impl RegistryConfig {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            defaults: ModelParams::default(),
            overrides: HashMap::new(),
            default_model: None,
        }
    }
}

/// One discoverable model. Never mutated after a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    /// Display name (file stem, original case).
    pub name: String,
    /// Lookup key (lowercase, no extension).
    pub key: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub params: ModelParams,
    /// All parts of a split model, first part first. Single files list themselves.
    pub split_parts: Vec<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Cannot read models directory '{dir}': {source}")]
    Unreadable {
        dir: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub total: usize,
    pub added: usize,
    pub removed: usize,
}

/// An immutable catalog snapshot.
#[derive(Debug, Default)]
pub struct Catalog {
    descriptors: Vec<Arc<ModelDescriptor>>,
    by_key: HashMap<String, usize>,
}

impl Catalog {
    fn build(descriptors: Vec<ModelDescriptor>) -> Self {
        let descriptors: Vec<Arc<ModelDescriptor>> =
            descriptors.into_iter().map(Arc::new).collect();
        let by_key = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.key.clone(), i))
            .collect();
        Self {
            descriptors,
            by_key,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.by_key
            .get(&model_key(name))
            .map(|&i| self.descriptors[i].clone())
    }

    pub fn descriptors(&self) -> &[Arc<ModelDescriptor>] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Normalise a user-supplied model name into a lookup key:
/// case-insensitive, `.gguf` suffix optional.
pub fn model_key(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".gguf") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

//  Registry

pub struct ModelRegistry {
    config: RegistryConfig,
    catalog: RwLock<Arc<Catalog>>,
}

impl ModelRegistry {
    /// Scan once and build the registry. A scan failure here is fatal.
    pub fn open(config: RegistryConfig) -> Result<Self, DiscoveryError> {
        let descriptors = scan(&config.models_dir, &config.defaults, &config.overrides)?;
        info!(
            dir = %config.models_dir.display(),
            count = descriptors.len(),
            "Model registry ready"
        );
        Ok(Self {
            catalog: RwLock::new(Arc::new(Catalog::build(descriptors))),
            config,
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.config.models_dir
    }

    /// Current catalog snapshot.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.snapshot().get(name)
    }

    pub fn descriptors(&self) -> Vec<Arc<ModelDescriptor>> {
        self.snapshot().descriptors().to_vec()
    }

    /// Configured default model, else the first discovered one.
    pub fn default_model(&self) -> Option<String> {
        match &self.config.default_model {
            Some(name) => Some(model_key(name)),
            None => self.snapshot().descriptors().first().map(|d| d.key.clone()),
        }
    }

    /// Re-scan the directory and atomically replace the catalog.
    ///
    /// On failure the previous catalog stays active.
    pub fn reload(&self) -> Result<ReloadSummary, DiscoveryError> {
        let descriptors = scan(
            &self.config.models_dir,
            &self.config.defaults,
            &self.config.overrides,
        )?;
        let fresh = Arc::new(Catalog::build(descriptors));

        let mut guard = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        let added = fresh
            .by_key
            .keys()
            .filter(|k| !guard.by_key.contains_key(*k))
            .count();
        let removed = guard
            .by_key
            .keys()
            .filter(|k| !fresh.by_key.contains_key(*k))
            .count();
        let summary = ReloadSummary {
            total: fresh.len(),
            added,
            removed,
        };
        *guard = fresh;
        drop(guard);

        info!(
            total = summary.total,
            added = summary.added,
            removed = summary.removed,
            "Model registry reloaded"
        );
        Ok(summary)
    }
}

//  Directory scan

/// Discover GGUF models under `dir` (recursively).
///
/// Returns an empty list for a directory with no models; fails only if `dir`
/// itself cannot be read. When two files map to the same key (e.g. they
/// differ only in case), the lexicographically first path wins.
pub fn scan(
    dir: &Path,
    defaults: &ModelParams,
    overrides: &HashMap<String, ModelOverrides>,
) -> Result<Vec<ModelDescriptor>, DiscoveryError> {
    let mut files = Vec::new();
    walk_dir(dir, &mut files).map_err(|source| DiscoveryError::Unreadable {
        dir: dir.display().to_string(),
        source,
    })?;
    files.sort();

    let overrides: HashMap<String, &ModelOverrides> =
        overrides.iter().map(|(k, v)| (model_key(k), v)).collect();

    let mut entries: Vec<ModelDescriptor> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut split_bases: HashMap<String, usize> = HashMap::new();

    for path in files {
        let stem = path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();

        // mmproj companions are not standalone models.
        if stem.contains("-mmproj-") || stem.contains("_mmproj_") {
            continue;
        }

        let split_base = detect_split_base(&stem);
        if let Some(base) = &split_base
            && let Some(&idx) = split_bases.get(&model_key(base))
        {
            entries[idx].split_parts.push(path);
            continue;
        }

        let is_split = split_base.is_some();
        let name = split_base.unwrap_or(stem);
        let key = model_key(&name);
        if let Some(&idx) = seen.get(&key) {
            warn!(
                key,
                kept = %entries[idx].path.display(),
                shadowed = %path.display(),
                "Ambiguous model name; keeping first match"
            );
            continue;
        }

        let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let params = overrides
            .get(&key)
            .map_or_else(|| defaults.clone(), |o| o.apply(defaults));

        debug!(key, path = %path.display(), "Discovered model");
        let idx = entries.len();
        if is_split {
            split_bases.insert(key.clone(), idx);
        }
        seen.insert(key.clone(), idx);
        entries.push(ModelDescriptor {
            name,
            key,
            split_parts: vec![path.clone()],
            path,
            file_size,
            params,
        });
    }

    Ok(entries)
}

fn walk_dir(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if let Err(e) = walk_dir(&path, out) {
                warn!(dir = %path.display(), "Skipping unreadable subdirectory: {e}");
            }
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(MODEL_EXTENSION))
        {
            out.push(path);
        }
    }
    Ok(())
}

/// `<base>-NNNNN-of-NNNNN` → `<base>`.
fn detect_split_base(stem: &str) -> Option<String> {
    let parts: Vec<&str> = stem.rsplitn(4, '-').collect();
    if parts.len() == 4
        && !parts[0].is_empty()
        && parts[0].chars().all(|c| c.is_ascii_digit())
        && parts[1] == "of"
        && !parts[2].is_empty()
        && parts[2].chars().all(|c| c.is_ascii_digit())
    {
        Some(parts[3].to_string())
    } else {
        None
    }
}

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::fields::MetadataField;

pub const CACHE_FILENAME: &str = "astmetad-metadata.json";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("{0} cannot be cached")]
    NotCacheable(MetadataField),

    #[error("unable to write metadata cache {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Small JSON file of sticky attributes that survive restarts.
#[derive(Debug)]
pub struct MetadataCache {
    path: PathBuf,
    permitted: &'static [MetadataField],
    data: BTreeMap<String, String>,
}

impl MetadataCache {
    /// Load the cache, creating it if missing.
    ///
    /// Unparseable contents are discarded and keys outside `permitted` are dropped.
    pub fn load(path: impl Into<PathBuf>, permitted: &'static [MetadataField]) -> Self {
        let path = path.into();
        let raw = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Discarding invalid metadata cache {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Creating metadata cache at {}", path.display());
                BTreeMap::new()
            }
            Err(e) => {
                warn!("Unable to read metadata cache {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        let data = raw
            .into_iter()
            .filter(|(key, _)| {
                let allowed = key
                    .parse::<MetadataField>()
                    .map(|field| permitted.contains(&field))
                    .unwrap_or(false);
                if !allowed {
                    warn!("Dropping {} from metadata cache", key);
                }
                allowed
            })
            .collect();

        let cache = Self {
            path,
            permitted,
            data,
        };
        if let Err(e) = cache.write() {
            warn!("{}", e);
        }
        cache
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// Set or clear a cached attribute. The file is rewritten only when something changed.
    pub fn update_cached_attr(
        &mut self,
        field: MetadataField,
        value: Option<String>,
    ) -> Result<(), CacheError> {
        if !self.permitted.contains(&field) {
            return Err(CacheError::NotCacheable(field));
        }

        let key = field.as_str().to_string();
        let changed = match value {
            Some(value) => self.data.insert(key, value.clone()).as_ref() != Some(&value),
            None => self.data.remove(&key).is_some(),
        };

        if changed {
            debug!("Cached {} changed", field);
            self.write()?;
        }
        Ok(())
    }

    fn write(&self) -> Result<(), CacheError> {
        let to_error = |source| CacheError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(to_error)?;
        }
        let content = serde_json::to_string_pretty(&self.data)
            .map_err(|e| to_error(std::io::Error::other(e)))?;
        fs::write(&self.path, content).map_err(to_error)
    }
}

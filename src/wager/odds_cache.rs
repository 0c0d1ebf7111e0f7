//! In-memory reference odds, keyed by match ID.
//!
//! Reference odds come from outside the board (bookmakers, manual input) and
//! are the ground truth for value calculations. The cache can be backed by a
//! JSON file of the shape `{"<match_id>": {"<option text>": 1.85, ...}}` so
//! entries survive restarts and can be edited by hand.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::db::models::ReferenceOdds;

/// Thread-safe reference odds cache with optional file persistence.
#[derive(Clone)]
pub struct OddsCache {
    inner: Arc<RwLock<HashMap<String, ReferenceOdds>>>,
    path: Option<PathBuf>,
}

impl OddsCache {
    pub fn new() -> Self {
        OddsCache {
            inner: Arc::new(RwLock::new(HashMap::new())),
            path: None,
        }
    }

    /// Cache persisted to (and loaded from) the given JSON file.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        OddsCache {
            inner: Arc::new(RwLock::new(HashMap::new())),
            path: Some(path.into()),
        }
    }

    /// Replace the cache contents with the backing file.
    /// A missing file is an empty cache, not an error.
    pub async fn load_file(&self) -> Result<usize> {
        let Some(path) = self.path.as_deref() else {
            return Ok(0);
        };
        let loaded = match tokio::fs::read_to_string(path).await {
            Ok(raw) => parse_odds_file(&raw)
                .with_context(|| format!("Invalid odds file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No reference odds file at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let n = loaded.len();
        *self.inner.write().await = loaded;
        debug!("OddsCache: loaded {} matches from {}", n, path.display());
        Ok(n)
    }

    /// Write the cache contents to the backing file (no-op without one).
    pub async fn save_file(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let body = {
            let inner = self.inner.read().await;
            serde_json::to_string_pretty(&*inner)?
        };
        write_atomically(path, &body).await
    }

    /// Reference odds for a match; empty when nothing is known.
    pub async fn fetch_reference_odds(&self, match_id: &str) -> ReferenceOdds {
        self.inner
            .read()
            .await
            .get(match_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Insert or replace the reference odds of one match.
    /// Unusable prices (≤ 1.0 or non-finite) are dropped.
    pub async fn upsert(&self, match_id: &str, odds: ReferenceOdds) -> usize {
        let cleaned = sanitize(odds);
        let n = cleaned.len();
        self.inner.write().await.insert(match_id.to_string(), cleaned);
        n
    }

    pub async fn remove(&self, match_id: &str) -> bool {
        self.inner.write().await.remove(match_id).is_some()
    }

    /// Number of matches with reference odds.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for OddsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up the reference price for an option by its display text.
///
/// Exact text first, then a trimmed case-insensitive match, since reference
/// sources rarely copy the board's labels verbatim.
pub fn reference_for(odds: &ReferenceOdds, text: &str) -> Option<f64> {
    if let Some(v) = odds.get(text) {
        return Some(*v);
    }
    let wanted = text.trim().to_lowercase();
    odds.iter()
        .find(|(k, _)| k.trim().to_lowercase() == wanted)
        .map(|(_, v)| *v)
}

fn sanitize(odds: ReferenceOdds) -> ReferenceOdds {
    odds.into_iter()
        .filter(|(text, v)| {
            let ok = v.is_finite() && *v > 1.0;
            if !ok {
                warn!("Ignoring unusable reference odds {} for '{}'", v, text);
            }
            ok
        })
        .collect()
}

fn parse_odds_file(raw: &str) -> Result<HashMap<String, ReferenceOdds>> {
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let parsed: HashMap<String, ReferenceOdds> = serde_json::from_str(raw)?;
    Ok(parsed
        .into_iter()
        .map(|(id, odds)| (id, sanitize(odds)))
        .collect())
}

async fn write_atomically(path: &Path, body: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

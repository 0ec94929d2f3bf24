//! Business Glossary
//!
//! Declared mappings from business vocabulary to schema fragments. Lookup
//! is exact first, then fuzzy (Jaro-Winkler over sliding windows, so it
//! works for unsegmented CJK text as well as space-separated words).
//!
//! The persisted document is `{"entries": [...]}`. [`GlossaryStore`] keeps
//! the current snapshot behind an `Arc` and swaps it when the file's
//! modification time changes; readers holding an older snapshot are never
//! affected mid-turn.

use crate::error::{ChatBiError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use strsim::jaro_winkler;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum Jaro-Winkler similarity for a fuzzy hit.
pub const FUZZY_THRESHOLD: f64 = 0.88;
/// Shorter forms are matched exactly only.
const MIN_FUZZY_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    /// `target_value` is `Cube.measure`, or raw SQL with `metadata.cube`.
    Measure,
    /// `target_value` is `Cube.dimension`.
    Dimension,
    /// `target_value` is a canonical value; `metadata.cube` and
    /// `metadata.dimension` say where it lives.
    #[serde(alias = "value", alias = "status_value", alias = "place")]
    DimensionValue,
    /// `target_value` is a relative time name such as `last_month`.
    #[serde(alias = "time")]
    TimeRange,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub id: String,
    pub term: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub mapping_type: MappingType,
    pub target_value: String,
    #[serde(default)]
    pub metadata: Value,
}

impl GlossaryEntry {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    fn surface_forms(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.term.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .filter(|f| !f.trim().is_empty())
    }
}

/// Char-index span `[start, end)` over the lowercased question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlossaryMatch {
    pub entry: GlossaryEntry,
    pub matched_text: String,
    pub span: Span,
    pub score: f64,
    pub exact: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessGlossary {
    pub entries: Vec<GlossaryEntry>,
}

impl BusinessGlossary {
    pub fn from_json(text: &str) -> Result<Self> {
        let glossary: BusinessGlossary = serde_json::from_str(text)?;
        Ok(glossary)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Non-overlapping matches, longest exact forms first, then fuzzy
    /// matches over the remaining text. Sorted by position.
    pub fn lookup(&self, question: &str) -> Vec<GlossaryMatch> {
        let chars: Vec<char> = question.to_lowercase().chars().collect();
        let mut candidates: Vec<GlossaryMatch> = Vec::new();

        for entry in &self.entries {
            for form in entry.surface_forms() {
                let needle: Vec<char> = form.to_lowercase().chars().collect();
                for start in find_all(&chars, &needle) {
                    candidates.push(GlossaryMatch {
                        entry: entry.clone(),
                        matched_text: needle.iter().collect(),
                        span: Span {
                            start,
                            end: start + needle.len(),
                        },
                        score: 1.0,
                        exact: true,
                    });
                }
            }
        }
        candidates.sort_by(|a, b| b.span.len().cmp(&a.span.len()).then(a.span.start.cmp(&b.span.start)));
        let mut accepted = take_non_overlapping(candidates, &[]);

        let mut fuzzy = Vec::new();
        for entry in &self.entries {
            for form in entry.surface_forms() {
                let needle: String = form.to_lowercase();
                let width = needle.chars().count();
                if width < MIN_FUZZY_CHARS || width > chars.len() {
                    continue;
                }
                let best = (0..=chars.len() - width)
                    .map(|start| {
                        let window: String = chars[start..start + width].iter().collect();
                        (start, jaro_winkler(&window, &needle), window)
                    })
                    .filter(|(_, score, _)| *score >= FUZZY_THRESHOLD && *score < 1.0)
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                if let Some((start, score, window)) = best {
                    fuzzy.push(GlossaryMatch {
                        entry: entry.clone(),
                        matched_text: window,
                        span: Span {
                            start,
                            end: start + width,
                        },
                        score,
                        exact: false,
                    });
                }
            }
        }
        fuzzy.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let spans: Vec<Span> = accepted.iter().map(|m| m.span).collect();
        let fuzzy = take_non_overlapping(fuzzy, &spans);
        if !fuzzy.is_empty() {
            debug!("Glossary fuzzy matches: {:?}", fuzzy.iter().map(|m| &m.matched_text).collect::<Vec<_>>());
        }
        accepted.extend(fuzzy);
        accepted.sort_by_key(|m| m.span.start);
        accepted
    }
}

fn find_all(haystack: &[char], needle: &[char]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    (0..=haystack.len() - needle.len())
        .filter(|&i| haystack[i..i + needle.len()] == *needle)
        .collect()
}

fn take_non_overlapping(candidates: Vec<GlossaryMatch>, taken: &[Span]) -> Vec<GlossaryMatch> {
    let mut spans: Vec<Span> = taken.to_vec();
    let mut out = Vec::new();
    for candidate in candidates {
        if spans.iter().any(|s| s.overlaps(&candidate.span)) {
            continue;
        }
        spans.push(candidate.span);
        out.push(candidate);
    }
    out
}

/// Hot-reloadable glossary file.
pub struct GlossaryStore {
    path: PathBuf,
    current: RwLock<Arc<BusinessGlossary>>,
    modified: Mutex<Option<SystemTime>>,
}

impl GlossaryStore {
    /// Load `path`. A missing file yields an empty glossary that is picked
    /// up once the file appears.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (glossary, modified) = if path.exists() {
            let modified = mtime(&path)?;
            (read_glossary(&path)?, Some(modified))
        } else {
            warn!("Glossary {} not found, starting empty", path.display());
            (BusinessGlossary::default(), None)
        };
        info!("Glossary loaded from {} ({} entries)", path.display(), glossary.entries.len());
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(glossary)),
            modified: Mutex::new(modified),
        })
    }

    /// Fixed glossary with no backing file, never reloaded.
    pub fn in_memory(glossary: BusinessGlossary) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(glossary)),
            modified: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The glossary as of now. Later reloads do not affect the returned value.
    pub fn snapshot(&self) -> Arc<BusinessGlossary> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-read the file if its modification time moved. Returns whether a
    /// new snapshot was installed. A file that fails to parse keeps the
    /// previous snapshot in place.
    pub fn reload_if_changed(&self) -> Result<bool> {
        if self.path.as_os_str().is_empty() || !self.path.exists() {
            return Ok(false);
        }
        let modified = mtime(&self.path)?;
        let mut last = self
            .modified
            .lock()
            .map_err(|_| ChatBiError::Semantic("glossary state lock poisoned".to_string()))?;
        if *last == Some(modified) {
            return Ok(false);
        }

        let glossary = read_glossary(&self.path)?;
        let count = glossary.entries.len();
        {
            let mut current = self
                .current
                .write()
                .map_err(|_| ChatBiError::Semantic("glossary lock poisoned".to_string()))?;
            *current = Arc::new(glossary);
        }
        *last = Some(modified);
        info!("Glossary reloaded from {} ({} entries)", self.path.display(), count);
        Ok(true)
    }

    /// Poll the file every `interval` until `cancel` fires.
    pub fn spawn_watcher(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Glossary watcher for {} stopped", self.path.display());
                        break;
                    }
                    _ = ticker.tick() => {
                        let store = Arc::clone(&self);
                        match tokio::task::spawn_blocking(move || store.reload_if_changed()).await {
                            Ok(Err(e)) => warn!("Glossary reload failed for {}: {}", self.path.display(), e),
                            Err(e) => warn!("Glossary reload task failed for {}: {}", self.path.display(), e),
                            Ok(Ok(_)) => {}
                        }
                    }
                }
            }
        })
    }
}

fn mtime(path: &Path) -> Result<SystemTime> {
    Ok(std::fs::metadata(path)?.modified()?)
}

fn read_glossary(path: &Path) -> Result<BusinessGlossary> {
    let text = std::fs::read_to_string(path)?;
    BusinessGlossary::from_json(&text)
        .map_err(|e| ChatBiError::Semantic(format!("Invalid glossary {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn glossary() -> BusinessGlossary {
        serde_json::from_value(json!({
            "entries": [
                {"id": "g1", "term": "总收入", "aliases": ["总营收", "total revenue"],
                 "mapping_type": "measure", "target_value": "Orders.total_revenue"},
                {"id": "g2", "term": "销售部", "aliases": ["销售"],
                 "mapping_type": "value", "target_value": "销售部",
                 "metadata": {"cube": "Employees", "dimension": "department"}},
                {"id": "g3", "term": "上个月", "mapping_type": "time", "target_value": "last_month"},
                {"id": "g4", "term": "weird", "mapping_type": "something_new", "target_value": "x"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_exact_matches_prefer_longest_form() {
        let matches = glossary().lookup("销售部上个月的总收入");
        let ids: Vec<&str> = matches.iter().map(|m| m.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["g2", "g3", "g1"]);
        assert_eq!(matches[0].matched_text, "销售部");
        assert_eq!(matches[0].span, Span { start: 0, end: 3 });
        assert!(matches.iter().all(|m| m.exact));
        assert_eq!(matches[2].entry.mapping_type, MappingType::Measure);
    }

    #[test]
    fn test_fuzzy_match_on_typo() {
        let matches = glossary().lookup("show me total revenu by month");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entry.id, "g1");
        assert!(!matches[0].exact);
        assert!(matches[0].score >= FUZZY_THRESHOLD);
    }

    #[test]
    fn test_unknown_mapping_type_is_tolerated() {
        assert_eq!(glossary().entries[3].mapping_type, MappingType::Other);
    }

    #[test]
    fn test_store_swaps_snapshot_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glossary.json");
        std::fs::write(&path, r#"{"entries": []}"#).unwrap();

        let store = GlossaryStore::open(&path).unwrap();
        let before = store.snapshot();
        assert!(before.is_empty());
        assert!(!store.reload_if_changed().unwrap());

        std::fs::write(
            &path,
            r#"{"entries": [{"id": "a", "term": "GMV", "mapping_type": "measure", "target_value": "Orders.gmv"}]}"#,
        )
        .unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(later).unwrap();

        assert!(store.reload_if_changed().unwrap());
        assert!(before.is_empty(), "old snapshot must stay untouched");
        assert_eq!(store.snapshot().entries.len(), 1);
    }

    #[test]
    fn test_bad_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glossary.json");
        std::fs::write(
            &path,
            r#"{"entries": [{"id": "a", "term": "GMV", "mapping_type": "measure", "target_value": "Orders.gmv"}]}"#,
        )
        .unwrap();
        let store = GlossaryStore::open(&path).unwrap();

        std::fs::write(&path, "{ broken").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();

        assert!(store.reload_if_changed().is_err());
        assert_eq!(store.snapshot().entries.len(), 1);
    }
}

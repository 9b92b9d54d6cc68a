use crate::error::{ManifestError, ModelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// A file expected inside an archive model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveMember {
    /// Path relative to the model directory
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// One downloadable model artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    /// Final file name (or directory name for archives) in the models area
    pub filename: String,
    #[serde(default)]
    pub archive: bool,
    pub size_bytes: u64,
    pub sha256: String,
    /// Leading path components dropped from every archive entry
    #[serde(default)]
    pub strip_components: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<ArchiveMember>>,
}

impl ModelEntry {
    /// Archive members, empty for single-file models
    #[must_use]
    pub fn members(&self) -> &[ArchiveMember] {
        self.members.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    models: Vec<ModelEntry>,
}

/// Immutable id -> entry table loaded once at startup
#[derive(Debug, Clone)]
pub struct DigestTable {
    entries: Vec<ModelEntry>,
    index: HashMap<String, usize>,
}

impl DigestTable {
    /// Load and validate the manifest at `path`
    pub fn load(path: &Path) -> std::result::Result<Self, ManifestError> {
        let raw = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_json(&raw)?;
        tracing::info!(
            "Loaded manifest with {} models from {}",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    /// Parse and validate a manifest document
    pub fn from_json(raw: &str) -> std::result::Result<Self, ManifestError> {
        let parsed: ManifestFile = serde_json::from_str(raw)?;
        Self::from_entries(parsed.models)
    }

    /// Build a table from already-parsed entries
    pub fn from_entries(entries: Vec<ModelEntry>) -> std::result::Result<Self, ManifestError> {
        let mut index = HashMap::with_capacity(entries.len());
        let mut filenames: HashMap<String, String> = HashMap::with_capacity(entries.len());
        let mut validated = Vec::with_capacity(entries.len());

        for mut entry in entries {
            validate_entry(&mut entry)?;
            if index.insert(entry.id.clone(), validated.len()).is_some() {
                return Err(ManifestError::DuplicateId(entry.id));
            }
            // Ids sharing a filename would share staging and finished paths
            if let Some(first) = filenames.insert(entry.filename.clone(), entry.id.clone()) {
                return Err(ManifestError::DuplicateFilename {
                    first,
                    second: entry.id,
                    filename: entry.filename,
                });
            }
            validated.push(entry);
        }

        Ok(Self {
            entries: validated,
            index,
        })
    }

    /// Find an entry, with a suggestion on a near miss
    pub fn lookup(&self, id: &str) -> Result<&ModelEntry> {
        self.get(id).ok_or_else(|| ModelError::UnknownModel {
            id: id.to_string(),
            suggestion: self.suggest(id).map(str::to_string),
        })
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Entries in manifest order
    pub fn iter(&self) -> impl Iterator<Item = &ModelEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find closest id using Levenshtein distance
    #[must_use]
    pub fn suggest(&self, id: &str) -> Option<&str> {
        if id.is_empty() {
            return None;
        }

        self.entries
            .iter()
            .map(|m| (m.id.as_str(), levenshtein_distance(id, &m.id)))
            .min_by_key(|(_, dist)| *dist)
            .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
            .map(|(model_id, _)| model_id)
    }
}

fn validate_entry(entry: &mut ModelEntry) -> std::result::Result<(), ManifestError> {
    if entry.id.is_empty() {
        return Err(ManifestError::InvalidField {
            id: entry.id.clone(),
            field: "id",
        });
    }
    if !(entry.url.starts_with("https://") || entry.url.starts_with("http://")) {
        return Err(ManifestError::InvalidField {
            id: entry.id.clone(),
            field: "url",
        });
    }
    if !is_single_component(&entry.filename) {
        return Err(ManifestError::InvalidField {
            id: entry.id.clone(),
            field: "filename",
        });
    }
    if entry.size_bytes == 0 {
        return Err(ManifestError::ZeroSize(entry.id.clone()));
    }
    entry.sha256 = validate_digest(&entry.id, &entry.sha256)?;

    if !entry.archive {
        if entry.members.is_some() {
            return Err(ManifestError::UnexpectedMembers(entry.id.clone()));
        }
        return Ok(());
    }

    let id = entry.id.clone();
    let members = match entry.members.as_mut() {
        Some(members) if !members.is_empty() => members,
        _ => return Err(ManifestError::MissingMembers(id)),
    };

    let mut seen = HashSet::new();
    for member in members.iter_mut() {
        let normalized = normalize_relative_path(Path::new(&member.path))
            .filter(|p| p.as_os_str() == member.path.as_str())
            .ok_or_else(|| ManifestError::InvalidMemberPath {
                id: id.clone(),
                path: member.path.clone(),
            })?;
        if !seen.insert(normalized) {
            return Err(ManifestError::DuplicateMember {
                id,
                path: member.path.clone(),
            });
        }
        member.sha256 = validate_digest(&id, &member.sha256)?;
    }

    Ok(())
}

/// Lowercase a sha256 hex digest after checking its shape
fn validate_digest(id: &str, digest: &str) -> std::result::Result<String, ManifestError> {
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ManifestError::InvalidDigest {
            id: id.to_string(),
            digest: digest.to_string(),
        });
    }

    let lower = digest.to_ascii_lowercase();
    let first = lower.as_bytes()[0];
    if lower.bytes().all(|b| b == first)
        || lower == "deadbeef".repeat(8)
        || lower == "cafebabe".repeat(8)
    {
        return Err(ManifestError::PlaceholderDigest(id.to_string()));
    }

    Ok(lower)
}

fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Normalize a relative path, dropping `.` segments.
///
/// Returns `None` for absolute paths, paths with `..` segments, or paths that
/// normalize to nothing.
#[must_use]
pub fn normalize_relative_path(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(segment) => normalized.push(segment),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if normalized.as_os_str().is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for (i, c1) in s1_chars.iter().enumerate() {
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}

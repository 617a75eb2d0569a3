use crate::error::{Error, Result};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelVocabulary {
    labels: Vec<String>,
}

impl LabelVocabulary {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    // A missing file yields an empty vocabulary; an unparseable one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!(
                "Labels not found at {}; using synthesized class names",
                path.display()
            );
            return Ok(Self::empty());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ResourceLoad(format!("Failed to read labels {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let vocab = if is_json {
            Self::from_json(&contents)
        } else {
            Ok(Self::from_lines(&contents))
        }
        .map_err(|e| Error::ResourceLoad(format!("Invalid labels {}: {e}", path.display())))?;
        if vocab.is_empty() {
            log::warn!("Labels file is empty: {}", path.display());
        } else {
            log::info!("Loaded {} labels from {}", vocab.len(), path.display());
        }
        Ok(vocab)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let labels: Vec<String> = serde_json::from_str(contents)?;
        Ok(Self::new(labels))
    }

    pub fn from_lines(contents: &str) -> Self {
        Self::new(contents.lines().filter_map(normalize_label).collect())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn label_for(&self, index: usize) -> String {
        match self.get(index) {
            Some(label) => label.to_string(),
            None => format!("class_{index}"),
        }
    }
}

/// Strips `12: name` / `12 name` index prefixes and surrounding quotes.
fn normalize_label(line: &str) -> Option<String> {
    let mut label = line.trim();
    if label.is_empty() || label.starts_with('#') {
        return None;
    }
    if let Some((prefix, rest)) = label.split_once(':') {
        if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) {
            label = rest.trim();
        }
    } else {
        let mut parts = label.splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        if !first.is_empty() && first.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
            label = rest.trim();
        }
    }
    label = label.trim_matches('"').trim_matches('\'');
    if label.is_empty() {
        return None;
    }
    Some(label.to_string())
}

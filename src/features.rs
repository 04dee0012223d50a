//! Per-artifact input features and the provider seam that supplies them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One category assigned to an artifact with the assigner's confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySignal {
    pub name: String,
    pub confidence: f64,
}

impl CategorySignal {
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// Coarse file type of the artifact; drives the structural modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Markdown,
    Html,
    StructuredData,
    SourceCode,
    PlainText,
    #[default]
    Unknown,
}

impl FileKind {
    /// Multiplier applied to the structural score.
    pub fn modifier(self) -> f64 {
        match self {
            FileKind::Markdown => 1.10,
            FileKind::Html => 1.05,
            FileKind::StructuredData => 1.05,
            FileKind::SourceCode => 1.0,
            FileKind::PlainText => 0.90,
            FileKind::Unknown => 1.0,
        }
    }

    /// Best-effort mapping from a file extension.
    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "md" | "markdown" | "mdx" => FileKind::Markdown,
            "html" | "htm" | "xhtml" => FileKind::Html,
            "json" | "yaml" | "yml" | "toml" | "xml" | "csv" => FileKind::StructuredData,
            "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "cpp" | "h" => FileKind::SourceCode,
            "txt" | "text" | "log" => FileKind::PlainText,
            _ => FileKind::Unknown,
        }
    }
}

/// Document-shape descriptors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructuralFeatures {
    #[serde(default)]
    pub sections: u32,
    #[serde(default)]
    pub lists: u32,
    #[serde(default)]
    pub code_blocks: u32,
    #[serde(default)]
    pub has_title: bool,
    /// Count of other formatting signals (emphasis, links, tables, ...).
    #[serde(default)]
    pub formatting: u32,
    #[serde(default)]
    pub file_kind: FileKind,
}

/// Raw features of one artifact at one iteration. Immutable per scoring call.
///
/// `observed_at` is the reference "now" for temporal scoring, so the same
/// feature set always scores the same.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default)]
    pub embedding: Option<Vec<f64>>,
    #[serde(default)]
    pub categories: Vec<CategorySignal>,
    #[serde(default)]
    pub structure: Option<StructuralFeatures>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

impl FeatureSet {
    /// A feature set with no signal at all; every dimension scores neutral.
    pub fn empty(observed_at: DateTime<Utc>) -> Self {
        Self {
            embedding: None,
            categories: Vec::new(),
            structure: None,
            created_at: None,
            modified_at: None,
            observed_at,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f64>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_categories(mut self, categories: Vec<CategorySignal>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_structure(mut self, structure: StructuralFeatures) -> Self {
        self.structure = Some(structure);
        self
    }

    pub fn with_timestamps(
        mut self,
        created_at: DateTime<Utc>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_at = Some(created_at);
        self.modified_at = modified_at;
        self
    }
}

/// External collaborator that extracts features for an artifact.
///
/// A failure is treated as "no features" by the engine, never as a fatal error.
#[async_trait::async_trait]
pub trait FeatureProvider: Send + Sync {
    async fn features_for(&self, entity_id: &str) -> Result<FeatureSet>;
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_mapping() {
        assert_eq!(FileKind::from_extension(".MD"), FileKind::Markdown);
        assert_eq!(FileKind::from_extension("yml"), FileKind::StructuredData);
        assert_eq!(FileKind::from_extension("txt"), FileKind::PlainText);
        assert_eq!(FileKind::from_extension("bin"), FileKind::Unknown);
    }

    #[test]
    fn markup_beats_plain_text() {
        assert!(FileKind::Markdown.modifier() > 1.0);
        assert!(FileKind::PlainText.modifier() < 1.0);
    }

    #[test]
    fn deserializes_sparse_json() {
        let fs: FeatureSet = serde_json::from_str(
            r#"{"categories":[{"name":"finance","confidence":0.9}],"observed_at":"2025-09-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(fs.embedding.is_none());
        assert_eq!(fs.categories.len(), 1);
        assert!(fs.structure.is_none());
    }
}

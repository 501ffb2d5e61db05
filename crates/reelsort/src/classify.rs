//! Classification gateway: the seam to whatever service suggests library names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ClassifyError;

/// Per-job knobs forwarded to the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationOptions {
    pub custom_prompt: Option<String>,
    pub include_instructions: bool,
    pub include_filename: bool,
    pub web_search: bool,
    pub metadata_lookup: bool,
}

impl Default for ClassificationOptions {
    fn default() -> Self {
        Self {
            custom_prompt: None,
            include_instructions: true,
            include_filename: true,
            web_search: false,
            metadata_lookup: false,
        }
    }
}

/// One submission: the relative paths of a job or a whole group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationRequest {
    pub inputs: Vec<PathBuf>,
    pub options: ClassificationOptions,
}

/// A classifier's answer for a single input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub original_path: PathBuf,
    /// Library-relative path, possibly with subfolders.
    pub suggested_name: String,
    #[serde(default = "default_confidence")]
    pub confidence: u8,
}

fn default_confidence() -> u8 {
    50
}

/// Blocking call into the external classification service.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn classify(&self, request: &ClassificationRequest) -> Result<Vec<Suggestion>, ClassifyError>;
}

/// Maps results back to the submitted inputs.
///
/// Results for paths that were never submitted are dropped. A missing result
/// for any input fails the whole submission.
pub fn match_results(
    inputs: &[PathBuf],
    results: Vec<Suggestion>,
) -> Result<HashMap<PathBuf, Suggestion>, ClassifyError> {
    let mut matched: HashMap<PathBuf, Suggestion> = HashMap::with_capacity(inputs.len());

    for result in results {
        if inputs.contains(&result.original_path) {
            matched.entry(result.original_path.clone()).or_insert(result);
        } else {
            log::warn!(
                "Dropping classification result for unknown input '{}'",
                result.original_path.display()
            );
        }
    }

    if matched.len() != inputs.len() {
        return Err(ClassifyError::ResultCountMismatch {
            expected: inputs.len(),
            actual: matched.len(),
        });
    }

    Ok(matched)
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    results: Vec<Suggestion>,
}

/// Parses a provider's JSON answer.
///
/// Accepts either a bare array of suggestions or `{"results": [...]}`.
pub fn parse_response(body: &str) -> Result<Vec<Suggestion>, ClassifyError> {
    let trimmed = body.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| ClassifyError::MalformedResponse(e.to_string()));
    }

    serde_json::from_str::<ResponseEnvelope>(trimmed)
        .map(|envelope| envelope.results)
        .map_err(|e| ClassifyError::MalformedResponse(e.to_string()))
}

/// Offline classifier: files every input under `Organized Files/` with an
/// `Organized - ` prefix. Used for dry runs and when no provider is wired in.
#[derive(Debug, Default, Clone)]
pub struct DryRunClassifier;

impl DryRunClassifier {
    pub const FOLDER: &'static str = "Organized Files";

    pub fn suggest(input: &Path) -> Suggestion {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = input
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        Suggestion {
            original_path: input.to_path_buf(),
            suggested_name: format!("{}/Organized - {}{}", Self::FOLDER, stem, ext),
            confidence: 100,
        }
    }
}

impl Classifier for DryRunClassifier {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn classify(&self, request: &ClassificationRequest) -> Result<Vec<Suggestion>, ClassifyError> {
        Ok(request.inputs.iter().map(|p| Self::suggest(p)).collect())
    }
}

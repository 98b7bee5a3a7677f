//! Evaluation dataset loaders.
//!
//! Two inputs: the SQuAD dev-set JSON (question id -> question text and a
//! shared context paragraph) and a newline-delimited manifest mapping audio
//! files to question ids. Context paragraphs are deduplicated behind
//! `Arc<str>` since many questions share one passage.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::ClientError;

#[derive(Debug, Deserialize)]
struct SquadFile {
    data: Vec<SquadArticle>,
}

#[derive(Debug, Deserialize)]
struct SquadArticle {
    paragraphs: Vec<SquadParagraph>,
}

#[derive(Debug, Deserialize)]
struct SquadParagraph {
    context: String,
    qas: Vec<SquadQa>,
}

#[derive(Debug, Deserialize)]
struct SquadQa {
    question: String,
    id: String,
}

/// One line of the questions manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub audio_filepath: String,
    pub id: String,
}

#[derive(Debug, Default)]
pub struct SquadEvalDataset {
    questions: HashMap<String, String>,
    question_contexts: HashMap<String, Arc<str>>,
}

impl SquadEvalDataset {
    pub fn load_from_json(path: &str) -> Result<Self, ClientError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClientError::NotFound(format!("could not open file {path}: {e}")))?;
        Self::parse(&text)
            .map_err(|e| ClientError::Internal(format!("cannot parse squad json {path}: {e}")))
    }

    fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let file: SquadFile = serde_json::from_str(text)?;
        let mut dataset = Self::default();
        for article in file.data {
            for paragraph in article.paragraphs {
                let context: Arc<str> = Arc::from(paragraph.context.as_str());
                for qa in paragraph.qas {
                    dataset.questions.insert(qa.id.clone(), qa.question);
                    dataset
                        .question_contexts
                        .insert(qa.id, Arc::clone(&context));
                }
            }
        }
        Ok(dataset)
    }

    pub fn question(&self, id: &str) -> Result<&str, ClientError> {
        self.questions
            .get(id)
            .map(String::as_str)
            .ok_or_else(|| ClientError::NotFound(format!("question id {id} not found")))
    }

    pub fn question_context(&self, id: &str) -> Result<Arc<str>, ClientError> {
        self.question_contexts
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("question id {id} not found")))
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

#[cfg(test)]
impl SquadEvalDataset {
    pub(crate) fn for_tests(entries: &[(&str, &str, &str)]) -> Self {
        let mut dataset = Self::default();
        for (id, question, context) in entries {
            dataset.questions.insert(id.to_string(), question.to_string());
            dataset
                .question_contexts
                .insert(id.to_string(), Arc::from(*context));
        }
        dataset
    }
}

/// Parse the newline-delimited questions manifest; blank lines are skipped.
pub fn load_question_manifest(path: &str) -> Result<Vec<ManifestEntry>, ClientError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ClientError::NotFound(format!("could not open file {path}: {e}")))?;
    let mut entries = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: ManifestEntry = serde_json::from_str(line)
            .map_err(|e| ClientError::InvalidArg(format!("problem parsing line {line:?}: {e}")))?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SQUAD_JSON: &str = r#"{
        "data": [{
            "title": "t",
            "paragraphs": [{
                "context": "The sky is blue because of Rayleigh scattering.",
                "qas": [
                    {"question": "Why is the sky blue", "id": "q1", "answers": []},
                    {"question": "What scatters light", "id": "q2", "answers": []}
                ]
            }]
        }]
    }"#;

    #[test]
    fn test_questions_share_one_context() {
        let dataset = SquadEvalDataset::parse(SQUAD_JSON).unwrap();
        assert_eq!(dataset.len(), 2);
        let c1 = dataset.question_context("q1").unwrap();
        let c2 = dataset.question_context("q2").unwrap();
        assert!(Arc::ptr_eq(&c1, &c2), "contexts must be deduplicated");
        assert_eq!(dataset.question("q1").unwrap(), "Why is the sky blue");
    }

    #[test]
    fn test_missing_question_id_is_not_found() {
        let dataset = SquadEvalDataset::parse(SQUAD_JSON).unwrap();
        assert!(matches!(
            dataset.question("nope").unwrap_err(),
            ClientError::NotFound(_)
        ));
    }

    #[test]
    fn test_manifest_parses_lines_and_skips_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"audio_filepath": "a.wav", "id": "q1"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"audio_filepath": "b.wav", "id": "q2"}}"#).unwrap();
        file.flush().unwrap();

        let entries = load_question_manifest(file.path().to_str().unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "q1");
        assert_eq!(entries[1].audio_filepath, "b.wav");
    }

    #[test]
    fn test_manifest_missing_file_is_not_found() {
        assert!(matches!(
            load_question_manifest("/no/such/manifest.json").unwrap_err(),
            ClientError::NotFound(_)
        ));
    }
}

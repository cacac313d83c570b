//! Catalog types
//!
//! Read-only subject/topic data the queue snapshots into each job.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// School grade (Klassenstufe 1-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "1")]
    First,
    #[serde(rename = "2")]
    Second,
    #[serde(rename = "3")]
    Third,
    #[serde(rename = "4")]
    Fourth,
}

impl Grade {
    pub fn number(&self) -> u8 {
        match self {
            Grade::First => 1,
            Grade::Second => 2,
            Grade::Third => 3,
            Grade::Fourth => 4,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Grade::First),
            2 => Some(Grade::Second),
            3 => Some(Grade::Third),
            4 => Some(Grade::Fourth),
            _ => None,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// A topic from the content catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: String,
    pub label: String,
    pub grades: Vec<Grade>,
    pub description: String,
    #[serde(default)]
    pub focus: Vec<String>,
    #[serde(default)]
    pub sample_prompts: Vec<String>,
    pub category: String,
}

impl Topic {
    /// Grade to generate for: the preferred grade if the topic covers it,
    /// else the topic's first grade, else third grade.
    pub fn grade_for(&self, preferred: Option<Grade>) -> Grade {
        match preferred {
            Some(grade) if self.grades.contains(&grade) => grade,
            _ => self.grades.first().copied().unwrap_or(Grade::Third),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub label: String,
    pub summary: String,
}

/// A school subject with its categories and topics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub tagline: String,
    #[serde(default)]
    pub description: String,
    pub grades: Vec<Grade>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

/// Read-only view over the subject catalog
pub trait SubjectCatalog: Send + Sync {
    fn subject_title(&self, subject_id: &str) -> Option<String>;
}

/// Catalog held in memory, typically loaded from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticCatalog {
    pub subjects: Vec<Subject>,
}

impl StaticCatalog {
    pub fn new(subjects: Vec<Subject>) -> Self {
        Self { subjects }
    }

    /// Load a catalog from a JSON file containing `{"subjects": [...]}`
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn subject(&self, subject_id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == subject_id)
    }

    pub fn topic(&self, subject_id: &str, topic_id: &str) -> Option<&Topic> {
        self.subject(subject_id)?
            .topics
            .iter()
            .find(|t| t.id == topic_id)
    }

    /// Topics of a subject, optionally filtered to one grade
    pub fn topics_for_grade<'a>(
        &'a self,
        subject_id: &str,
        grade: Option<Grade>,
    ) -> Vec<&'a Topic> {
        let Some(subject) = self.subject(subject_id) else {
            return Vec::new();
        };
        subject
            .topics
            .iter()
            .filter(|t| grade.map_or(true, |g| t.grades.contains(&g)))
            .collect()
    }
}

impl SubjectCatalog for StaticCatalog {
    fn subject_title(&self, subject_id: &str) -> Option<String> {
        self.subject(subject_id).map(|s| s.title.clone())
    }
}

#[cfg(test)]
pub(crate) fn sample_topic(id: &str) -> Topic {
    Topic {
        id: id.to_string(),
        label: format!("Thema {}", id),
        grades: vec![Grade::Second, Grade::Third],
        description: "Silben klatschen und Woerter zerlegen.".to_string(),
        focus: vec!["Lesestart".to_string()],
        sample_prompts: vec!["Erstelle ein Partnerarbeitsblatt.".to_string()],
        category: "lesen".to_string(),
    }
}

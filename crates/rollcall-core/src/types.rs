use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Face embedding vector produced by the face engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "VGG-Face").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero vector on either side compares as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, norm_a, norm_b) = self
            .values
            .iter()
            .zip(other.values.iter())
            .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (a, b)| {
                (dot + a * b, na + a * a, nb + b * b)
            });

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// An enrolled person and their reference embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub reference_embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}

/// Kind of attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CheckIn,
    CheckOut,
}

impl EventType {
    pub fn opposite(self) -> Self {
        match self {
            EventType::CheckIn => EventType::CheckOut,
            EventType::CheckOut => EventType::CheckIn,
        }
    }

    /// The event type that must follow `last` for a person's history to keep
    /// alternating: check-in when there is no history, otherwise the opposite.
    pub fn next_after(last: Option<EventType>) -> Self {
        last.map_or(EventType::CheckIn, EventType::opposite)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventType::CheckIn => "check_in",
            EventType::CheckOut => "check_out",
        })
    }
}

/// One line of the attendance ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub person_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Similarity of the match that produced this event, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

impl AttendanceEvent {
    pub fn new(person_id: impl Into<String>, event_type: EventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            person_id: person_id.into(),
            event_type,
            timestamp,
            similarity: None,
        }
    }
}

/// Result of matching a probe embedding against the enrolled people.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Similarity of the best candidate, whether or not it passed the threshold.
    pub similarity: f32,
    pub person_id: Option<String>,
    pub person_name: Option<String>,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            person_id: None,
            person_name: None,
        }
    }
}

/// Matching policy. The threshold is configuration, not a fixed constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    /// Minimum similarity (inclusive) for a positive match.
    pub threshold: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self { threshold: 0.40 }
    }
}

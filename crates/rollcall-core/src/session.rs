//! Check-in / check-out session controller.
//!
//! [`SessionController`] is the explicit context for every operation: it owns
//! the face engine, the enrollment store, the ledger, the match policy and the
//! clock. Frames are processed one at a time, to completion.

use crate::engine::{EngineError, FaceEngine};
use crate::enrollment::{EnrollmentError, EnrollmentStore};
use crate::ledger::{Ledger, LedgerError};
use crate::matcher::{Matcher, ScoredMatcher};
use crate::types::{AttendanceEvent, Embedding, EventType, MatchPolicy, MatchResult, Person};
use chrono::{DateTime, Duration, Utc};
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no face found, retry")]
    NoFaceDetected,
    #[error("unrecognized person (best similarity {best_similarity:.3})")]
    NoMatch { best_similarity: f32 },
    #[error("{person_id} cannot {requested} now; next expected event is {expected}")]
    OutOfSequence {
        person_id: String,
        requested: EventType,
        expected: EventType,
    },
    #[error(transparent)]
    Engine(EngineError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SessionError {
    /// Whether the caller should simply try again with the next frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::NoFaceDetected
                | SessionError::NoMatch { .. }
                | SessionError::OutOfSequence { .. }
        )
    }
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoFaceDetected => SessionError::NoFaceDetected,
            other => SessionError::Engine(other),
        }
    }
}

/// Source of event timestamps.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Context object for enrollment and attendance operations.
pub struct SessionController<E, C = SystemClock> {
    engine: E,
    people: EnrollmentStore,
    ledger: Ledger,
    policy: MatchPolicy,
    clock: C,
}

impl<E: FaceEngine> SessionController<E> {
    pub fn new(engine: E, people: EnrollmentStore, ledger: Ledger, policy: MatchPolicy) -> Self {
        Self::with_clock(engine, people, ledger, policy, SystemClock)
    }
}

impl<E: FaceEngine, C: Clock> SessionController<E, C> {
    pub fn with_clock(
        engine: E,
        people: EnrollmentStore,
        ledger: Ledger,
        policy: MatchPolicy,
        clock: C,
    ) -> Self {
        Self {
            engine,
            people,
            ledger,
            policy,
            clock,
        }
    }

    /// Enroll a new person from a face image.
    pub fn enroll(&mut self, id: &str, name: &str, image: &DynamicImage) -> Result<Person, EnrollmentError> {
        let now = self.clock.now();
        self.people.enroll(&mut self.engine, id, name, image, now)
    }

    /// Overwrite an enrolled person's reference embedding.
    pub fn reenroll(
        &mut self,
        id: &str,
        name: Option<&str>,
        image: &DynamicImage,
    ) -> Result<Person, EnrollmentError> {
        self.people.reenroll(&mut self.engine, id, name, image)
    }

    pub fn remove_person(&mut self, id: &str) -> Result<bool, EnrollmentError> {
        self.people.remove(id)
    }

    /// Match a frame against the enrolled people without recording anything.
    pub fn identify(&mut self, image: &DynamicImage) -> Result<MatchResult, SessionError> {
        let probe = self.engine.embed(image)?;
        Ok(self.best_match(&probe))
    }

    /// Recognize the person in `image` and record their next attendance event.
    ///
    /// The event type is the opposite of the person's most recent event, or
    /// check-in if they have none. On error the ledger is unchanged.
    pub fn process_frame(&mut self, image: &DynamicImage) -> Result<AttendanceEvent, SessionError> {
        self.record(image, None)
    }

    /// Like [`process_frame`](Self::process_frame), but only records the event
    /// if it is of the `requested` type.
    pub fn process_frame_as(
        &mut self,
        image: &DynamicImage,
        requested: EventType,
    ) -> Result<AttendanceEvent, SessionError> {
        self.record(image, Some(requested))
    }

    fn record(
        &mut self,
        image: &DynamicImage,
        requested: Option<EventType>,
    ) -> Result<AttendanceEvent, SessionError> {
        let probe = self.engine.embed(image)?;
        let result = self.best_match(&probe);

        let person_id = match result.person_id {
            Some(id) if result.matched => id,
            _ => {
                tracing::info!(similarity = result.similarity, "no enrolled person matched");
                return Err(SessionError::NoMatch {
                    best_similarity: result.similarity,
                });
            }
        };

        let expected = EventType::next_after(self.ledger.last_event(&person_id));
        if let Some(requested) = requested.filter(|r| *r != expected) {
            return Err(SessionError::OutOfSequence {
                person_id,
                requested,
                expected,
            });
        }

        // Stamps never go below the last record. Two frames of one person can
        // share a clock reading; the later one is stamped just after.
        let mut timestamp = self.clock.now();
        if let Some(last) = self.ledger.last_timestamp().filter(|last| timestamp < *last) {
            tracing::warn!(now = %timestamp, last = %last, "clock is behind the ledger; stamping at last record");
            timestamp = last;
        }
        while self.ledger.recorded_at(&person_id, timestamp).is_some() {
            timestamp += Duration::microseconds(1);
        }

        let event = AttendanceEvent {
            person_id,
            event_type: expected,
            timestamp,
            similarity: Some(result.similarity),
        };
        self.ledger.append(&event)?;

        tracing::info!(
            person = %event.person_id,
            name = result.person_name.as_deref().unwrap_or(""),
            event = %event.event_type,
            similarity = result.similarity,
            "attendance recorded"
        );
        Ok(event)
    }

    fn best_match(&self, probe: &Embedding) -> MatchResult {
        let engine = &self.engine;
        ScoredMatcher(|a: &Embedding, b: &Embedding| engine.compare(a, b)).compare(
            probe,
            self.people.lookup_all(),
            &self.policy,
        )
    }

    pub fn people(&self) -> &EnrollmentStore {
        &self.people
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}

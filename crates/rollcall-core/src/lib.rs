//! rollcall-core — Face-recognition attendance: enrollment, matching, ledger.
//!
//! Face detection and embedding are external; this crate only sees them
//! through the [`FaceEngine`] trait. Everything else lives here: the
//! enrollment store, the append-only attendance ledger, and the session
//! controller that turns a captured frame into a check-in or check-out.

pub mod engine;
pub mod enrollment;
pub mod ledger;
pub mod matcher;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{EngineError, FaceEngine};
pub use enrollment::{EnrollmentError, EnrollmentStore};
pub use ledger::{AppendOutcome, DateRange, Events, Ledger, LedgerError, Summary};
pub use matcher::{Matcher, ScoredMatcher};
pub use session::{Clock, SessionController, SessionError, SystemClock};
pub use types::{AttendanceEvent, Embedding, EventType, MatchPolicy, MatchResult, Person};

//! Enrollment store: enrolled people and their reference embeddings.
//!
//! Layout under the store directory:
//!
//! ```text
//! people.jsonl      one JSON object per person, enrollment order
//! faces/<id>.png    reference snapshot captured at enrollment
//! ```
//!
//! `people.jsonl` is rewritten through a temp file + rename, so a crash never
//! leaves a half-written roster behind.

use crate::engine::{EngineError, FaceEngine};
use crate::types::Person;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const PEOPLE_FILE: &str = "people.jsonl";
const FACES_DIR: &str = "faces";

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("person id already enrolled: {0}")]
    DuplicateId(String),
    #[error("no enrolled person with id: {0}")]
    UnknownPerson(String),
    #[error("invalid person id {0:?}: use letters, digits, '-', '_' or '.'")]
    InvalidId(String),
    #[error("person name must not be empty")]
    EmptyName,
    #[error("no face detected in enrollment image")]
    NoFaceDetected,
    #[error(transparent)]
    Engine(EngineError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line}: malformed person record: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode person record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to encode reference image: {0}")]
    Image(#[from] image::ImageError),
}

impl EnrollmentError {
    /// Whether the request can be fixed by the user (another image, id or
    /// name) rather than by repairing the store or the engine.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EnrollmentError::DuplicateId(_)
                | EnrollmentError::UnknownPerson(_)
                | EnrollmentError::InvalidId(_)
                | EnrollmentError::EmptyName
                | EnrollmentError::NoFaceDetected
        )
    }
}

impl From<EngineError> for EnrollmentError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoFaceDetected => EnrollmentError::NoFaceDetected,
            other => EnrollmentError::Engine(other),
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> EnrollmentError + '_ {
    move |source| EnrollmentError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Ids double as snapshot file names, so keep them to a filesystem-safe set.
fn validate_id(id: &str) -> Result<(), EnrollmentError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(EnrollmentError::InvalidId(id.to_string()))
    }
}

/// On-disk roster of enrolled people.
pub struct EnrollmentStore {
    dir: PathBuf,
    people: Vec<Person>,
}

impl EnrollmentStore {
    /// Open (or create) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, EnrollmentError> {
        let dir = dir.into();
        let faces = dir.join(FACES_DIR);
        fs::create_dir_all(&faces).map_err(io_err(&faces))?;
        Self::load(dir)
    }

    /// Read the store at `dir` without creating anything on disk.
    ///
    /// A missing directory reads as an empty roster.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, EnrollmentError> {
        let dir = dir.into();
        let path = dir.join(PEOPLE_FILE);
        let people = match fs::File::open(&path) {
            Ok(file) => read_people(&path, file)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_err(&path)(e)),
        };

        tracing::debug!(path = %path.display(), people = people.len(), "enrollment store loaded");
        Ok(Self { dir, people })
    }

    /// Path of the reference snapshot for `id`.
    pub fn snapshot_path(&self, id: &str) -> PathBuf {
        self.dir.join(FACES_DIR).join(format!("{id}.png"))
    }

    /// Enroll a new person from a face image.
    ///
    /// Fails with [`EnrollmentError::DuplicateId`] if `id` is taken and with
    /// [`EnrollmentError::NoFaceDetected`] if the engine finds no face. Nothing
    /// is persisted on failure.
    pub fn enroll<E: FaceEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        id: &str,
        name: &str,
        image: &DynamicImage,
        enrolled_at: DateTime<Utc>,
    ) -> Result<Person, EnrollmentError> {
        validate_id(id)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(EnrollmentError::EmptyName);
        }
        if self.get(id).is_some() {
            return Err(EnrollmentError::DuplicateId(id.to_string()));
        }

        let embedding = engine.embed(image)?;
        let person = Person {
            id: id.to_string(),
            name: name.to_string(),
            reference_embedding: embedding,
            enrolled_at,
        };

        self.write_snapshot(id, image)?;
        self.people.push(person.clone());
        if let Err(e) = self.persist() {
            self.people.pop();
            let _ = fs::remove_file(self.snapshot_path(id));
            return Err(e);
        }

        tracing::info!(
            id,
            name,
            dim = person.reference_embedding.dim(),
            model = ?person.reference_embedding.model_version,
            "person enrolled"
        );
        Ok(person)
    }

    /// Replace an existing person's reference embedding (and name, if given).
    ///
    /// The first enrollment time is kept so tie-breaking stays stable.
    pub fn reenroll<E: FaceEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        id: &str,
        name: Option<&str>,
        image: &DynamicImage,
    ) -> Result<Person, EnrollmentError> {
        let idx = self
            .people
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| EnrollmentError::UnknownPerson(id.to_string()))?;
        let name = match name.map(str::trim) {
            Some("") => return Err(EnrollmentError::EmptyName),
            Some(n) => n.to_string(),
            None => self.people[idx].name.clone(),
        };

        let embedding = engine.embed(image)?;
        let updated = Person {
            id: id.to_string(),
            name,
            reference_embedding: embedding,
            enrolled_at: self.people[idx].enrolled_at,
        };
        let previous = std::mem::replace(&mut self.people[idx], updated);
        if let Err(e) = self.persist() {
            self.people[idx] = previous;
            return Err(e);
        }
        if let Err(e) = self.write_snapshot(id, image) {
            tracing::warn!(id, error = %e, "failed to refresh reference snapshot");
        }

        tracing::info!(id, "person re-enrolled");
        Ok(self.people[idx].clone())
    }

    /// Remove a person. Returns `false` if the id was not enrolled.
    ///
    /// Ledger history for the person is left untouched.
    pub fn remove(&mut self, id: &str) -> Result<bool, EnrollmentError> {
        let Some(idx) = self.people.iter().position(|p| p.id == id) else {
            return Ok(false);
        };

        let removed = self.people.remove(idx);
        if let Err(e) = self.persist() {
            self.people.insert(idx, removed);
            return Err(e);
        }

        let snapshot = self.snapshot_path(id);
        match fs::remove_file(&snapshot) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %snapshot.display(), error = %e, "failed to remove snapshot"),
        }

        tracing::info!(id, "person removed");
        Ok(true)
    }

    /// All enrolled people, earliest enrollment first.
    pub fn lookup_all(&self) -> &[Person] {
        &self.people
    }

    pub fn get(&self, id: &str) -> Option<&Person> {
        self.people.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }

    fn persist(&self) -> Result<(), EnrollmentError> {
        let path = self.dir.join(PEOPLE_FILE);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;

        for person in &self.people {
            let line = serde_json::to_string(person).map_err(EnrollmentError::Encode)?;
            writeln!(tmp, "{line}").map_err(io_err(tmp.path()))?;
        }
        tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;
        tmp.persist(&path).map_err(|e| io_err(&path)(e.error))?;
        Ok(())
    }

    fn write_snapshot(&self, id: &str, image: &DynamicImage) -> Result<(), EnrollmentError> {
        let path = self.snapshot_path(id);
        let faces = self.dir.join(FACES_DIR);
        let mut tmp = tempfile::NamedTempFile::new_in(&faces).map_err(io_err(&faces))?;
        image.write_to(&mut tmp, ImageFormat::Png)?;
        tmp.persist(&path).map_err(|e| io_err(&path)(e.error))?;
        Ok(())
    }
}

fn read_people(path: &Path, file: fs::File) -> Result<Vec<Person>, EnrollmentError> {
    let mut people = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err(path))?;
        if line.trim().is_empty() {
            continue;
        }
        let person: Person = serde_json::from_str(&line).map_err(|source| EnrollmentError::Corrupt {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        people.push(person);
    }
    Ok(people)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face, no_face, FakeEngine};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_enroll_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FakeEngine::new();

        let mut store = EnrollmentStore::open(dir.path()).unwrap();
        let alice = store.enroll(&mut engine, "alice", "Alice", &face(1), at(0)).unwrap();
        store.enroll(&mut engine, "bob", " Bob ", &face(2), at(1)).unwrap();
        assert!(store.snapshot_path("alice").exists());

        let reopened = EnrollmentStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.lookup_all()[0], alice);
        assert_eq!(reopened.lookup_all()[1].name, "Bob");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FakeEngine::new();
        let mut store = EnrollmentStore::open(dir.path()).unwrap();

        store.enroll(&mut engine, "alice", "Alice", &face(1), at(0)).unwrap();
        let err = store.enroll(&mut engine, "alice", "Other", &face(2), at(1)).unwrap_err();
        assert!(matches!(err, EnrollmentError::DuplicateId(ref id) if id == "alice"));
        assert!(err.is_recoverable());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("alice").unwrap().name, "Alice");
    }

    #[test]
    fn test_no_face_rejected_and_nothing_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FakeEngine::new();
        let mut store = EnrollmentStore::open(dir.path()).unwrap();

        let err = store.enroll(&mut engine, "alice", "Alice", &no_face(), at(0)).unwrap_err();
        assert!(matches!(err, EnrollmentError::NoFaceDetected));
        assert!(err.is_recoverable());
        assert!(store.is_empty());
        assert!(!store.snapshot_path("alice").exists());
        assert!(EnrollmentStore::open(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_ids_and_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FakeEngine::new();
        let mut store = EnrollmentStore::open(dir.path()).unwrap();

        for id in ["", "..", "a/b", "has space"] {
            let err = store.enroll(&mut engine, id, "X", &face(1), at(0)).unwrap_err();
            assert!(matches!(err, EnrollmentError::InvalidId(_)), "id {id:?}");
        }
        let err = store.enroll(&mut engine, "ok", "   ", &face(1), at(0)).unwrap_err();
        assert!(matches!(err, EnrollmentError::EmptyName));
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn test_reenroll_overwrites_embedding_keeps_enrolled_at() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FakeEngine::new();
        let mut store = EnrollmentStore::open(dir.path()).unwrap();

        let before = store.enroll(&mut engine, "alice", "Alice", &face(1), at(0)).unwrap();
        let after = store.reenroll(&mut engine, "alice", Some("Alice B."), &face(3)).unwrap();
        assert_eq!(after.enrolled_at, before.enrolled_at);
        assert_eq!(after.name, "Alice B.");
        assert_ne!(after.reference_embedding, before.reference_embedding);

        let reopened = EnrollmentStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("alice"), Some(&after));
    }

    #[test]
    fn test_reenroll_unknown_person() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FakeEngine::new();
        let mut store = EnrollmentStore::open(dir.path()).unwrap();
        let err = store.reenroll(&mut engine, "ghost", None, &face(1)).unwrap_err();
        assert!(matches!(err, EnrollmentError::UnknownPerson(_)));
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FakeEngine::new();
        let mut store = EnrollmentStore::open(dir.path()).unwrap();
        store.enroll(&mut engine, "alice", "Alice", &face(1), at(0)).unwrap();

        assert!(store.remove("alice").unwrap());
        assert!(!store.remove("alice").unwrap());
        assert!(!store.snapshot_path("alice").exists());
        assert!(EnrollmentStore::open(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_record_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PEOPLE_FILE), "\n{not json}\n").unwrap();
        let err = EnrollmentStore::open(dir.path()).err().unwrap();
        assert!(matches!(err, EnrollmentError::Corrupt { line: 2, .. }));
        assert!(!err.is_recoverable());
    }

    /// Put a directory where `people.jsonl` goes so the rename in `persist`
    /// fails, whatever the process privileges.
    fn block_roster(dir: &Path) -> PathBuf {
        let roster = dir.join(PEOPLE_FILE);
        let saved = dir.join("people.saved");
        fs::rename(&roster, &saved).unwrap();
        fs::create_dir(&roster).unwrap();
        saved
    }

    fn unblock_roster(dir: &Path, saved: &Path) {
        let roster = dir.join(PEOPLE_FILE);
        fs::remove_dir(&roster).unwrap();
        fs::rename(saved, &roster).unwrap();
    }

    #[test]
    fn test_failed_write_leaves_roster_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FakeEngine::new();
        let mut store = EnrollmentStore::open(dir.path()).unwrap();
        let alice = store.enroll(&mut engine, "alice", "Alice", &face(1), at(0)).unwrap();

        let saved = block_roster(dir.path());

        let err = store.enroll(&mut engine, "bob", "Bob", &face(2), at(1)).unwrap_err();
        assert!(matches!(err, EnrollmentError::Io { .. }));
        assert!(!err.is_recoverable());
        assert_eq!(store.len(), 1);
        assert!(store.get("bob").is_none());
        assert!(!store.snapshot_path("bob").exists());

        assert!(store.reenroll(&mut engine, "alice", Some("Alicia"), &face(3)).is_err());
        assert_eq!(store.get("alice"), Some(&alice));

        assert!(store.remove("alice").is_err());
        assert_eq!(store.lookup_all(), &[alice.clone()][..]);
        assert!(store.snapshot_path("alice").exists());

        unblock_roster(dir.path(), &saved);
        let reopened = EnrollmentStore::open(dir.path()).unwrap();
        assert_eq!(reopened.lookup_all(), &[alice][..]);
    }

    #[test]
    fn test_load_does_not_create_store() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("absent");

        let store = EnrollmentStore::load(&root).unwrap();
        assert!(store.is_empty());
        assert!(!root.exists());
    }

    #[test]
    fn test_encode_error_is_not_reported_as_corrupt_line() {
        let source = serde_json::from_str::<Person>("{").unwrap_err();
        let err = EnrollmentError::Encode(source);
        assert!(err.to_string().starts_with("failed to encode person record"));
        assert!(!err.is_recoverable());
    }
}

use crate::types::{Embedding, MatchPolicy, MatchResult, Person};

/// Strategy for comparing a probe embedding against the enrolled people.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[Person], policy: &MatchPolicy) -> MatchResult;
}

/// Matcher driven by a pairwise similarity function.
///
/// Picks the highest-scoring person at or above the threshold. Equal scores go
/// to the earliest enrollment. References whose dimension differs from the
/// probe (enrolled under another model) are skipped.
pub struct ScoredMatcher<F>(pub F);

/// Matcher using plain cosine similarity.
pub fn cosine() -> ScoredMatcher<fn(&Embedding, &Embedding) -> f32> {
    ScoredMatcher(Embedding::similarity as fn(&Embedding, &Embedding) -> f32)
}

impl<F> Matcher for ScoredMatcher<F>
where
    F: Fn(&Embedding, &Embedding) -> f32,
{
    fn compare(&self, probe: &Embedding, gallery: &[Person], policy: &MatchPolicy) -> MatchResult {
        let mut best: Option<(&Person, f32)> = None;

        for person in gallery {
            if person.reference_embedding.dim() != probe.dim() {
                tracing::warn!(
                    person = %person.id,
                    enrolled_dim = person.reference_embedding.dim(),
                    probe_dim = probe.dim(),
                    "embedding dimension mismatch; re-enroll this person"
                );
                continue;
            }

            let sim = (self.0)(probe, &person.reference_embedding);
            if sim.is_nan() {
                continue;
            }

            let better = match best {
                None => true,
                Some((prev, prev_sim)) => {
                    sim > prev_sim || (sim == prev_sim && person.enrolled_at < prev.enrolled_at)
                }
            };
            if better {
                best = Some((person, sim));
            }
        }

        match best {
            Some((person, sim)) if sim >= policy.threshold => MatchResult {
                matched: true,
                similarity: sim,
                person_id: Some(person.id.clone()),
                person_name: Some(person.name.clone()),
            },
            Some((_, sim)) => MatchResult::no_match(sim),
            None => MatchResult::no_match(0.0),
        }
    }
}

use crate::frame::Frame;
use crate::BoundingBox;

/// Face embedding vector produced by a matcher.
pub type Embedding = Vec<f32>;

/// Recognition failure for a single frame.
#[derive(Clone, Debug, PartialEq)]
pub enum MatcherError {
    /// The recognition backend failed (model error, resource exhaustion).
    Backend(String),
    /// The backend rejected its input (e.g. mismatched embedding lengths).
    InvalidInput(String),
}

impl std::fmt::Display for MatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatcherError::Backend(reason) => write!(f, "matcher backend failed: {}", reason),
            MatcherError::InvalidInput(reason) => write!(f, "matcher rejected input: {}", reason),
        }
    }
}

impl std::error::Error for MatcherError {}

/// Face location / embedding / distance capability.
///
/// Implementations are called from blocking worker threads and may be shared
/// across concurrent jobs, so methods take `&self`.
///
/// The recognition gate calls, in order:
/// 1. `locate` on the (downscaled) frame
/// 2. `embed` once with all located boxes
/// 3. `best_match` once per embedding against the known roster
pub trait Matcher: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Find face bounding boxes in a frame.
    fn locate(&self, frame: &Frame) -> Result<Vec<BoundingBox>, MatcherError>;

    /// Compute one embedding per box, in the same order.
    fn embed(&self, frame: &Frame, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, MatcherError>;

    /// Nearest known embedding as `(index, distance)`, or `None` for an empty roster.
    fn best_match(
        &self,
        embedding: &[f32],
        known: &[Embedding],
    ) -> Result<Option<(usize, f32)>, MatcherError> {
        let mut best: Option<(usize, f32)> = None;
        for (index, candidate) in known.iter().enumerate() {
            let distance = euclidean_distance(embedding, candidate)?;
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((index, distance));
            }
        }
        Ok(best)
    }

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<(), MatcherError> {
        Ok(())
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32, MatcherError> {
    if a.len() != b.len() {
        return Err(MatcherError::InvalidInput(format!(
            "embedding length mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DistanceOnly;

    impl Matcher for DistanceOnly {
        fn name(&self) -> &'static str {
            "distance-only"
        }

        fn locate(&self, _frame: &Frame) -> Result<Vec<BoundingBox>, MatcherError> {
            Ok(Vec::new())
        }

        fn embed(&self, _frame: &Frame, _boxes: &[BoundingBox]) -> Result<Vec<Embedding>, MatcherError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn default_best_match_picks_nearest() -> Result<(), MatcherError> {
        let known = vec![vec![1.0, 0.0], vec![0.0, 0.5], vec![3.0, 3.0]];
        let best = DistanceOnly.best_match(&[0.0, 0.4], &known)?;
        let (index, distance) = best.ok_or_else(|| MatcherError::Backend("no match".into()))?;
        assert_eq!(index, 1);
        assert!((distance - 0.1).abs() < 1e-5);
        assert_eq!(DistanceOnly.best_match(&[0.0, 0.0], &[])?, None);
        Ok(())
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(matches!(
            euclidean_distance(&[1.0], &[1.0, 2.0]),
            Err(MatcherError::InvalidInput(_))
        ));
    }
}

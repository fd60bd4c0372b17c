use crate::detect::backend::{Embedding, Matcher, MatcherError};
use crate::frame::Frame;
use crate::BoundingBox;

/// Stub matcher for bring-up. Never finds a face.
pub struct StubMatcher;

impl StubMatcher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StubMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher for StubMatcher {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn locate(&self, _frame: &Frame) -> Result<Vec<BoundingBox>, MatcherError> {
        Ok(Vec::new())
    }

    fn embed(&self, _frame: &Frame, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, MatcherError> {
        Ok(boxes.iter().map(|_| Vec::new()).collect())
    }
}

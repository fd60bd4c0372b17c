mod backend;
mod backends;
mod gate;
mod identity;

pub use backend::{euclidean_distance, Embedding, Matcher, MatcherError};
pub use backends::StubMatcher;
pub use gate::{
    is_scheduled, loggable, unlock_eligible, GateSettings, RecognitionGate, UnlockAttempt,
};
pub use identity::{IdentityStore, InMemoryIdentityStore, KnownFaces, UserSummary};

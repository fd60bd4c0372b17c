pub mod stub;

pub use stub::StubMatcher;

pub mod git;

pub use git::{CommitAuthor, GitTracker};

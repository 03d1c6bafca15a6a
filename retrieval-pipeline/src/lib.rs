#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod answer;
pub mod brief;
pub mod cache;
pub mod engine;
pub mod search;

#[cfg(test)]
mod test_support;

pub use answer::{AnswerComposer, Citation, GroundedAnswer};
pub use brief::{BriefService, TenderBrief};
pub use engine::{RetrievalConfig, RetrievalEngine};
pub use search::{ScoredPassage, MAX_TOP_K};

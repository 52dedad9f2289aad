pub mod record;
pub mod recommendation;

pub use record::{FieldValue, OpportunityRecord};
pub use recommendation::{Diagnostics, FeeCandidate, Recommendation};

//! Training-time feature engineering over historical bids.

pub mod builder;
pub mod history;

pub use builder::{EnrichedDataset, TimeSeriesFeatureBuilder};
pub use history::{load_history, HistoricalRow, DEFAULT_DATE_COLUMN};

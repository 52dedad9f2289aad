//! Inference-time feature encoding.

pub mod encoder;
pub mod transform;

pub use encoder::{CategoricalEncoders, EncoderMap, MISSING_CATEGORY};
pub use transform::{
    FeatureTransformer, FeatureVector, FieldOverrides, MissingMedianPolicy, TrainMedians,
};

//! Transform and load stages

mod load;
mod transform;

pub use load::{ArtifactRef, LoadTask};
pub use transform::{FieldMapping, RecordTransform, TransformTask};

//! Services shared by every task of a run

use std::sync::Arc;

use crate::bucket::BucketStore;
use crate::catalog::SourceCatalog;
use crate::loader::RecordsLoader;
use crate::metrics::{HostInfo, ResourceSampler};
use crate::warehouse::Warehouse;

#[derive(Clone)]
pub struct RunContext {
    pub bucket: BucketStore,
    pub loader: RecordsLoader,
    pub catalog: Arc<dyn SourceCatalog>,
    pub sampler: Arc<dyn ResourceSampler>,
    pub host: HostInfo,
}

impl RunContext {
    pub fn new(
        bucket: BucketStore,
        warehouse: Arc<dyn Warehouse>,
        catalog: Arc<dyn SourceCatalog>,
        sampler: Arc<dyn ResourceSampler>,
        host: HostInfo,
    ) -> Self {
        Self {
            bucket,
            loader: RecordsLoader::new(warehouse),
            catalog,
            sampler,
            host,
        }
    }
}

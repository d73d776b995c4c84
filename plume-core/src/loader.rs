use std::future::Future;
use std::path::Path;

use anyhow::Result;

use crate::{DeviceMap, ModelLike};

/// Materializes a model once per process from an unpacked artifact directory.
pub trait Loader {
    type Model: ModelLike;

    fn load(
        model_dir: &Path,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}

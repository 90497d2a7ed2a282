//! Stereo pipeline umbrella crate.
//!
//! Re-exports the workspace crates so applications can depend on a single
//! package, plus process-wide thread pool setup.

pub use cv_calib3d as calib3d;
pub use cv_core as core;
pub use cv_imgproc as imgproc;
pub use cv_runtime as runtime;
pub use cv_stereo as stereo;

pub use cv_stereo::{
    DisparityMap, Pipeline, PipelineConfig, PipelineEvent, Rectification, Reprojection,
    ReprojectionMethod, Stage, StereoMethod,
};

use cv_core::{Error, Result};
use std::sync::OnceLock;

static THREAD_POOL_INIT: OnceLock<std::result::Result<usize, String>> = OnceLock::new();

/// Initialize the global Rayon pool used by remapping and the parallel
/// reprojection back-end.
///
/// Repeated calls are idempotent and return the first initialization result.
///
/// Priority order:
/// 1. explicit `num_threads`
/// 2. `RUSTCV_CPU_THREADS` env var
/// 3. Rayon default
pub fn init_thread_pool(num_threads: Option<usize>) -> Result<usize> {
    THREAD_POOL_INIT
        .get_or_init(|| {
            let configured = match num_threads {
                Some(n) => Some(n),
                None => cv_runtime::read_cpu_threads_from_env().map_err(|e| e.to_string())?,
            };
            let mut builder = rayon::ThreadPoolBuilder::new();
            if let Some(n) = configured {
                if n == 0 {
                    return Err("thread count must be >= 1".to_string());
                }
                builder = builder.num_threads(n);
            }
            builder.build_global().map_err(|e| e.to_string())?;
            let threads = rayon::current_num_threads();
            tracing::info!(threads, "global thread pool initialized");
            Ok(threads)
        })
        .clone()
        .map_err(Error::RuntimeError)
}

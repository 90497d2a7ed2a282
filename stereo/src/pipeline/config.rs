use crate::rectification::RectificationOptions;
use crate::reprojection::ReprojectionMethod;
use crate::visualization::ColorMap;
use crate::{Error, Result};
use cv_runtime::{read_bool_from_env, read_cpu_threads_from_env};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub const THREADED_VAR: &str = "RUSTCV_PIPELINE_THREADED";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run the disparity stage on the worker pool. When false it runs inline on
    /// the driver thread.
    pub threaded: bool,
    pub worker_threads: usize,
    /// Weight of the previous estimate in the frame-rate average, in `[0, 1)`.
    pub fps_smoothing: f64,
    pub reprojection_method: ReprojectionMethod,
    pub colormap: ColorMap,
    pub rectification: RectificationOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threaded: true,
            worker_threads: 1,
            fps_smoothing: 0.9,
            reprojection_method: ReprojectionMethod::Reference,
            colormap: ColorMap::Jet,
            rectification: RectificationOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Configuration for deterministic, single-threaded processing.
    pub fn synchronous() -> Self {
        Self {
            threaded: false,
            ..Self::default()
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::ConfigError(format!("cannot open pipeline config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `RUSTCV_CPU_THREADS` and `RUSTCV_PIPELINE_THREADED`.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(threads) = read_cpu_threads_from_env()? {
            self.worker_threads = threads;
        }
        if let Some(threaded) = read_bool_from_env(THREADED_VAR)? {
            self.threaded = threaded;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::ConfigError("worker_threads must be >= 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.fps_smoothing) {
            return Err(Error::ConfigError(format!(
                "fps_smoothing must be in [0, 1), got {}",
                self.fps_smoothing
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_use_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"threaded": false, "colormap": "grayscale"}"#).unwrap();
        assert!(!config.threaded);
        assert_eq!(config.colormap, ColorMap::Grayscale);
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.reprojection_method, ReprojectionMethod::Reference);
    }

    #[test]
    fn load_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"worker_threads": 0}"#).unwrap();
        assert!(matches!(PipelineConfig::load(&path), Err(Error::ConfigError(_))));

        std::fs::write(&path, r#"{"reprojection_method": "parallel", "fps_smoothing": 0.5}"#)
            .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.reprojection_method, ReprojectionMethod::Parallel);
        assert!(PipelineConfig::load(dir.path().join("missing.json")).is_err());
    }
}

//! Image pair sources feeding the pipeline.

use crate::{Error, Result};
use image::GrayImage;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A left/right image pair. Both images empty means "no frame".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImagePair {
    pub left: GrayImage,
    pub right: GrayImage,
}

impl ImagePair {
    pub fn new(left: GrayImage, right: GrayImage) -> Self {
        Self { left, right }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }

    pub fn same_size(&self) -> bool {
        self.left.dimensions() == self.right.dimensions()
    }
}

/// Callback a source uses to announce that new images are available.
#[derive(Clone)]
pub struct SourceNotifier {
    notify: Arc<dyn Fn() + Send + Sync>,
}

impl SourceNotifier {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            notify: Arc::new(f),
        }
    }

    pub fn notify(&self) {
        (self.notify)()
    }
}

impl fmt::Debug for SourceNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SourceNotifier")
    }
}

/// Producer of stereo image pairs.
pub trait ImagePairSource: Send {
    fn name(&self) -> &str;

    /// Current pair. Must return promptly; a source without a frame yet returns
    /// an empty pair.
    fn images(&mut self) -> Result<ImagePair>;

    /// Called by the pipeline when the source is installed. Sources that produce
    /// frames asynchronously keep the notifier and call it per frame.
    fn attach(&mut self, _notifier: SourceNotifier) {}

    fn stop(&mut self) {}
}

/// Serves one fixed pair, held in memory or read from disk.
#[derive(Debug, Clone)]
pub struct StaticImagePairSource {
    pair: ImagePair,
}

impl StaticImagePairSource {
    pub fn new(left: GrayImage, right: GrayImage) -> Self {
        Self {
            pair: ImagePair::new(left, right),
        }
    }

    pub fn from_files<P: AsRef<Path>, Q: AsRef<Path>>(left: P, right: Q) -> Result<Self> {
        Ok(Self::new(open_gray(left.as_ref())?, open_gray(right.as_ref())?))
    }
}

fn open_gray(path: &Path) -> Result<GrayImage> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|e| Error::InvalidInput(format!("cannot read image {}: {e}", path.display())))
}

impl ImagePairSource for StaticImagePairSource {
    fn name(&self) -> &str {
        "static"
    }

    fn images(&mut self) -> Result<ImagePair> {
        Ok(self.pair.clone())
    }
}

#[derive(Default)]
struct PushShared {
    latest: Mutex<ImagePair>,
    notifier: Mutex<Option<SourceNotifier>>,
    stopped: AtomicBool,
}

/// Source fed from outside the pipeline, e.g. by a capture thread.
pub struct PushImagePairSource {
    shared: Arc<PushShared>,
}

/// Cloneable handle pushing frames into a [`PushImagePairSource`].
#[derive(Clone)]
pub struct PushHandle {
    shared: Arc<PushShared>,
}

impl PushImagePairSource {
    pub fn new() -> (Self, PushHandle) {
        let shared = Arc::new(PushShared::default());
        (
            Self {
                shared: shared.clone(),
            },
            PushHandle { shared },
        )
    }
}

impl ImagePairSource for PushImagePairSource {
    fn name(&self) -> &str {
        "push"
    }

    fn images(&mut self) -> Result<ImagePair> {
        Ok(self
            .shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn attach(&mut self, notifier: SourceNotifier) {
        self.shared.stopped.store(false, Ordering::Release);
        *self
            .shared
            .notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(notifier);
    }

    fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared
            .notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl PushHandle {
    /// Replace the current frame and notify the attached pipeline. Returns
    /// `false` once the source has been stopped.
    pub fn push(&self, left: GrayImage, right: GrayImage) -> bool {
        if self.shared.stopped.load(Ordering::Acquire) {
            return false;
        }
        *self
            .shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = ImagePair::new(left, right);

        let notifier = self
            .shared
            .notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(notifier) = notifier {
            notifier.notify();
        }
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

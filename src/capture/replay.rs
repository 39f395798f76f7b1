//! Replays still images from a directory
//!
//! Lets the whole pipeline run on hosts without a camera: dry runs on a
//! laptop, CI, or reproducing a field report from saved frames.

use super::{CaptureBackend, CaptureConfig, CaptureResult, Frame, FrameSource};
use crate::error::CaptureFailure;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

/// Opens [`ReplaySource`]s over the images in one directory
#[derive(Debug, Clone)]
pub struct ReplayBackend {
    dir: PathBuf,
}

impl ReplayBackend {
    /// Replay the images found in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CaptureBackend for ReplayBackend {
    fn name(&self) -> &str {
        "replay"
    }

    async fn open(
        &self,
        _config: &CaptureConfig,
    ) -> std::result::Result<Box<dyn FrameSource>, CaptureFailure> {
        let files = image_files(&self.dir).await?;
        tracing::info!(
            dir = %self.dir.display(),
            images = files.len(),
            "Replaying captured images"
        );
        Ok(Box::new(ReplaySource { files, next: 0 }))
    }
}

async fn image_files(dir: &Path) -> std::result::Result<Vec<PathBuf>, CaptureFailure> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CaptureFailure::DeviceUnavailable(format!("{}: {e}", dir.display())))?;

    let mut listing = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => listing.push(Ok(entry.path())),
            Ok(None) => break,
            Err(e) => {
                listing.push(Err(e));
                break;
            }
        }
    }
    pick_images(dir, listing)
}

/// Keep the image files of a directory listing, sorted by name.
///
/// A listing that broke off part way is an error, not a shorter replay.
fn pick_images(
    dir: &Path,
    listing: impl IntoIterator<Item = io::Result<PathBuf>>,
) -> std::result::Result<Vec<PathBuf>, CaptureFailure> {
    let mut files = Vec::new();
    for path in listing {
        let path = path
            .map_err(|e| CaptureFailure::DeviceUnavailable(format!("{}: {e}", dir.display())))?;
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image {
            files.push(path);
        }
    }

    if files.is_empty() {
        return Err(CaptureFailure::DeviceUnavailable(format!(
            "no images in {}",
            dir.display()
        )));
    }

    files.sort();
    Ok(files)
}

/// Cycles through a fixed list of image files, one per capture
pub struct ReplaySource {
    files: Vec<PathBuf>,
    next: usize,
}

#[async_trait]
impl FrameSource for ReplaySource {
    async fn acquire(&mut self) -> CaptureResult {
        let path = &self.files[self.next % self.files.len()];
        self.next = self.next.wrapping_add(1);

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CaptureFailure::ReadFailed(format!("{}: {e}", path.display())))?;
        if bytes.is_empty() {
            return Err(CaptureFailure::EmptyFrame);
        }

        image::load_from_memory(&bytes)
            .map(Frame::new)
            .map_err(|e| CaptureFailure::ReadFailed(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage};

    #[tokio::test]
    async fn test_cycles_through_sorted_images() {
        let dir = tempfile::tempdir().unwrap();
        DynamicImage::ImageLuma8(GrayImage::new(2, 2))
            .save(dir.path().join("b.png"))
            .unwrap();
        DynamicImage::ImageLuma8(GrayImage::new(3, 3))
            .save(dir.path().join("a.png"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = ReplayBackend::new(dir.path())
            .open(&CaptureConfig::default())
            .await
            .unwrap();

        let widths: Vec<u32> = [
            source.acquire().await.unwrap().width(),
            source.acquire().await.unwrap().width(),
            source.acquire().await.unwrap().width(),
        ]
        .to_vec();
        assert_eq!(widths, vec![3, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let result = ReplayBackend::new(dir.path())
            .open(&CaptureConfig::default())
            .await;
        assert!(matches!(
            result,
            Err(CaptureFailure::DeviceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_image_is_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        let mut source = ReplayBackend::new(dir.path())
            .open(&CaptureConfig::default())
            .await
            .unwrap();
        assert!(matches!(
            source.acquire().await,
            Err(CaptureFailure::ReadFailed(_))
        ));
    }

    #[test]
    fn test_interrupted_listing_is_unavailable() {
        let dir = Path::new("/srv/frames");
        let listing = vec![
            Ok(dir.join("01.png")),
            Err(io::Error::other("stale NFS handle")),
            Ok(dir.join("03.png")),
        ];
        match pick_images(dir, listing) {
            Err(CaptureFailure::DeviceUnavailable(reason)) => {
                assert!(reason.contains("stale NFS handle"), "{reason}");
            }
            other => panic!("expected DeviceUnavailable, got {other:?}"),
        }

        let listing = vec![Ok(dir.join("b.JPG")), Ok(dir.join("a.png")), Ok(dir.join("c.txt"))];
        assert_eq!(
            pick_images(dir, listing).unwrap(),
            vec![dir.join("a.png"), dir.join("b.JPG")]
        );
    }
}

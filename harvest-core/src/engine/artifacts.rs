use std::path::{Path, PathBuf};
use std::time::Duration;

use image::imageops::FilterType;
use image::DynamicImage;
use tokio::time::sleep;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::error::{EngineError, EngineResult};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];
const STANDARD_WIDTH: u32 = 1920;
const STANDARD_HEIGHT: u32 = 1080;

/// Files the portal drops into the staging directory: tabular exports and
/// image downloads. The store waits for them, relocates them under stable
/// names, and normalizes images for the downstream pipeline.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    staging_dir: PathBuf,
    data_dir: PathBuf,
    image_dir: PathBuf,
    poll_interval: Duration,
}

impl ArtifactStore {
    pub fn new(
        staging_dir: impl AsRef<Path>,
        data_dir: impl AsRef<Path>,
        image_dir: impl AsRef<Path>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            staging_dir: staging_dir.as_ref().to_path_buf(),
            data_dir: data_dir.as_ref().to_path_buf(),
            image_dir: image_dir.as_ref().to_path_buf(),
            poll_interval: poll_interval.max(Duration::from_millis(100)),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Waits for the portal to finish downloading `filename`. Chromium
    /// writes through a `.crdownload` sidecar, so the file only counts
    /// once the sidecar is gone.
    pub async fn wait_for(&self, filename: &str, timeout: Duration) -> EngineResult<PathBuf> {
        let path = self.staging_dir.join(filename);
        let partial = self.staging_dir.join(format!("{filename}.crdownload"));
        let mut waited = Duration::ZERO;
        loop {
            if path.exists() && !partial.exists() {
                return Ok(path);
            }
            if waited >= timeout {
                return Err(EngineError::Timeout(format!(
                    "download of {filename} did not complete within {}s",
                    timeout.as_secs()
                )));
            }
            sleep(self.poll_interval).await;
            waited += self.poll_interval;
        }
    }

    /// Waits for any image file to appear in staging. Downloads from the
    /// portal carry unpredictable names, so match on extension alone.
    pub async fn wait_for_image(&self, timeout: Duration) -> EngineResult<PathBuf> {
        let mut waited = Duration::ZERO;
        loop {
            if let Some(path) = self.first_staged_image()? {
                let partial = path.with_extension(format!(
                    "{}.crdownload",
                    path.extension().and_then(|e| e.to_str()).unwrap_or("")
                ));
                if !partial.exists() {
                    return Ok(path);
                }
            }
            if waited >= timeout {
                return Err(EngineError::Timeout(format!(
                    "no image download within {}s",
                    timeout.as_secs()
                )));
            }
            sleep(self.poll_interval).await;
            waited += self.poll_interval;
        }
    }

    /// Moves a staged artifact into the data directory under its final
    /// name, replacing any stale copy from an earlier attempt. The name
    /// may carry subdirectories, e.g. `IndustrialWest/77.csv`.
    pub fn claim(&self, staged: &Path, final_name: &str) -> EngineResult<PathBuf> {
        let destination = self.data_dir.join(final_name);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        relocate(staged, &destination)?;
        info!(from = %staged.display(), to = %destination.display(), "artifact relocated");
        Ok(destination)
    }

    pub fn data_path(&self, final_name: &str) -> PathBuf {
        self.data_dir.join(final_name)
    }

    pub fn image_path(&self, target_id: &str) -> PathBuf {
        self.image_dir.join(format!("{target_id}.jpg"))
    }

    pub fn has_image(&self, target_id: &str) -> bool {
        self.image_path(target_id).exists()
    }

    /// Center-crops to 16:9, bounds the result to 1920x1080 and stores it
    /// as `{target_id}.jpg`. The staged original is removed afterwards.
    pub fn standardize_image(&self, staged: &Path, target_id: &str) -> EngineResult<PathBuf> {
        let source = image::open(staged)
            .map_err(|err| EngineError::Unexpected(format!("image decode failed: {err}")))?;
        let standardized = standardize(source);
        std::fs::create_dir_all(&self.image_dir)?;
        let destination = self.image_path(target_id);
        DynamicImage::ImageRgb8(standardized.into_rgb8())
            .save(&destination)
            .map_err(|err| EngineError::Unexpected(format!("image encode failed: {err}")))?;
        std::fs::remove_file(staged)?;
        debug!(target = target_id, path = %destination.display(), "image standardized");
        Ok(destination)
    }

    /// Drops leftover image downloads so the next target's download is
    /// unambiguous.
    pub fn clear_staging_images(&self) -> EngineResult<usize> {
        let mut removed = 0;
        if !self.staging_dir.exists() {
            return Ok(removed);
        }
        for entry in WalkDir::new(&self.staging_dir).max_depth(1) {
            let entry = entry.map_err(|err| EngineError::Unexpected(err.to_string()))?;
            if entry.file_type().is_file() && is_image(entry.path()) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn first_staged_image(&self) -> EngineResult<Option<PathBuf>> {
        if !self.staging_dir.exists() {
            return Ok(None);
        }
        let mut images: Vec<PathBuf> = WalkDir::new(&self.staging_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
            .map(|entry| entry.into_path())
            .collect();
        images.sort();
        Ok(images.into_iter().next())
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn relocate(from: &Path, to: &Path) -> EngineResult<()> {
    if std::fs::rename(from, to).is_err() {
        // Staging and data may live on different filesystems.
        std::fs::copy(from, to)?;
        std::fs::remove_file(from)?;
    }
    Ok(())
}

fn standardize(source: DynamicImage) -> DynamicImage {
    let width = source.width();
    let height = source.height();
    let cropped = if width * 9 > height * 16 {
        let new_width = (height * 16 / 9).max(1);
        source.crop_imm((width - new_width) / 2, 0, new_width, height)
    } else if width * 9 < height * 16 {
        let new_height = (width * 9 / 16).max(1);
        source.crop_imm(0, (height - new_height) / 2, width, new_height)
    } else {
        source
    };
    if cropped.width() > STANDARD_WIDTH {
        cropped.resize_exact(STANDARD_WIDTH, STANDARD_HEIGHT, FilterType::Lanczos3)
    } else {
        cropped
    }
}

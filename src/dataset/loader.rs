//! Dataset Loader
//!
//! Discovers training images in a flat (non-recursive) folder and decodes
//! them into RGB buffers.

use std::path::{Path, PathBuf};

use image::io::Reader as ImageReader;
use image::RgbImage;
use tracing::info;

use crate::utils::{Error, Result};

/// Accepted image file extensions (lowercased).
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// A flat folder of training images.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl ImageFolder {
    /// Scan a directory for image files. Non-recursive; only `.jpg`, `.jpeg`
    /// and `.png` (case-insensitive) are picked up.
    pub fn scan<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::Dataset(format!(
                "dataset directory does not exist: {:?}",
                root
            )));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(ext) = path.extension() {
                let ext = ext.to_string_lossy().to_lowercase();
                if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                    files.push(path);
                }
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(Error::Dataset(format!(
                "no images found in {:?} (expected .jpg/.jpeg/.png)",
                root
            )));
        }

        info!("Found {} training images in {:?}", files.len(), root);

        Ok(Self { root, files })
    }

    /// Number of images in the folder.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The discovered image paths, in sorted order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Root directory of the dataset.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decode one image to RGB. Decoding failures are per-sample errors; the
    /// caller skips the file and continues.
    pub fn decode(&self, path: &Path) -> Result<RgbImage> {
        let img = ImageReader::open(path)
            .map_err(|e| Error::Image(format!("failed to open {:?}: {}", path, e)))?
            .decode()
            .map_err(|e| Error::Image(format!("failed to decode {:?}: {}", path, e)))?;
        Ok(img.to_rgb8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::TempDir;

    fn write_test_image(dir: &Path, name: &str, size: u32) {
        let img = RgbImage::from_fn(size, size, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_scan_flat_folder() {
        let dir = TempDir::new().unwrap();
        write_test_image(dir.path(), "a.png", 16);
        write_test_image(dir.path(), "b.jpg", 16);
        write_test_image(dir.path(), "c.jpeg", 16);
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let folder = ImageFolder::scan(dir.path()).unwrap();
        assert_eq!(folder.len(), 3);
    }

    #[test]
    fn test_scan_is_not_recursive() {
        let dir = TempDir::new().unwrap();
        write_test_image(dir.path(), "top.png", 16);
        let sub = dir.path().join("nested");
        std::fs::create_dir(&sub).unwrap();
        write_test_image(&sub, "hidden.png", 16);

        let folder = ImageFolder::scan(dir.path()).unwrap();
        assert_eq!(folder.len(), 1);
    }

    #[test]
    fn test_scan_missing_dir_fails() {
        let err = ImageFolder::scan("/definitely/not/here").unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_scan_empty_dir_fails() {
        let dir = TempDir::new().unwrap();
        let err = ImageFolder::scan(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_decode_corrupt_file() {
        let dir = TempDir::new().unwrap();
        write_test_image(dir.path(), "good.png", 16);
        std::fs::write(dir.path().join("bad.jpg"), b"not a jpeg at all").unwrap();

        let folder = ImageFolder::scan(dir.path()).unwrap();
        assert_eq!(folder.len(), 2);

        let bad = folder
            .files()
            .iter()
            .find(|p| p.file_name().unwrap() == "bad.jpg")
            .unwrap()
            .clone();
        assert!(folder.decode(&bad).is_err());
    }
}

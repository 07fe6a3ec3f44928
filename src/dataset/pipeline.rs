//! Sample Pipeline
//!
//! Turns a folder of images into an endless, restartable sequence of
//! (input patch, teacher feature) pairs. Each cycle shuffles the file list and
//! visits every image once; per-image failures are reported as explicit skip
//! outcomes and never abort the stream.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use image::RgbImage;
use ndarray::{Array3, Array4, Axis};
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use crate::dataset::augmentation::{mixup, Augmentor};
use crate::dataset::loader::ImageFolder;
use crate::model::TeacherNetwork;
use crate::status::StatusSender;
use crate::utils::{Error, Result};

/// Number of recent patches kept for mixup partners.
const RECENT_CACHE_CAPACITY: usize = 10;

/// Probability of blending a fresh patch with a cached one.
const MIXUP_PROBABILITY: f64 = 0.3;

/// One training pair: an RGB patch and the teacher's feature map for it.
///
/// `patch` is `[3, S, S]` in `[0, 1]`; `features` is `[C, S/4, S/4]`.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub patch: Array3<f32>,
    pub features: Array3<f32>,
}

/// Outcome of processing one file: skips are data, not exceptions.
#[derive(Debug)]
pub enum SampleOutcome {
    Produced {
        file: PathBuf,
        sample: TrainingSample,
    },
    Skipped {
        file: PathBuf,
        reason: String,
    },
}

/// Endless augmented sample stream over an image folder.
pub struct SampleStream {
    id: String,
    folder: ImageFolder,
    augmentor: Augmentor,
    teacher: Arc<dyn TeacherNetwork>,
    rng: ChaCha8Rng,
    order: Vec<usize>,
    cursor: usize,
    recent: VecDeque<RgbImage>,
    status: StatusSender,
}

impl SampleStream {
    /// Build a stream producing `target_size` patches. Every stream carries a
    /// unique identifier so a rebuilt stream can never collide with a stale
    /// one.
    pub fn new(
        folder: ImageFolder,
        target_size: u32,
        teacher: Arc<dyn TeacherNetwork>,
        seed: u64,
        status: StatusSender,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let id = unique_stream_id(&mut rng);
        let mut order: Vec<usize> = (0..folder.len()).collect();
        order.shuffle(&mut rng);

        status.push(format!(
            "Sample stream {} ready: {} images, {}px patches",
            id,
            folder.len(),
            target_size
        ));

        Self {
            id,
            augmentor: Augmentor::new(target_size),
            folder,
            teacher,
            rng,
            order,
            cursor: 0,
            recent: VecDeque::with_capacity(RECENT_CACHE_CAPACITY),
            status,
        }
    }

    /// Unique identifier of this stream instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Images visited per full cycle.
    pub fn images_per_cycle(&self) -> usize {
        self.folder.len()
    }

    /// Re-shuffle and start a fresh cycle.
    pub fn restart(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
        debug!("Stream {} restarted with a fresh shuffle", self.id);
    }

    /// Process the next file in the cycle, restarting (with a re-shuffle)
    /// when the cycle is exhausted.
    pub fn next_outcome(&mut self) -> SampleOutcome {
        if self.cursor >= self.order.len() {
            self.restart();
        }
        let file = self.folder.files()[self.order[self.cursor]].clone();
        self.cursor += 1;

        match self.build_sample(&file) {
            Ok(sample) => SampleOutcome::Produced { file, sample },
            Err(e) => {
                let reason = e.to_string();
                warn!("Skipping {:?}: {}", file, reason);
                self.status.push(format!("Error processing {:?}: {}", file, reason));
                SampleOutcome::Skipped { file, reason }
            }
        }
    }

    /// Next successfully produced sample, skipping per-image failures.
    ///
    /// Failed files are tracked by identity, not by raw skip count, because a
    /// reshuffle at a cycle boundary can deal the same bad file twice in a
    /// row. Fails only once every distinct file in the folder has failed
    /// without a single sample produced, which means no image is usable.
    pub fn next_sample(&mut self) -> Result<TrainingSample> {
        let mut failed: HashSet<PathBuf> = HashSet::new();
        loop {
            match self.next_outcome() {
                SampleOutcome::Produced { sample, .. } => return Ok(sample),
                SampleOutcome::Skipped { file, .. } => {
                    failed.insert(file);
                    if failed.len() >= self.folder.len() {
                        return Err(Error::Dataset(format!(
                            "all {} images failed to produce samples",
                            self.folder.len()
                        )));
                    }
                }
            }
        }
    }

    /// Stack the next `batch_size` samples into `[N,3,S,S]` / `[N,C,S/4,S/4]`
    /// batch tensors.
    pub fn next_batch(&mut self, batch_size: usize) -> Result<(Array4<f32>, Array4<f32>)> {
        if batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }
        let first = self.next_sample()?;
        let (pc, ph, pw) = first.patch.dim();
        let (fc, fh, fw) = first.features.dim();

        let mut inputs = Array4::<f32>::zeros((batch_size, pc, ph, pw));
        let mut targets = Array4::<f32>::zeros((batch_size, fc, fh, fw));
        inputs.index_axis_mut(Axis(0), 0).assign(&first.patch);
        targets.index_axis_mut(Axis(0), 0).assign(&first.features);

        for i in 1..batch_size {
            let sample = self.next_sample()?;
            inputs.index_axis_mut(Axis(0), i).assign(&sample.patch);
            targets.index_axis_mut(Axis(0), i).assign(&sample.features);
        }
        Ok((inputs, targets))
    }

    fn build_sample(&mut self, file: &PathBuf) -> Result<TrainingSample> {
        let img = self.folder.decode(file)?;

        let mut patch = self.augmentor.extract_patch(&img, &mut self.rng);

        // Mixup against a recently produced patch, shape driven by the fresh
        // extraction.
        if !self.recent.is_empty() && self.rng.gen_bool(MIXUP_PROBABILITY) {
            let idx = self.rng.gen_range(0..self.recent.len());
            patch = mixup(&patch, &self.recent[idx], &mut self.rng);
        }

        let augmented = self.augmentor.apply(&patch, &mut self.rng);
        let final_patch = self.augmentor.finalize(&augmented);

        // Cache before teacher inference so the next item can mix with this
        // frame even if the oracle call fails.
        if self.recent.len() >= RECENT_CACHE_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(final_patch.clone());

        let patch_tensor = to_chw_tensor(&final_patch);
        let batch = patch_tensor.clone().insert_axis(Axis(0));
        let features = self.teacher.features(&batch)?;
        let features = features.index_axis(Axis(0), 0).to_owned();

        Ok(TrainingSample {
            patch: patch_tensor,
            features,
        })
    }
}

/// Convert an RGB image to a CHW float tensor in `[0, 1]`.
pub fn to_chw_tensor(img: &RgbImage) -> Array3<f32> {
    let (width, height) = img.dimensions();
    let mut tensor = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        tensor[[0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        tensor[[1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
        tensor[[2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
    }
    tensor
}

/// Unique stream identifier: unix timestamp plus a random alphanumeric
/// suffix, so rebuilt streams never reuse a name.
fn unique_stream_id<R: Rng>(rng: &mut R) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let suffix: String = rng
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("stream_{}_{}", timestamp, suffix.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::teacher::ProjectionTeacher;
    use std::path::Path;
    use tempfile::TempDir;

    const TARGET: u32 = 16;

    fn write_test_image(dir: &Path, name: &str, size: u32, tint: u8) {
        let img = RgbImage::from_fn(size, size, |x, y| {
            image::Rgb([tint, (x % 256) as u8, (y % 256) as u8])
        });
        img.save(dir.join(name)).unwrap();
    }

    fn stream_over(dir: &Path, seed: u64) -> SampleStream {
        let folder = ImageFolder::scan(dir).unwrap();
        let teacher: Arc<dyn TeacherNetwork> = Arc::new(ProjectionTeacher::new(8, 0));
        SampleStream::new(folder, TARGET, teacher, seed, StatusSender::sink())
    }

    #[test]
    fn test_sample_shapes_hold_invariant() {
        let dir = TempDir::new().unwrap();
        write_test_image(dir.path(), "a.png", 64, 10);

        let mut stream = stream_over(dir.path(), 1);
        let sample = stream.next_sample().unwrap();
        assert_eq!(sample.patch.dim(), (3, 16, 16));
        // Input:target spatial ratio is exactly 4:1.
        assert_eq!(sample.features.dim(), (8, 4, 4));
        assert!(sample.patch.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_full_cycle_visits_every_image_once() {
        let dir = TempDir::new().unwrap();
        for i in 0..6 {
            write_test_image(dir.path(), &format!("img{}.png", i), 48, i as u8 * 40);
        }

        let mut stream = stream_over(dir.path(), 2);
        let mut seen = Vec::new();
        for _ in 0..stream.images_per_cycle() {
            match stream.next_outcome() {
                SampleOutcome::Produced { file, .. } => seen.push(file),
                SampleOutcome::Skipped { file, reason } => {
                    panic!("unexpected skip of {:?}: {}", file, reason)
                }
            }
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_successive_cycles_differ_in_order() {
        let dir = TempDir::new().unwrap();
        for i in 0..8 {
            write_test_image(dir.path(), &format!("img{}.png", i), 48, i as u8 * 30);
        }

        let mut stream = stream_over(dir.path(), 3);
        let cycle = |s: &mut SampleStream| -> Vec<PathBuf> {
            (0..s.images_per_cycle())
                .map(|_| match s.next_outcome() {
                    SampleOutcome::Produced { file, .. } => file,
                    SampleOutcome::Skipped { file, .. } => file,
                })
                .collect()
        };

        let first = cycle(&mut stream);
        let second = cycle(&mut stream);
        assert_ne!(first, second, "two shuffled passes produced the same order");
    }

    #[test]
    fn test_corrupt_image_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        write_test_image(dir.path(), "good.png", 48, 10);
        std::fs::write(dir.path().join("bad.jpg"), b"garbage bytes").unwrap();

        let mut stream = stream_over(dir.path(), 4);
        // Both files appear per cycle; only the good one produces samples.
        // Crossing many cycle boundaries means some reshuffles will deal the
        // bad file twice in a row, which must still count as one bad file.
        for _ in 0..20 {
            let sample = stream.next_sample().unwrap();
            assert_eq!(sample.patch.dim(), (3, 16, 16));
        }
    }

    #[test]
    fn test_all_images_corrupt_reports_dataset_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad1.jpg"), b"nope").unwrap();
        std::fs::write(dir.path().join("bad2.png"), b"still nope").unwrap();

        let mut stream = stream_over(dir.path(), 5);
        assert!(matches!(stream.next_sample(), Err(Error::Dataset(_))));
    }

    #[test]
    fn test_batch_stacking() {
        let dir = TempDir::new().unwrap();
        write_test_image(dir.path(), "a.png", 64, 1);
        write_test_image(dir.path(), "b.png", 64, 2);

        let mut stream = stream_over(dir.path(), 6);
        let (inputs, targets) = stream.next_batch(4).unwrap();
        assert_eq!(inputs.dim(), (4, 3, 16, 16));
        assert_eq!(targets.dim(), (4, 8, 4, 4));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dir = TempDir::new().unwrap();
        write_test_image(dir.path(), "a.png", 64, 1);

        let mut stream = stream_over(dir.path(), 9);
        assert!(matches!(stream.next_batch(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_stream_ids_are_unique() {
        let dir = TempDir::new().unwrap();
        write_test_image(dir.path(), "a.png", 48, 1);

        let a = stream_over(dir.path(), 7);
        let b = stream_over(dir.path(), 8);
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("stream_"));
    }

    #[test]
    fn test_to_chw_tensor_layout() {
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(1, 0, image::Rgb([255, 0, 0]));
        let tensor = to_chw_tensor(&img);
        assert_eq!(tensor.dim(), (3, 2, 2));
        assert_eq!(tensor[[0, 0, 1]], 1.0);
        assert_eq!(tensor[[1, 0, 1]], 0.0);
    }
}

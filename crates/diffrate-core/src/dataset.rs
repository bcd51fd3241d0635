//! Image dataset seam, epoch samplers and batching.
//!
//! Real dataset loading and augmentation live outside this crate. They plug
//! in through [`ImageDataset`]; [`SyntheticImageDataset`] provides a
//! deterministic stand-in for tests and dry runs.
//!
//! ```text
//! ImageDataset ──► UniformSubsetSampler (train, sharded by rank, reshuffled per epoch)
//!              └─► ReplacementSampler   (eval, test_sampling_rate · len draws)
//!                        │
//!                        ▼
//!                   DataLoader ──► ImageBatch { images [B, C, H, W], labels [B] }
//! ```

use ndarray::{Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::error::DatasetError;

// ---------------------------------------------------------------------------
// Samples and the dataset trait
// ---------------------------------------------------------------------------

/// One normalised image and its class label.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSample {
    /// Pixels, `[C, H, W]`.
    pub image: Array3<f32>,
    /// Class index in `[0, num_classes)`.
    pub label: usize,
}

/// Indexed access to labelled images.
pub trait ImageDataset: Send + Sync {
    /// Total number of samples.
    fn len(&self) -> usize;

    /// Load the sample at position `idx`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::IndexOutOfBounds`] when `idx >= self.len()`.
    fn get(&self, idx: usize) -> Result<ImageSample, DatasetError>;

    /// Number of label classes.
    fn num_classes(&self) -> usize;

    /// Returns `true` when the dataset has no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// SyntheticImageDataset
// ---------------------------------------------------------------------------

/// Deterministic images computed from the sample index alone.
///
/// ```text
/// label(idx)        = idx mod num_classes
/// pixel(c, y, x)    = sin(0.13·x + 0.07·y + 0.5·c + 0.9·label) + 0.01·(idx mod 7)
/// ```
#[derive(Debug, Clone)]
pub struct SyntheticImageDataset {
    num_samples: usize,
    num_classes: usize,
    channels: usize,
    img_size: usize,
}

impl SyntheticImageDataset {
    /// `num_samples` RGB images of `img_size × img_size` over `num_classes` labels.
    pub fn new(num_samples: usize, num_classes: usize, img_size: usize) -> Self {
        SyntheticImageDataset { num_samples, num_classes: num_classes.max(1), channels: 3, img_size }
    }
}

impl ImageDataset for SyntheticImageDataset {
    fn len(&self) -> usize {
        self.num_samples
    }

    fn get(&self, idx: usize) -> Result<ImageSample, DatasetError> {
        if idx >= self.num_samples {
            return Err(DatasetError::IndexOutOfBounds { idx, len: self.num_samples });
        }
        let label = idx % self.num_classes;
        let jitter = 0.01 * (idx % 7) as f32;
        let image = Array3::from_shape_fn((self.channels, self.img_size, self.img_size), |(c, y, x)| {
            (0.13 * x as f32 + 0.07 * y as f32 + 0.5 * c as f32 + 0.9 * label as f32).sin() + jitter
        });
        Ok(ImageSample { image, label })
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn name(&self) -> &str {
        "SyntheticImageDataset"
    }
}

// ---------------------------------------------------------------------------
// Samplers
// ---------------------------------------------------------------------------

fn check_rate(rate: f64) -> Result<(), DatasetError> {
    if rate <= 0.0 || rate > 1.0 || !rate.is_finite() {
        return Err(DatasetError::InvalidSamplingRate(rate));
    }
    Ok(())
}

/// Every `⌊1 / rate⌋`-th sample, split across replicas.
#[derive(Debug, Clone)]
pub struct UniformSubsetSampler {
    indices: Vec<usize>,
    seed: u64,
}

impl UniformSubsetSampler {
    /// Subset of a `len`-sample dataset for replica `rank` of `world_size`.
    pub fn new(len: usize, rate: f64, rank: usize, world_size: usize, seed: u64) -> Result<Self, DatasetError> {
        check_rate(rate)?;
        if len == 0 {
            return Err(DatasetError::Empty);
        }
        let step = ((1.0 / rate) as usize).max(1);
        let world = world_size.max(1);
        let indices = (0..len).step_by(step).skip(rank).step_by(world).collect();
        Ok(UniformSubsetSampler { indices, seed })
    }

    /// Samples this replica visits per epoch.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether this replica has nothing to visit.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Visiting order for `epoch`, reshuffled deterministically every epoch.
    pub fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let mut order = self.indices.clone();
        xorshift_shuffle(&mut order, self.seed.wrapping_add(epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        order
    }
}

/// `⌊rate · len⌋` uniform draws with replacement (at least one).
#[derive(Debug, Clone)]
pub struct ReplacementSampler {
    indices: Vec<usize>,
}

impl ReplacementSampler {
    /// Draws for a `len`-sample dataset.
    pub fn new(len: usize, rate: f64, seed: u64) -> Result<Self, DatasetError> {
        check_rate(rate)?;
        if len == 0 {
            return Err(DatasetError::Empty);
        }
        let n = ((rate * len as f64) as usize).max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        let indices = (0..n).map(|_| rng.gen_range(0..len)).collect();
        Ok(ReplacementSampler { indices })
    }

    /// Drawn indices in visiting order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

fn xorshift_shuffle(indices: &mut [usize], seed: u64) {
    let n = indices.len();
    if n <= 1 {
        return;
    }
    let mut state = if seed == 0 { 0x853c49e6748fea9b } else { seed };
    for i in (1..n).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let j = (state as usize) % (i + 1);
        indices.swap(i, j);
    }
}

// ---------------------------------------------------------------------------
// DataLoader
// ---------------------------------------------------------------------------

/// A stacked mini-batch.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    /// Images, `[B, C, H, W]`.
    pub images: Array4<f32>,
    /// Labels, one per image.
    pub labels: Vec<i64>,
}

impl ImageBatch {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Batches a dataset in a given index order.
pub struct DataLoader<'a> {
    dataset: &'a dyn ImageDataset,
    indices: Vec<usize>,
    batch_size: usize,
}

impl<'a> DataLoader<'a> {
    /// Loader visiting `indices` in order, `batch_size` at a time. The last
    /// batch may be smaller.
    pub fn new(dataset: &'a dyn ImageDataset, indices: Vec<usize>, batch_size: usize) -> Self {
        DataLoader { dataset, indices, batch_size: batch_size.max(1) }
    }

    /// Number of batches yielded.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Iterate over stacked batches.
    pub fn iter(&self) -> DataLoaderIter<'_> {
        DataLoaderIter { dataset: self.dataset, indices: &self.indices, batch_size: self.batch_size, cursor: 0 }
    }
}

/// Iterator returned by [`DataLoader::iter`].
pub struct DataLoaderIter<'a> {
    dataset: &'a dyn ImageDataset,
    indices: &'a [usize],
    batch_size: usize,
    cursor: usize,
}

impl Iterator for DataLoaderIter<'_> {
    type Item = Result<ImageBatch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.indices.len() {
            let end = (self.cursor + self.batch_size).min(self.indices.len());
            let batch_indices = &self.indices[self.cursor..end];
            self.cursor = end;

            let mut samples = Vec::with_capacity(batch_indices.len());
            for &idx in batch_indices {
                match self.dataset.get(idx) {
                    Ok(sample) => samples.push((idx, sample)),
                    Err(e) => warn!("Skipping sample {idx}: {e}"),
                }
            }
            if !samples.is_empty() {
                return Some(stack(samples));
            }
        }
        None
    }
}

fn stack(samples: Vec<(usize, ImageSample)>) -> Result<ImageBatch, DatasetError> {
    let expected = samples[0].1.image.shape().to_vec();
    for (idx, s) in &samples {
        if s.image.shape() != expected.as_slice() {
            return Err(DatasetError::InconsistentShape { idx: *idx, expected, actual: s.image.shape().to_vec() });
        }
    }
    let (c, h, w) = (expected[0], expected[1], expected[2]);
    let mut images = Array4::<f32>::zeros((samples.len(), c, h, w));
    let mut labels = Vec::with_capacity(samples.len());
    for (mut slot, (_, s)) in images.axis_iter_mut(Axis(0)).zip(samples) {
        slot.assign(&s.image);
        labels.push(s.label as i64);
    }
    Ok(ImageBatch { images, labels })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_is_deterministic_and_bounded() {
        let ds = SyntheticImageDataset::new(10, 4, 8);
        let a = ds.get(3).unwrap();
        assert_eq!(a, ds.get(3).unwrap());
        assert_eq!(a.label, 3);
        assert_eq!(a.image.shape(), &[3, 8, 8]);
        assert!(matches!(ds.get(10), Err(DatasetError::IndexOutOfBounds { idx: 10, len: 10 })));
    }

    #[test]
    fn uniform_subset_steps_and_shards() {
        let s = UniformSubsetSampler::new(100, 0.1, 0, 1, 0).unwrap();
        let mut idx = s.epoch_indices(0);
        idx.sort_unstable();
        assert_eq!(idx, (0..100).step_by(10).collect::<Vec<_>>());

        let r0 = UniformSubsetSampler::new(100, 0.1, 0, 2, 0).unwrap();
        let r1 = UniformSubsetSampler::new(100, 0.1, 1, 2, 0).unwrap();
        assert_eq!(r0.len() + r1.len(), 10);
        let mut all: Vec<usize> = r0.epoch_indices(1).into_iter().chain(r1.epoch_indices(1)).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn epochs_reshuffle_deterministically() {
        let s = UniformSubsetSampler::new(1000, 0.5, 0, 1, 3).unwrap();
        assert_eq!(s.epoch_indices(2), s.epoch_indices(2));
        assert_ne!(s.epoch_indices(1), s.epoch_indices(2));
    }

    #[test]
    fn replacement_sampler_size_and_range() {
        let s = ReplacementSampler::new(50, 0.1, 0).unwrap();
        assert_eq!(s.indices().len(), 5);
        assert!(s.indices().iter().all(|&i| i < 50));
        assert_eq!(ReplacementSampler::new(5, 0.01, 0).unwrap().indices().len(), 1);
    }

    #[test]
    fn invalid_rates_rejected() {
        assert!(matches!(UniformSubsetSampler::new(10, 0.0, 0, 1, 0), Err(DatasetError::InvalidSamplingRate(_))));
        assert!(matches!(ReplacementSampler::new(10, 1.5, 0), Err(DatasetError::InvalidSamplingRate(_))));
        assert!(matches!(ReplacementSampler::new(0, 0.5, 0), Err(DatasetError::Empty)));
    }

    #[test]
    fn loader_stacks_batches() {
        let ds = SyntheticImageDataset::new(5, 3, 4);
        let loader = DataLoader::new(&ds, vec![0, 1, 2, 3, 4], 2);
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<ImageBatch> = loader.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(batches[0].images.shape(), &[2, 3, 4, 4]);
        assert_eq!(batches[2].labels, vec![1]);
    }

    #[test]
    fn loader_skips_missing_samples() {
        let ds = SyntheticImageDataset::new(2, 2, 4);
        let loader = DataLoader::new(&ds, vec![0, 7, 1], 2);
        let total: usize = loader.iter().map(|b| b.unwrap().len()).sum();
        assert_eq!(total, 2);
    }
}

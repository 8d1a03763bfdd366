use crate::{
    error::{CarStateError, Result},
    transform::{decode_image, ImageTransform},
};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Tensor},
};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

const VALID_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Binary labels of one image: `0` = clean / intact, `1` = dirty / damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelPair {
    pub cleanliness: u8,
    pub integrity: u8,
}

impl LabelPair {
    pub fn as_floats(self) -> [f32; 2] {
        [self.cleanliness as f32, self.integrity as f32]
    }
}

/// Dataset sub-directory, one per combination of the two labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    CleanIntact,
    CleanDamaged,
    DirtyIntact,
    DirtyDamaged,
}

impl Category {
    /// Scan order.
    pub const ALL: [Category; 4] = [
        Category::CleanIntact,
        Category::CleanDamaged,
        Category::DirtyIntact,
        Category::DirtyDamaged,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Category::CleanIntact => "clean_intact",
            Category::CleanDamaged => "clean_damaged",
            Category::DirtyIntact => "dirty_intact",
            Category::DirtyDamaged => "dirty_damaged",
        }
    }

    pub fn labels(self) -> LabelPair {
        let (cleanliness, integrity) = match self {
            Category::CleanIntact => (0, 0),
            Category::CleanDamaged => (0, 1),
            Category::DirtyIntact => (1, 0),
            Category::DirtyDamaged => (1, 1),
        };
        LabelPair {
            cleanliness,
            integrity,
        }
    }

    pub fn from_labels(labels: LabelPair) -> Option<Category> {
        Self::ALL.into_iter().find(|c| c.labels() == labels)
    }

    pub fn from_dir_name(name: &str) -> Option<Category> {
        Self::ALL.into_iter().find(|c| c.dir_name() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CarImageItem {
    pub image_path: PathBuf,
    pub labels: LabelPair,
}

impl CarImageItem {
    pub fn load(&self, transform: &dyn ImageTransform) -> Result<Sample> {
        let image = decode_image(&self.image_path)?;
        Ok(Sample {
            image: transform.apply(image),
            labels: self.labels.as_floats(),
        })
    }
}

/// One decoded, transformed training example.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Normalized CHW data.
    pub image: Vec<f32>,
    /// `[cleanliness, integrity]`.
    pub labels: [f32; 2],
}

#[derive(Debug, Clone)]
pub struct CarStateDataset {
    root: PathBuf,
    items: Vec<CarImageItem>,
    transform: Arc<dyn ImageTransform>,
}

impl CarStateDataset {
    /// Scans `root/<category>/` for images. Missing category directories are skipped.
    pub fn new<P: AsRef<Path>>(root: P, transform: Arc<dyn ImageTransform>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tracing::info!("Loading dataset from {}", root.display());

        let mut items = Vec::new();
        for category in Category::ALL {
            let dir = root.join(category.dir_name());
            if !dir.is_dir() {
                tracing::debug!("Category directory {} not found, skipping", dir.display());
                continue;
            }

            let labels = category.labels();
            items.extend(
                Self::collect_image_files(&dir)?
                    .into_iter()
                    .map(|image_path| CarImageItem { image_path, labels }),
            );
        }

        let dataset = Self {
            root,
            items,
            transform,
        };
        dataset.log_statistics();
        Ok(dataset)
    }

    fn collect_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let accepted = path
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
                .is_some_and(|ext| VALID_EXTENSIONS.contains(&ext.as_str()));
            if accepted {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    fn log_statistics(&self) {
        tracing::info!("Dataset: {} images", self.items.len());
        for category in Category::ALL {
            let count = self
                .items
                .iter()
                .filter(|item| item.labels == category.labels())
                .count();
            tracing::info!("  {}: {}", category.dir_name(), count);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn items(&self) -> &[CarImageItem] {
        &self.items
    }

    /// Decodes and transforms sample `index`.
    pub fn sample(&self, index: usize) -> Result<Sample> {
        self.items
            .get(index)
            .ok_or(CarStateError::IndexOutOfRange {
                index,
                len: self.items.len(),
            })?
            .load(self.transform.as_ref())
    }
}

impl Dataset<CarImageItem> for CarStateDataset {
    fn get(&self, index: usize) -> Option<CarImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.len()
    }
}

#[derive(Debug, Clone)]
pub struct CarStateBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub cleanliness: Tensor<B, 2>,
    pub integrity: Tensor<B, 2>,
}

/// Decodes, augments and stacks items. Undecodable items are logged and left
/// out; a batch with nothing decodable comes out as `None`.
#[derive(Debug, Clone)]
pub struct CarStateBatcher<B: Backend> {
    pub image_size: usize,
    transform: Arc<dyn ImageTransform>,
    device: B::Device,
}

impl<B: Backend> CarStateBatcher<B> {
    pub fn new(transform: Arc<dyn ImageTransform>, device: B::Device) -> Self {
        Self {
            image_size: transform.resolution(),
            transform,
            device,
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

impl<B: Backend> Batcher<B, CarImageItem, Option<CarStateBatch<B>>> for CarStateBatcher<B> {
    fn batch(&self, items: Vec<CarImageItem>, device: &B::Device) -> Option<CarStateBatch<B>> {
        let samples: Vec<Sample> = items
            .par_iter()
            .filter_map(|item| {
                item.load(self.transform.as_ref())
                    .map_err(|e| tracing::warn!("Skipping {}: {}", item.image_path.display(), e))
                    .ok()
            })
            .collect();

        stack_samples(samples, self.image_size, device)
    }
}

fn stack_samples<B: Backend>(samples: Vec<Sample>, image_size: usize, device: &B::Device) -> Option<CarStateBatch<B>> {
    if samples.is_empty() {
        return None;
    }

    let batch_size = samples.len();
    let frame_size = 3 * image_size * image_size;

    let mut images_data = Vec::with_capacity(batch_size * frame_size);
    let mut cleanliness_data = Vec::with_capacity(batch_size);
    let mut integrity_data = Vec::with_capacity(batch_size);

    for sample in &samples {
        images_data.extend_from_slice(&sample.image);
        cleanliness_data.push(sample.labels[0]);
        integrity_data.push(sample.labels[1]);
    }

    let images = Tensor::<B, 1>::from_floats(images_data.as_slice(), device)
        .reshape([batch_size, 3, image_size, image_size]);
    let cleanliness = Tensor::<B, 1>::from_floats(cleanliness_data.as_slice(), device).reshape([batch_size, 1]);
    let integrity = Tensor::<B, 1>::from_floats(integrity_data.as_slice(), device).reshape([batch_size, 1]);

    Some(CarStateBatch {
        images,
        cleanliness,
        integrity,
    })
}

//! Shared feature extractor: an EfficientNet-style stack of MBConv blocks
//! ending in global average pooling, with no classification layer.

use crate::error::{CarStateError, Result};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Sigmoid,
    },
    prelude::*,
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{activation::silu, backend::Backend, module::adaptive_avg_pool2d, Tensor},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One stage of repeated MBConv blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub expand_ratio: usize,
    pub channels: usize,
    pub repeats: usize,
    pub stride: usize,
    pub kernel: usize,
}

impl StageConfig {
    const fn new(expand_ratio: usize, channels: usize, repeats: usize, stride: usize, kernel: usize) -> Self {
        Self {
            expand_ratio,
            channels,
            repeats,
            stride,
            kernel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub stem_channels: usize,
    pub stages: Vec<StageConfig>,
    pub num_features: usize,
    /// Squeeze-excite reduction factor; 0 disables squeeze-excite.
    pub se_reduction: usize,
}

impl BackboneConfig {
    pub fn efficientnet_b0() -> Self {
        Self {
            stem_channels: 32,
            stages: vec![
                StageConfig::new(1, 16, 1, 1, 3),
                StageConfig::new(6, 24, 2, 2, 3),
                StageConfig::new(6, 40, 2, 2, 5),
                StageConfig::new(6, 80, 3, 2, 3),
                StageConfig::new(6, 112, 3, 1, 5),
                StageConfig::new(6, 192, 4, 2, 5),
                StageConfig::new(6, 320, 1, 1, 3),
            ],
            num_features: 1280,
            se_reduction: 4,
        }
    }

    pub fn tiny() -> Self {
        Self {
            stem_channels: 8,
            stages: vec![StageConfig::new(1, 8, 1, 1, 3), StageConfig::new(2, 16, 1, 2, 3)],
            num_features: 16,
            se_reduction: 4,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stem_channels == 0 || self.num_features == 0 || self.stages.is_empty() {
            return Err(CarStateError::InvalidConfig(
                "backbone needs a stem, at least one stage and a feature width".into(),
            ));
        }
        for stage in &self.stages {
            if stage.expand_ratio == 0
                || stage.channels == 0
                || stage.repeats == 0
                || stage.stride == 0
                || stage.kernel == 0
            {
                return Err(CarStateError::InvalidConfig(format!(
                    "invalid backbone stage {:?}",
                    stage
                )));
            }
        }
        Ok(())
    }

    /// Builds the backbone and fills its parameters from `init`.
    pub fn init<B: Backend>(&self, init: &BackboneInit, device: &B::Device) -> Result<EfficientNet<B>> {
        let backbone = EfficientNet::new(self, device);
        match init {
            BackboneInit::Random => Ok(backbone),
            BackboneInit::Pretrained(path) => {
                let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
                let backbone = backbone.load_file(path.clone(), &recorder, device).map_err(|e| {
                    CarStateError::ModelUnavailable(format!(
                        "backbone weights {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                tracing::info!("Loaded pretrained backbone from {}", path.display());
                Ok(backbone)
            }
        }
    }
}

/// Where the backbone's starting parameters come from.
///
/// `Pretrained` expects a record saved from an [`EfficientNet`] built with the
/// same [`BackboneConfig`] (weights converted from an ImageNet checkpoint).
#[derive(Debug, Clone, PartialEq)]
pub enum BackboneInit {
    Random,
    Pretrained(PathBuf),
}

#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    sigmoid: Sigmoid,
}

impl<B: Backend> SqueezeExcite<B> {
    pub fn new(channels: usize, reduction: usize, device: &B::Device) -> Self {
        let reduced_channels = (channels / reduction).max(1);
        Self {
            fc1: LinearConfig::new(channels, reduced_channels).init(device),
            fc2: LinearConfig::new(reduced_channels, channels).init(device),
            sigmoid: Sigmoid::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, _, _] = x.dims();

        let y = adaptive_avg_pool2d(x.clone(), [1, 1]).reshape([batch_size, channels]);
        let y = silu(self.fc1.forward(y));
        let y = self.sigmoid.forward(self.fc2.forward(y));

        x * y.reshape([batch_size, channels, 1, 1])
    }
}

#[derive(Module, Debug)]
pub struct MBConv<B: Backend> {
    expand_conv: Option<Conv2d<B>>,
    depthwise_conv: Conv2d<B>,
    squeeze_excite: Option<SqueezeExcite<B>>,
    project_conv: Conv2d<B>,
    use_residual: bool,
}

impl<B: Backend> MBConv<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        se_reduction: usize,
        device: &B::Device,
    ) -> Self {
        let expanded_channels = in_channels * expand_ratio;

        let expand_conv = (expand_ratio != 1)
            .then(|| Conv2dConfig::new([in_channels, expanded_channels], [1, 1]).init(device));

        let depthwise_conv = Conv2dConfig::new([expanded_channels, expanded_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Same)
            .with_groups(expanded_channels)
            .init(device);

        let squeeze_excite =
            (se_reduction > 0).then(|| SqueezeExcite::new(expanded_channels, se_reduction, device));

        let project_conv = Conv2dConfig::new([expanded_channels, out_channels], [1, 1]).init(device);

        Self {
            expand_conv,
            depthwise_conv,
            squeeze_excite,
            project_conv,
            use_residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = self.use_residual.then(|| x.clone());

        let mut y = match &self.expand_conv {
            Some(conv) => silu(conv.forward(x)),
            None => x,
        };

        y = silu(self.depthwise_conv.forward(y));

        if let Some(se) = &self.squeeze_excite {
            y = se.forward(y);
        }

        y = self.project_conv.forward(y);

        match identity {
            Some(id) => y + id,
            None => y,
        }
    }
}

#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    conv_stem: Conv2d<B>,
    blocks: Vec<MBConv<B>>,
    conv_head: Conv2d<B>,
    num_features: usize,
}

impl<B: Backend> EfficientNet<B> {
    pub fn new(config: &BackboneConfig, device: &B::Device) -> Self {
        let conv_stem = Conv2dConfig::new([3, config.stem_channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        let mut blocks = Vec::new();
        let mut in_channels = config.stem_channels;

        for stage in &config.stages {
            for i in 0..stage.repeats {
                let stride = if i == 0 { stage.stride } else { 1 };
                blocks.push(MBConv::new(
                    in_channels,
                    stage.channels,
                    stage.expand_ratio,
                    stage.kernel,
                    stride,
                    config.se_reduction,
                    device,
                ));
                in_channels = stage.channels;
            }
        }

        let conv_head = Conv2dConfig::new([in_channels, config.num_features], [1, 1]).init(device);

        Self {
            conv_stem,
            blocks,
            conv_head,
            num_features: config.num_features,
        }
    }

    /// `[N, 3, H, W]` images to `[N, num_features]` embeddings.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = silu(self.conv_stem.forward(x));

        for block in &self.blocks {
            x = block.forward(x);
        }

        let features = silu(self.conv_head.forward(x));
        let batch_size = features.dims()[0];

        adaptive_avg_pool2d(features, [1, 1]).reshape([batch_size, self.num_features])
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }
}

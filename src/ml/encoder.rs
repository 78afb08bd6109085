// ============================================================
// Layer 5 — Residual Encoder
// ============================================================
// A compact ResNet-style encoder for multi-band tiles.
//
//   input [N, H, W, bands]          (NHWC, as the data layer yields)
//     │ permute → [N, bands, H, W]
//     ▼
//   stem: 3×3 conv, stride 2, ReLU  → conv1_relu
//   stage 2: 2 blocks, width w      → conv2_block2_out
//   stage 3: 3 blocks, 2w, stride 2 → conv3_block3_out
//   stage 4: 5 blocks, 4w, stride 2 → conv4_block5_out
//   stage 5: 3 blocks, 8w, stride 2 → conv5_block3_out
//
// Each block is  relu(conv3x3(relu(conv3x3(x))) + shortcut(x)),
// where the shortcut is a 1×1 projection whenever the stride or
// width changes. The output names follow the Keras ResNet
// naming, so layer loss weights written for the full-size
// encoder work unchanged.
//
// Every stage output is returned, not just the last one: the
// contrastive loss is taken at several depths at once.

use burn::{
    module::ParamId,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

use crate::domain::layers::REPRESENTATION_LAYERS;

/// Residual blocks per stage, stages 2 to 5
const STAGE_BLOCKS: [usize; 4] = [2, 3, 5, 3];
/// Width multiplier per stage
const STAGE_WIDTHS: [usize; 4] = [1, 2, 4, 8];
/// Spatial stride of the first block of each stage
const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

#[derive(Config, Debug)]
pub struct EncoderConfig {
    /// Number of spectral bands in the input
    pub n_bands: usize,
    /// Channel count of the stem; stage widths are multiples of it
    #[config(default = 16)]
    pub width: usize,
}

impl EncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ContrastiveEncoder<B> {
        let stem = conv3x3(self.n_bands, self.width, 2, device);

        let mut in_channels = self.width;
        let stages = (0..STAGE_BLOCKS.len())
            .map(|s| {
                let out_channels = self.width * STAGE_WIDTHS[s];
                let blocks = (0..STAGE_BLOCKS[s])
                    .map(|b| {
                        let stride = if b == 0 { STAGE_STRIDES[s] } else { 1 };
                        let block = ResidualBlock::new(in_channels, out_channels, stride, device);
                        in_channels = out_channels;
                        block
                    })
                    .collect();
                Stage { blocks }
            })
            .collect();

        ContrastiveEncoder { stem, stages }
    }

    /// Channel count of a representation layer
    pub fn channels(&self, layer: &str) -> Option<usize> {
        let i = REPRESENTATION_LAYERS.iter().position(|name| *name == layer)?;
        Some(if i == 0 { self.width } else { self.width * STAGE_WIDTHS[i - 1] })
    }
}

fn conv3x3<B: Backend>(inputs: usize, outputs: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([inputs, outputs], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub conv1:    Conv2d<B>,
    pub conv2:    Conv2d<B>,
    pub shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(inputs: usize, outputs: usize, stride: usize, device: &B::Device) -> Self {
        let shortcut = (stride != 1 || inputs != outputs).then(|| {
            Conv2dConfig::new([inputs, outputs], [1, 1])
                .with_stride([stride, stride])
                .init(device)
        });
        Self {
            conv1: conv3x3(inputs, outputs, stride, device),
            conv2: conv3x3(outputs, outputs, 1, device),
            shortcut,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self.conv2.forward(relu(self.conv1.forward(x.clone())));
        let skip = match &self.shortcut {
            Some(projection) => projection.forward(x),
            None => x,
        };
        relu(h + skip)
    }
}

#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    pub blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> Stage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct ContrastiveEncoder<B: Backend> {
    pub stem:   Conv2d<B>,
    pub stages: Vec<Stage<B>>,
}

/// Encoder activations for one batch, keyed by layer name.
/// Tensors are NCHW: [batch, channels, height, width].
#[derive(Debug, Clone)]
pub struct Representations<B: Backend> {
    layers: Vec<(&'static str, Tensor<B, 4>)>,
}

impl<B: Backend> Representations<B> {
    pub fn get(&self, layer: &str) -> Option<&Tensor<B, 4>> {
        self.layers.iter().find(|(name, _)| *name == layer).map(|(_, t)| t)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.layers.iter().map(|(name, _)| *name)
    }
}

/// A trainable parameter, by id and tensor rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRef {
    Kernel(ParamId),
    Bias(ParamId),
}

impl<B: Backend> ContrastiveEncoder<B> {
    /// images: [batch, H, W, bands] → activations at every representation layer
    pub fn forward(&self, images: Tensor<B, 4>) -> Representations<B> {
        let mut x = relu(self.stem.forward(images.permute([0, 3, 1, 2])));

        let mut layers = Vec::with_capacity(REPRESENTATION_LAYERS.len());
        layers.push((REPRESENTATION_LAYERS[0], x.clone()));

        for (stage, name) in self.stages.iter().zip(&REPRESENTATION_LAYERS[1..]) {
            x = stage.forward(x);
            layers.push((*name, x.clone()));
        }

        Representations { layers }
    }

    /// Every trainable parameter of the encoder.
    pub fn param_refs(&self) -> Vec<ParamRef> {
        let mut refs = Vec::new();
        collect_conv(&self.stem, &mut refs);
        for block in self.stages.iter().flat_map(|s| s.blocks.iter()) {
            collect_conv(&block.conv1, &mut refs);
            collect_conv(&block.conv2, &mut refs);
            if let Some(projection) = &block.shortcut {
                collect_conv(projection, &mut refs);
            }
        }
        refs
    }
}

fn collect_conv<B: Backend>(conv: &Conv2d<B>, refs: &mut Vec<ParamRef>) {
    refs.push(ParamRef::Kernel(conv.weight.id));
    if let Some(bias) = &conv.bias {
        refs.push(ParamRef::Bias(bias.id));
    }
}

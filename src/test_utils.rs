//! Host fixtures shared by the unit tests.

use candle_core::{Device, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, LayerNorm, Linear};

use crate::host::{HostLayer, ModuleNode};

pub(crate) fn linear_layer(in_features: usize, out_features: usize, device: &Device) -> Result<HostLayer> {
    let weight = Tensor::randn(0f32, 0.1, (out_features, in_features), device)?;
    let bias = Tensor::randn(0f32, 0.1, out_features, device)?;
    Ok(HostLayer::Linear(Linear::new(weight, Some(bias))))
}

pub(crate) fn conv_layer(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    device: &Device,
) -> Result<HostLayer> {
    let weight = Tensor::randn(
        0f32,
        0.1,
        (out_channels, in_channels, kernel_size, kernel_size),
        device,
    )?;
    let bias = Tensor::randn(0f32, 0.1, out_channels, device)?;
    let config = Conv2dConfig {
        padding: kernel_size / 2,
        stride,
        ..Default::default()
    };
    Ok(HostLayer::Conv2d(Conv2d::new(weight, Some(bias), config)))
}

fn layer_norm(dim: usize, device: &Device) -> Result<HostLayer> {
    let weight = Tensor::ones(dim, candle_core::DType::F32, device)?;
    let bias = Tensor::zeros(dim, candle_core::DType::F32, device)?;
    Ok(HostLayer::other("LayerNorm", LayerNorm::new(weight, bias, 1e-5)))
}

fn group_norm(channels: usize, groups: usize, device: &Device) -> Result<HostLayer> {
    let weight = Tensor::ones(channels, candle_core::DType::F32, device)?;
    let bias = Tensor::zeros(channels, candle_core::DType::F32, device)?;
    Ok(HostLayer::other(
        "GroupNorm",
        GroupNorm::new(weight, bias, channels, groups, 1e-5)?,
    ))
}

pub(crate) fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

/// A single CLIP encoder layer. `self_attn` children are declared in the
/// order the reference text encoder uses (k, v, q, out).
pub(crate) fn text_encoder(device: &Device) -> Result<ModuleNode> {
    let self_attn = ModuleNode::container("CLIPAttention")
        .with_child("k_proj", ModuleNode::leaf(linear_layer(16, 16, device)?))
        .with_child("v_proj", ModuleNode::leaf(linear_layer(16, 16, device)?))
        .with_child("q_proj", ModuleNode::leaf(linear_layer(16, 16, device)?))
        .with_child("out_proj", ModuleNode::leaf(linear_layer(16, 16, device)?));
    let mlp = ModuleNode::container("CLIPMLP")
        .with_child("fc1", ModuleNode::leaf(linear_layer(16, 32, device)?))
        .with_child("fc2", ModuleNode::leaf(linear_layer(32, 16, device)?));
    let layer = ModuleNode::container("CLIPEncoderLayer")
        .with_child("self_attn", self_attn)
        .with_child("layer_norm1", ModuleNode::leaf(layer_norm(16, device)?))
        .with_child("mlp", mlp)
        .with_child("layer_norm2", ModuleNode::leaf(layer_norm(16, device)?));

    Ok(ModuleNode::container("CLIPTextModel")
        .with_child(
            "encoder",
            ModuleNode::container("CLIPEncoder").with_child(
                "layers",
                ModuleNode::container("ModuleList").with_child("0", layer),
            ),
        )
        .with_child("final_layer_norm", ModuleNode::leaf(layer_norm(16, device)?)))
}

/// A trimmed U-Net: one resnet block, one downsampler, one attention block.
pub(crate) fn unet(device: &Device) -> Result<ModuleNode> {
    let resnet = ModuleNode::container("ResnetBlock2D")
        .with_child("norm1", ModuleNode::leaf(group_norm(8, 2, device)?))
        .with_child("conv1", ModuleNode::leaf(conv_layer(8, 16, 3, 1, device)?))
        .with_child("time_emb_proj", ModuleNode::leaf(linear_layer(32, 16, device)?))
        .with_child("conv2", ModuleNode::leaf(conv_layer(16, 16, 3, 1, device)?))
        .with_child("conv_shortcut", ModuleNode::leaf(conv_layer(8, 16, 1, 1, device)?));
    let downsampler = ModuleNode::container("Downsample2D")
        .with_child("conv", ModuleNode::leaf(conv_layer(16, 16, 3, 2, device)?));
    let down_block = ModuleNode::container("DownBlock2D")
        .with_child("resnets", ModuleNode::container("ModuleList").with_child("0", resnet))
        .with_child(
            "downsamplers",
            ModuleNode::container("ModuleList").with_child("0", downsampler),
        );

    let to_out = ModuleNode::container("ModuleList")
        .with_child("0", ModuleNode::leaf(linear_layer(16, 16, device)?))
        .with_child(
            "1",
            ModuleNode::leaf(HostLayer::other(
                "Dropout",
                |xs: &Tensor| -> Result<Tensor> { Ok(xs.clone()) },
            )),
        );
    let attn = ModuleNode::container("Attention")
        .with_child("to_q", ModuleNode::leaf(linear_layer(16, 16, device)?))
        .with_child("to_k", ModuleNode::leaf(linear_layer(32, 16, device)?))
        .with_child("to_v", ModuleNode::leaf(linear_layer(32, 16, device)?))
        .with_child("to_out", to_out);

    Ok(ModuleNode::container("UNet2DConditionModel")
        .with_child("conv_in", ModuleNode::leaf(conv_layer(4, 8, 3, 1, device)?))
        .with_child(
            "down_blocks",
            ModuleNode::container("ModuleList").with_child("0", down_block),
        )
        .with_child(
            "mid_block",
            ModuleNode::container("UNetMidBlock2DCrossAttn").with_child("attn", attn),
        ))
}

//! Basic network usage example.
//!
//! This example demonstrates:
//! - Describing a host model as a module tree
//! - Building and applying an adapter network from trainer-style args
//! - Running one optimizer step through the host's own forward path
//! - Saving the adapters and rebuilding a network from the file

use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Optimizer, SGD};
use lycon::{
    create_network, create_network_from_weights, format_parameter_count, HostLayer, ModuleNode,
    NetworkOptions,
};
use tracing_subscriber::EnvFilter;

fn linear(in_features: usize, out_features: usize, device: &Device) -> Result<ModuleNode> {
    let weight = Tensor::randn(0f32, 0.02, (out_features, in_features), device)?;
    Ok(ModuleNode::leaf(HostLayer::Linear(Linear::new(weight, None))))
}

fn conv(channels: usize, kernel_size: usize, device: &Device) -> Result<ModuleNode> {
    let weight = Tensor::randn(0f32, 0.02, (channels, channels, kernel_size, kernel_size), device)?;
    let config = Conv2dConfig {
        padding: kernel_size / 2,
        ..Default::default()
    };
    Ok(ModuleNode::leaf(HostLayer::Conv2d(Conv2d::new(weight, None, config))))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    println!("=== Basic Network Example ===\n");
    let device = Device::Cpu;

    // A toy text encoder and U-Net, typed like their real counterparts
    let text_encoder = ModuleNode::container("CLIPTextModel").with_child(
        "self_attn",
        ModuleNode::container("CLIPAttention")
            .with_child("q_proj", linear(64, 64, &device)?)
            .with_child("v_proj", linear(64, 64, &device)?),
    );
    let unet = ModuleNode::container("UNet2DConditionModel").with_child(
        "resnet",
        ModuleNode::container("ResnetBlock2D")
            .with_child("conv1", conv(16, 3, &device)?)
            .with_child("conv_shortcut", conv(16, 1, &device)?),
    );

    let options = NetworkOptions::from_network_args(["conv_dim=4", "conv_alpha=1", "algo=lora"])?;
    let mut network = create_network(1.0, Some(8), 4.0, None, &text_encoder, &unet, &options)?;
    network.apply(Some(true), Some(true))?;

    println!("Network:");
    for adapter in network.adapters() {
        println!("  {adapter:?}");
    }
    println!(
        "  Trainable parameters: {}\n",
        format_parameter_count(network.num_parameters())
    );

    // One step on the U-Net: the host's conv now routes through its adapter
    let conv1 = unet
        .slot("resnet.conv1")
        .ok_or_else(|| anyhow::anyhow!("conv1 missing"))?;
    let input = Tensor::randn(0f32, 1.0, (1, 16, 8, 8), &device)?;
    let groups = network.prepare_optimizer_params(Some(5e-5), Some(1e-2));
    let mut sgd = SGD::new(network.trainable_vars(), groups[1].learning_rate_or(1e-3))?;
    let loss = conv1.forward(&input)?.sqr()?.mean_all()?;
    sgd.backward_step(&loss)?;
    println!("Loss before step: {:.6}", loss.to_scalar::<f32>()?);

    let dir = std::env::temp_dir().join("lycon-demo");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("demo.safetensors");
    let metadata = network.save_weights(&path, None, None)?;
    println!("Saved to {} (model hash {})", path.display(), metadata["sshs_model_hash"]);

    network.restore();
    let mut reloaded =
        create_network_from_weights(1.0, &path, None, &text_encoder, &unet, &options)?;
    let report = reloaded.apply(None, None)?;
    println!(
        "Reloaded {} adapters, {} missing keys",
        reloaded.adapters().count(),
        report.missing_keys.len()
    );

    println!("\n=== Example Complete ===");
    Ok(())
}

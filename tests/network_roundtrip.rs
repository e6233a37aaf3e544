//! Save a trained network, rebuild it from the file, and check it behaves the same.

use candle_core::{Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear};
use lycon::{
    create_network, create_network_from_weights, read_metadata, Algo, HostLayer, ModuleNode,
    NetworkController, NetworkOptions, Trainable,
};
use tempfile::TempDir;

fn linear(in_features: usize, out_features: usize, device: &Device) -> anyhow::Result<ModuleNode> {
    let weight = Tensor::randn(0f32, 0.1, (out_features, in_features), device)?;
    Ok(ModuleNode::leaf(HostLayer::Linear(Linear::new(weight, None))))
}

fn conv(in_channels: usize, out_channels: usize, k: usize, device: &Device) -> anyhow::Result<ModuleNode> {
    let weight = Tensor::randn(0f32, 0.1, (out_channels, in_channels, k, k), device)?;
    let config = Conv2dConfig {
        padding: k / 2,
        ..Default::default()
    };
    Ok(ModuleNode::leaf(HostLayer::Conv2d(Conv2d::new(weight, None, config))))
}

fn hosts(device: &Device) -> anyhow::Result<(ModuleNode, ModuleNode)> {
    let te = ModuleNode::container("CLIPTextModel").with_child(
        "mlp",
        ModuleNode::container("CLIPMLP")
            .with_child("fc1", linear(8, 16, device)?)
            .with_child("fc2", linear(16, 8, device)?),
    );
    let unet = ModuleNode::container("UNet2DConditionModel").with_child(
        "resnet",
        ModuleNode::container("ResnetBlock2D")
            .with_child("conv1", conv(4, 4, 3, device)?)
            .with_child("conv_shortcut", conv(4, 4, 1, device)?)
            .with_child("time_emb_proj", linear(8, 4, device)?),
    );
    Ok((te, unet))
}

fn randomize(network: &NetworkController, device: &Device) -> anyhow::Result<()> {
    for adapter in network.adapters() {
        for var in adapter.vars() {
            var.set(&Tensor::randn(0f32, 0.2, var.shape(), device)?)?;
        }
    }
    Ok(())
}

fn outputs(te: &ModuleNode, unet: &ModuleNode, device: &Device) -> anyhow::Result<(Tensor, Tensor)> {
    let text = Tensor::ones((2, 8), candle_core::DType::F32, device)?;
    let image = Tensor::ones((1, 4, 5, 5), candle_core::DType::F32, device)?;
    let text_out = te.slot("mlp.fc1").map(|s| s.forward(&text)).transpose()?;
    let image_out = unet.slot("resnet.conv1").map(|s| s.forward(&image)).transpose()?;
    Ok((
        text_out.ok_or_else(|| anyhow::anyhow!("missing fc1"))?,
        image_out.ok_or_else(|| anyhow::anyhow!("missing conv1"))?,
    ))
}

fn max_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar()?)
}

fn round_trip(options: NetworkOptions, file_name: &str) -> anyhow::Result<()> {
    let device = Device::Cpu;
    let (te, unet) = hosts(&device)?;
    let algo = options.algo;

    let mut trained = create_network(1.0, Some(4), 4.0, None, &te, &unet, &options)?;
    trained.apply(Some(true), Some(true))?;
    randomize(&trained, &device)?;
    let (text_before, image_before) = outputs(&te, &unet, &device)?;

    let dir = TempDir::new()?;
    let path = dir.path().join(file_name);
    trained.save_weights(&path, None, None)?;
    let saved = trained.state_dict()?;
    trained.restore();

    let mut restored =
        create_network_from_weights(1.0, &path, None, &te, &unet, &NetworkOptions::default())?;
    assert_eq!(restored.config().algo, algo);
    assert_eq!(restored.config().lora_dim, 4);
    let report = restored.apply(None, None)?;
    assert!(report.missing_keys.is_empty());
    assert!(report.unexpected_keys.is_empty());

    let reloaded = restored.state_dict()?;
    assert_eq!(saved.keys().collect::<Vec<_>>(), reloaded.keys().collect::<Vec<_>>());
    for (key, tensor) in &saved {
        assert_eq!(max_diff(tensor, &reloaded[key])?, 0.0, "{key}");
    }

    let (text_after, image_after) = outputs(&te, &unet, &device)?;
    assert!(max_diff(&text_before, &text_after)? < 1e-5);
    assert!(max_diff(&image_before, &image_after)? < 1e-5);
    Ok(())
}

#[test]
fn test_locon_safetensors_round_trip() -> anyhow::Result<()> {
    let options = NetworkOptions {
        conv_dim: Some(8),
        conv_alpha: Some(2.0),
        ..Default::default()
    };
    round_trip(options, "net.safetensors")
}

#[test]
fn test_loha_npz_round_trip() -> anyhow::Result<()> {
    // LoHa files carry a single rank, so conv layers share it
    let options = NetworkOptions {
        algo: Algo::Loha,
        ..Default::default()
    };
    round_trip(options, "net.npz")
}

#[test]
fn test_unet_only_round_trip_keeps_both_alphas() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let (te, unet) = hosts(&device)?;
    let options = NetworkOptions {
        conv_dim: Some(8),
        conv_alpha: Some(2.0),
        ..Default::default()
    };
    let time_emb = Tensor::ones((2, 8), candle_core::DType::F32, &device)?;
    let time_out = |unet: &ModuleNode| -> anyhow::Result<Tensor> {
        let slot = unet
            .slot("resnet.time_emb_proj")
            .ok_or_else(|| anyhow::anyhow!("missing time_emb_proj"))?;
        Ok(slot.forward(&time_emb)?)
    };

    let mut trained = create_network(1.0, Some(4), 4.0, None, &te, &unet, &options)?;
    trained.apply(Some(false), Some(true))?;
    randomize(&trained, &device)?;
    let (_, image_before) = outputs(&te, &unet, &device)?;
    let time_before = time_out(&unet)?;

    let dir = TempDir::new()?;
    let path = dir.path().join("unet.safetensors");
    trained.save_weights(&path, None, None)?;
    trained.restore();

    // conv1's alpha is the first alpha key in the file
    let mut restored =
        create_network_from_weights(1.0, &path, None, &te, &unet, &NetworkOptions::default())?;
    let config = restored.config();
    assert_eq!((config.lora_dim, config.conv_lora_dim), (4, 8));
    assert!((config.alpha - 4.0).abs() < f64::EPSILON);
    assert!((config.conv_alpha - 2.0).abs() < f64::EPSILON);

    let report = restored.apply(None, None)?;
    assert!(report.missing_keys.is_empty());
    assert!(report.unexpected_keys.is_empty());
    let (_, image_after) = outputs(&te, &unet, &device)?;
    assert!(max_diff(&image_before, &image_after)? < 1e-5);
    assert!(max_diff(&time_before, &time_out(&unet)?)? < 1e-5);
    Ok(())
}

#[test]
fn test_bf16_npz_save_is_widened() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let (te, unet) = hosts(&device)?;
    let network = create_network(1.0, Some(4), 1.0, None, &te, &unet, &NetworkOptions::default())?;
    randomize(&network, &device)?;

    let dir = TempDir::new()?;
    let path = dir.path().join("net.npz");
    network.save_weights(&path, Some(candle_core::DType::BF16), None)?;

    let loaded = lycon::load_weights(&path)?;
    assert_eq!(loaded.len(), network.state_dict()?.len());
    assert!(loaded.values().all(|t| t.dtype() == candle_core::DType::F32));
    Ok(())
}

#[test]
fn test_saved_metadata_carries_hashes() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let (te, unet) = hosts(&device)?;
    let network = create_network(1.0, Some(4), 1.0, None, &te, &unet, &NetworkOptions::default())?;

    let dir = TempDir::new()?;
    let path = dir.path().join("net.safetensors");
    let mut metadata = std::collections::HashMap::new();
    metadata.insert("ss_network_module".to_string(), "lycon".to_string());
    let written = network.save_weights(&path, Some(candle_core::DType::F16), Some(metadata))?;

    let stored = read_metadata(&path)?;
    assert_eq!(stored, written);
    assert_eq!(stored["ss_network_module"], "lycon");
    assert!(stored.contains_key("sshs_model_hash"));
    assert!(stored.contains_key("sshs_legacy_hash"));

    let loaded = lycon::load_weights(&path)?;
    assert!(loaded.values().all(|t| t.dtype() == candle_core::DType::F16));
    Ok(())
}

//! Benchmarks for adapter forward passes

#![allow(missing_docs)]

use candle_core::{Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear};
use criterion::{criterion_group, criterion_main, Criterion};
use lycon::{AdapterModule, Algo, HostLayer, LayerSlot};

fn dense_slot(device: &Device) -> candle_core::Result<std::sync::Arc<LayerSlot>> {
    let weight = Tensor::randn(0f32, 0.02, (768, 768), device)?;
    Ok(LayerSlot::new(HostLayer::Linear(Linear::new(weight, None))))
}

fn conv_slot(device: &Device) -> candle_core::Result<std::sync::Arc<LayerSlot>> {
    let weight = Tensor::randn(0f32, 0.02, (64, 64, 3, 3), device)?;
    let config = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    Ok(LayerSlot::new(HostLayer::Conv2d(Conv2d::new(weight, None, config))))
}

fn benchmark_adapters(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("adapters");

    let (Ok(dense), Ok(conv)) = (dense_slot(&device), conv_slot(&device)) else {
        return;
    };
    let (Ok(tokens), Ok(image)) = (
        Tensor::randn(0f32, 1.0, (1, 77, 768), &device),
        Tensor::randn(0f32, 1.0, (1, 64, 32, 32), &device),
    ) else {
        return;
    };

    group.bench_function("base_dense", |b| b.iter(|| dense.base_forward(&tokens)));
    group.bench_function("base_conv", |b| b.iter(|| conv.base_forward(&image)));

    for algo in [Algo::Lora, Algo::Loha] {
        let Ok(adapter) = AdapterModule::new(algo, "dense", &dense, 1.0, 16, 8.0, 0.0) else {
            continue;
        };
        group.bench_function(format!("{algo}_dense_r16"), |b| {
            b.iter(|| adapter.forward_with_base(&tokens));
        });

        let Ok(adapter) = AdapterModule::new(algo, "conv", &conv, 1.0, 8, 4.0, 0.0) else {
            continue;
        };
        let adapter = std::sync::Arc::new(adapter);
        if adapter.apply_to().is_ok() {
            group.bench_function(format!("{algo}_conv_r8_hooked"), |b| {
                b.iter(|| conv.forward(&image));
            });
            adapter.detach();
        }
    }

    group.finish();
}

criterion_group!(benches, benchmark_adapters);
criterion_main!(benches);

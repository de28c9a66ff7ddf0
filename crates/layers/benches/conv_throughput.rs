use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{
    conv::{Conv3d, Conv3dConfig, ConvInit},
    norm::{BatchNorm3d, BatchNormConfig},
    pool::MaxPool3d,
};

fn bench_conv(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("conv3d");
    for &kernel in &[1usize, 3, 7] {
        let config = Conv3dConfig::cube(16, 32, kernel);
        let conv = Conv3d::with_init(config, ConvInit::KaimingNormalFanOut, &device, DType::F32)
            .expect("conv");
        let input = Tensor::randn(0f32, 1.0, (2, 16, 16, 8, 8), &device).expect("input");
        group.throughput(Throughput::Elements(input.elem_count() as u64));
        group.bench_with_input(BenchmarkId::new("cube", kernel), &input, |b, input| {
            b.iter(|| black_box(conv.forward(black_box(input)).expect("forward")));
        });
    }
    group.finish();
}

fn bench_norm_pool(c: &mut Criterion) {
    let device = Device::Cpu;
    let input = Tensor::randn(0f32, 1.0, (2, 64, 32, 8, 8), &device).expect("input");
    let bn = BatchNorm3d::new(BatchNormConfig::new(64), &device, DType::F32).expect("bn");
    let pool = MaxPool3d::new(3, 2, 1).expect("pool");

    let mut group = c.benchmark_group("stem");
    group.throughput(Throughput::Elements(input.elem_count() as u64));
    group.bench_function("batch_norm", |b| {
        b.iter(|| black_box(bn.forward(black_box(&input)).expect("bn forward")));
    });
    group.bench_function("max_pool", |b| {
        b.iter(|| black_box(pool.forward(black_box(&input)).expect("pool forward")));
    });
    group.finish();
}

criterion_group!(benches, bench_conv, bench_norm_pool);
criterion_main!(benches);

use criterion::async_executor::FuturesExecutor;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::executor::block_on;
use wgpu_array::{Device, DeviceConfig, OptimizerConfig, StridedArray};

const SIZES: [usize; 4] = [100, 1000, 2000, 5000];

/// `exp(-x) + x` followed by relu: four nodes, one kernel when fused.
fn chain(x: &StridedArray) -> StridedArray {
    x.neg()
        .and_then(|y| y.exp())
        .and_then(|y| y.add(x))
        .and_then(|y| y.relu())
        .unwrap()
}

fn bench_chain(c: &mut Criterion, name: &str, optimizer: OptimizerConfig) {
    let mut group = c.benchmark_group(name);
    for size in SIZES {
        let config = DeviceConfig::default().with_optimizer(optimizer);
        let device = block_on(Device::with_config(config)).unwrap();
        let x = StridedArray::full(&device, &[size, size], 0.5).unwrap();

        group.bench_with_input(BenchmarkId::new(name, size), &size, |b, _| {
            b.to_async(FuturesExecutor).iter(|| async {
                let y = chain(&x);
                y.realize().unwrap();
                device.wgpu_device().poll(wgpu::PollType::Wait).unwrap();
                black_box(y)
            })
        });
    }
}

fn fused(c: &mut Criterion) {
    bench_chain(c, "chain-fused-wgpu", OptimizerConfig::minimal_kernels());
    bench_chain(c, "chain-separate-wgpu", OptimizerConfig::disabled());
}

criterion_group!(benches, fused);
criterion_main!(benches);

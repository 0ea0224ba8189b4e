use criterion::async_executor::FuturesExecutor;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use futures::executor::block_on;
use wgpu_array::{Device, DeviceConfig, StridedArray};

const SIZES: [usize; 5] = [10, 100, 200, 500, 1000];

fn wait(device: &Device) {
    device.wgpu_device().poll(wgpu::PollType::Wait).unwrap();
}

fn bench_add(c: &mut Criterion) {
    {
        let mut group = c.benchmark_group("add-wgpu");
        for size in SIZES {
            let device = block_on(Device::with_config(DeviceConfig::default())).unwrap();
            let array = StridedArray::full(&device, &[size, size], 1.0).unwrap();
            let other = StridedArray::full(&device, &[size, size], 2.0).unwrap();

            group.bench_with_input(BenchmarkId::new("add-wgpu", size), &size, |b, _| {
                b.to_async(FuturesExecutor).iter(|| async {
                    let sum = array.add(&other).unwrap();
                    sum.realize().unwrap();
                    wait(&device);
                    black_box(sum)
                })
            });
        }
    }

    {
        let mut group = c.benchmark_group("add-scalar-wgpu");
        for size in SIZES {
            let device = block_on(Device::with_config(DeviceConfig::default())).unwrap();
            let array = StridedArray::full(&device, &[size, size], 1.0).unwrap();
            let one = StridedArray::scalar(&device, 1.0);

            group.bench_with_input(BenchmarkId::new("add-scalar-wgpu", size), &size, |b, _| {
                b.to_async(FuturesExecutor).iter(|| async {
                    let sum = array.add(&one).unwrap();
                    sum.realize().unwrap();
                    wait(&device);
                    black_box(sum)
                })
            });
        }
    }

    {
        let mut group = c.benchmark_group("add-ndarray");
        for size in SIZES {
            group.bench_with_input(BenchmarkId::new("add-ndarray", size), &size, |b, &s| {
                b.to_async(FuturesExecutor).iter_batched(
                    || ndarray::Array2::<f32>::ones((s, s)),
                    |array| async move { &array + &array },
                    BatchSize::LargeInput,
                );
            });
        }
    }
}

criterion_group!(benches, bench_add);
criterion_main!(benches);

use wgpu_array::{Device, StridedArray};

#[tokio::main]
async fn main() -> wgpu_array::Result<()> {
    env_logger::init();
    let device = Device::new().await?;

    let a = StridedArray::new(&device, &[[1., 2.], [3., 4.], [5., 6.]])?;
    let b = StridedArray::new(&device, &[[1., 2.], [3., 4.], [5., 6.]])?;
    // Nothing runs until the result is read. The add and exp share one kernel, which
    // both the sum and the division read.
    let total = a.add(&b)?.exp()?;
    let softmax = total.div(&total.sum(Some(0), true)?)?;
    println!("{}", softmax.graphviz());
    println!("{:?}", softmax.to_host()?);
    println!("{}", device.kernel_stats());
    Ok(())
}

use anyhow::{Context, bail, ensure};

use compute_resources::{
    buffer::{
        DoubleBuffered, Dynamic, ReadWriteAppend, ReadWriteReadback, StridedResource,
        TypedConstantBuffer, TypedResource,
    },
    device::{GpuDevice, HostDevice, VulkanDevice},
    dispatch::blocks_for_threads,
};

const ELEMENT_COUNT: usize = 64;
const FRAMES: usize = 3;
const THREAD_GROUP_SIZE: u32 = 32;

fn main() -> anyhow::Result<()> {
    log4rs::init_file("log4rs.yml", Default::default())
        .context("failed to load logging config file")?;
    #[cfg(feature = "tracing")]
    let _client = tracy_client::Client::start();

    let backend = std::env::args().nth(1).unwrap_or_else(|| "vulkan".to_string());
    let result = match backend.as_str() {
        "vulkan" => {
            let device = VulkanDevice::headless().context("failed to create Vulkan device")?;
            run(&device).and_then(|_| device.wait_idle())
        }
        "host" => run(&HostDevice::new()),
        other => bail!("unknown backend {other:?}, expected `vulkan` or `host`"),
    };

    if let Err(e) = &result {
        log::error!("{:?}", e);
    }
    result
}

fn run<D: GpuDevice>(device: &D) -> anyhow::Result<()> {
    readback_round_trip(device).context("readback round trip failed")?;
    append_counter(device).context("append counter readback failed")?;
    double_buffered_frames(device).context("double buffered upload failed")?;
    log::info!("all checks passed");
    Ok(())
}

fn readback_round_trip<D: GpuDevice>(device: &D) -> anyhow::Result<()> {
    let mut results =
        StridedResource::<ReadWriteReadback, D>::new(device, 4, ELEMENT_COUNT, "results")?;
    let values: Vec<u32> = (0..ELEMENT_COUNT as u32).collect();
    results.update_buffer_content(bytemuck::cast_slice(&values), ELEMENT_COUNT)?;
    log::debug!(
        "dispatch would use {} groups",
        blocks_for_threads(ELEMENT_COUNT as u32, THREAD_GROUP_SIZE)
    );

    for pass in 0..2 {
        results.readback()?;
        let mapped = results.map()?;
        ensure!(
            mapped.as_slice::<u32>() == values.as_slice(),
            "pass {pass}: read back values differ from upload"
        );
        mapped.unmap();
    }
    log::info!("read back {ELEMENT_COUNT} values twice");
    Ok(())
}

fn append_counter<D: GpuDevice>(device: &D) -> anyhow::Result<()> {
    let mut append = TypedResource::<[f32; 4], ReadWriteAppend, D>::new(
        device,
        ELEMENT_COUNT,
        "append",
    )?;
    append.create_device_buffer()?;
    append.readback_counter()?;
    let count = append.retrieve_counter()?;
    ensure!(count == 0, "fresh append buffer reports {count} elements");
    log::info!("append counter starts at {count}");
    Ok(())
}

fn double_buffered_frames<D: GpuDevice>(device: &D) -> anyhow::Result<()> {
    let mut params = TypedConstantBuffer::<[f32; 4], D>::new(device, "frame params");
    let mut positions =
        DoubleBuffered::<TypedResource<[f32; 4], Dynamic, D>>::new(device, ELEMENT_COUNT, "positions");
    positions.initialize(true)?;

    for frame in 0..FRAMES {
        params.set([frame as f32, 1.0 / 60.0, 0.0, 0.0]);
        params.upload()?;

        let front = positions.get_mut();
        for (i, position) in front.as_mut_slice().iter_mut().enumerate() {
            *position = [i as f32, frame as f32, 0.0, 1.0];
        }
        front.upload_host_data()?;
        log::debug!(
            "frame {frame}: wrote buffer {}",
            positions.current_buffer_id()
        );
        positions.swap();
    }
    ensure!(
        positions.current_buffer_id() == FRAMES % 2,
        "double buffer index out of step"
    );
    log::info!("uploaded {FRAMES} double-buffered frames");
    Ok(())
}

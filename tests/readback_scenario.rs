use compute_resources::{
    buffer::{
        Buffering, DoubleBuffered, Dynamic, ReadWriteAppend, ReadWriteReadback, StridedResource,
        TypedResource,
    },
    device::{GpuBuffer, HostDevice},
};

#[test]
fn sixty_four_integers_survive_upload_and_readback() {
    let device = HostDevice::new();
    let mut resource =
        StridedResource::<ReadWriteReadback, _>::new(&device, 4, 64, "scenario").unwrap();
    assert_eq!(resource.size(), 64);

    let values: Vec<u32> = (0..64).collect();
    resource
        .update_buffer_content(bytemuck::cast_slice(&values), 64)
        .unwrap();

    resource.readback().unwrap();
    let mapped = resource.map().unwrap();
    assert_eq!(mapped.len(), 256);
    assert_eq!(mapped.as_slice::<u32>(), values.as_slice());
    mapped.unmap();

    // stands in for a compute pass doubling every element
    for chunk in resource.buffer_mut().contents_mut().chunks_exact_mut(4) {
        let value = u32::from_ne_bytes(chunk.try_into().unwrap());
        chunk.copy_from_slice(&(value * 2).to_ne_bytes());
    }

    resource.readback().unwrap();
    let mapped = resource.map().unwrap();
    let doubled: Vec<u32> = values.iter().map(|v| v * 2).collect();
    assert_eq!(mapped.as_slice::<u32>(), doubled.as_slice());
}

#[test]
fn append_buffer_reports_counter_written_by_compute_pass() {
    let device = HostDevice::new();
    let mut particles =
        TypedResource::<[f32; 4], ReadWriteAppend, _>::new(&device, 128, "particles").unwrap();
    particles.create_device_buffer().unwrap();
    assert!(particles.buffer().unwrap().counter().is_some());

    for emitted in [0, 17, 128] {
        particles.buffer_mut().unwrap().set_counter(emitted);
        particles.readback_counter().unwrap();
        assert_eq!(particles.retrieve_counter().unwrap(), emitted);
    }
}

#[test]
fn double_buffered_frames_keep_previous_frame_intact() {
    let device = HostDevice::new();
    let mut positions =
        DoubleBuffered::<TypedResource<u32, Dynamic, HostDevice>>::new(&device, 8, "positions");
    positions.initialize(true).unwrap();
    assert_eq!(positions.buffering(), Buffering::Double);

    for frame in 0..4u32 {
        let front = positions.get_mut();
        front.as_mut_slice().fill(frame);
        front.upload_host_data().unwrap();
        positions.swap();

        let previous: &[u32] =
            bytemuck::cast_slice(positions.back_buffer().buffer().unwrap().contents());
        assert!(previous.iter().all(|v| *v == frame));
        assert_eq!(positions.current_buffer_id(), ((frame + 1) % 2) as usize);
    }
}

#[test]
fn device_buffers_can_be_rebuilt_after_device_reset() {
    let device = HostDevice::new();
    let mut lights = TypedResource::<[f32; 4], Dynamic, _>::new(&device, 4, "lights").unwrap();
    lights[2] = [1.0, 0.5, 0.25, 1.0];
    lights.create_device_buffer().unwrap();
    lights.upload_host_data().unwrap();

    lights.free_device_buffer();
    assert!(!lights.is_device_buffer_allocated());
    assert_eq!(device.allocated_bytes(), 0);

    lights.create_device_buffer().unwrap();
    lights.upload_host_data().unwrap();
    let uploaded: &[[f32; 4]] = bytemuck::cast_slice(lights.buffer().unwrap().contents());
    assert_eq!(uploaded[2], [1.0, 0.5, 0.25, 1.0]);
}

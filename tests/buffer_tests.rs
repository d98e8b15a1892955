//! Global buffer tests: partitioning, transfers and the dirty flags

use kernlink::api::{ApiStatus, SimDevice, SimOp, SimPlatform, SimulatedApi};
use kernlink::variable::GlobalBuffer;
use kernlink::{DataType, DeviceCatalog, DeviceLink, RuntimeConfig, RuntimeError, Variable};
use std::rc::Rc;

fn link(api: &Rc<SimulatedApi>) -> Rc<DeviceLink> {
    let catalog = DeviceCatalog::new(api.clone(), RuntimeConfig::default());
    Rc::new(DeviceLink::from_platform(&catalog, None))
}

/// Two GPUs with a 3:1 performance ratio
fn dual_gpu() -> Rc<SimulatedApi> {
    Rc::new(SimulatedApi::new(vec![
        SimPlatform::new("Sim", "kernlink")
            .with_device(SimDevice::gpu("fast", 30, 1000))
            .with_device(SimDevice::gpu("slow", 10, 1000)),
    ]))
}

fn state(var: &Variable) -> &GlobalBuffer {
    var.as_buffer().unwrap()
}

#[test]
fn test_single_device_buffer_is_whole() {
    let api = Rc::new(SimulatedApi::single_gpu());
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Float, 8);
    assert!(var.is_pending());
    var.allocate(&link).unwrap();

    assert!(!var.is_pending());
    let buffer = state(&var);
    assert!(!buffer.is_split());
    assert_eq!(buffer.partitions().len(), 1);
    let mem = buffer.mem_handles().next().unwrap();
    assert_eq!(api.buffer_size(mem), Some(32));
    assert_eq!(var.element_count_on(0), 8);
    assert_eq!(var.memory_size(), 32);
}

#[test]
fn test_multi_device_buffer_is_split() {
    let api = dual_gpu();
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Float2, 10);
    var.allocate(&link).unwrap();

    let buffer = state(&var);
    assert!(buffer.is_split());
    let parts: Vec<_> = buffer.partitions().iter().map(|p| (p.offset, p.len)).collect();
    // ceil(0.75 * 10) = 8, the rest goes to the last device
    assert_eq!(parts, vec![(0, 8), (8, 2)]);
    let sizes: Vec<_> = buffer
        .mem_handles()
        .map(|m| api.buffer_size(m).unwrap())
        .collect();
    assert_eq!(sizes, vec![64, 16]);
    assert_eq!(var.element_count_on(0), 8);
    assert_eq!(var.element_count_on(1), 2);
    assert_eq!(var.element_count_on(2), 0);
}

#[test]
fn test_tiny_split_leaves_device_without_partition() {
    let api = Rc::new(SimulatedApi::new(vec![
        SimPlatform::new("Sim", "kernlink")
            .with_device(SimDevice::gpu("a", 90, 1000))
            .with_device(SimDevice::gpu("b", 5, 1000))
            .with_device(SimDevice::gpu("c", 5, 1000)),
    ]));
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Int, 2);
    var.allocate(&link).unwrap();

    let buffer = state(&var);
    let lens: Vec<_> = buffer.partitions().iter().map(|p| p.len).collect();
    assert_eq!(lens, vec![2, 0, 0]);
    assert_eq!(buffer.mem_handles().count(), 1);
    assert_eq!(api.live_buffers(), 1);
}

#[test]
fn test_upload_writes_each_partition() {
    let api = dual_gpu();
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Uint, 4);
    var.allocate(&link).unwrap();

    let mut buffer = var.as_buffer_mut().unwrap();
    buffer.write_slice(&[1u32, 2, 3, 4]).unwrap();
    buffer.upload(true).unwrap();

    let contents: Vec<Vec<u32>> = state(&var)
        .mem_handles()
        .map(|m| {
            api.buffer_contents(m)
                .unwrap()
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned)
                .collect()
        })
        .collect();
    assert_eq!(contents, vec![vec![1, 2, 3], vec![4]]);
    assert_eq!(api.stats().writes, 2);
}

#[test]
fn test_dirty_flag_law() {
    let api = Rc::new(SimulatedApi::single_gpu());
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Float, 4);
    var.allocate(&link).unwrap();
    let mut buffer = var.as_buffer_mut().unwrap();

    // the first write pulls the device contents into the shadow
    buffer.set_scalar(2, 1.5).unwrap();
    assert_eq!(api.stats().reads, 1);
    assert!(buffer.host_has_data());
    assert!(buffer.host_data_changed());

    buffer.upload(true).unwrap();
    assert!(!buffer.host_data_changed());
    assert_eq!(api.stats().writes, 1);

    buffer.download(true, false).unwrap();
    assert!(buffer.host_has_data());
    assert!(!buffer.host_data_changed());
    assert_eq!(api.stats().reads, 2);

    buffer.download(true, false).unwrap();
    assert_eq!(api.stats().reads, 2, "current shadow must not be re-read");

    buffer.download(true, true).unwrap();
    assert_eq!(api.stats().reads, 3);
    assert_eq!(buffer.get_scalar(2).unwrap(), 1.5);
}

#[test]
fn test_unchanged_upload_is_skipped() {
    let api = Rc::new(SimulatedApi::single_gpu());
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Int, 3);
    var.allocate(&link).unwrap();

    var.as_buffer_mut().unwrap().upload(true).unwrap();
    assert_eq!(api.stats().writes, 0);
}

#[test]
fn test_values_written_before_allocation_reach_device() {
    let api = Rc::new(SimulatedApi::single_gpu());
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Int, 3);
    var.set_scalar(0, -4.0).unwrap();
    var.set_scalar(2, 9.0).unwrap();
    assert_eq!(api.stats().native_calls(), 2, "only link setup so far");

    var.allocate(&link).unwrap();
    let mem = state(&var).mem_handles().next().unwrap();
    let ints: Vec<i32> = api
        .buffer_contents(mem)
        .unwrap()
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned)
        .collect();
    assert_eq!(ints, vec![-4, 0, 9]);
    assert!(!state(&var).host_data_changed());
}

#[test]
fn test_vector_access_on_buffer() {
    let api = Rc::new(SimulatedApi::single_gpu());
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Float4, 2);
    var.allocate(&link).unwrap();

    var.set_vector(1, [0.5, -1.0, 2.0]).unwrap();
    var.as_buffer_mut().unwrap().upload(true).unwrap();
    assert_eq!(var.get_vector(1).unwrap(), [0.5, -1.0, 2.0]);
    assert_eq!(var.get_vector(0).unwrap(), [0.0, 0.0, 0.0]);

    let floats: Vec<f32> = var.as_buffer_mut().unwrap().read_vec().unwrap();
    assert_eq!(floats, vec![0.0, 0.0, 0.0, 0.0, 0.5, -1.0, 2.0, 0.0]);
}

#[test]
fn test_access_errors() {
    let api = Rc::new(SimulatedApi::single_gpu());
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Double2, 2);
    var.allocate(&link).unwrap();

    assert!(matches!(
        var.set_scalar(0, 1.0),
        Err(RuntimeError::TypeMismatch { access: "scalar", .. })
    ));
    assert!(matches!(
        var.get_vector(2),
        Err(RuntimeError::OutOfRange { index: 2, len: 2, .. })
    ));
    assert!(matches!(
        var.as_buffer_mut().unwrap().write_slice(&[1.0f64; 3]),
        Err(RuntimeError::SizeMismatch { expected: 32, found: 24, .. })
    ));
}

#[test]
fn test_transfers_need_device_storage() {
    let mut var = Variable::global_buffer(DataType::Float, 4);
    let mut buffer = var.as_buffer_mut().unwrap();
    buffer.write_slice(&[1.0f32; 4]).unwrap();
    assert!(matches!(
        buffer.upload(true),
        Err(RuntimeError::Unallocated { .. })
    ));
    assert!(matches!(
        buffer.download(true, true),
        Err(RuntimeError::Unallocated { .. })
    ));
}

#[test]
fn test_empty_buffer_cannot_allocate() {
    let api = Rc::new(SimulatedApi::single_gpu());
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Float, 0);
    assert!(matches!(
        var.allocate(&link),
        Err(RuntimeError::EmptyVariable { .. })
    ));
    assert_eq!(api.live_buffers(), 0);
}

#[test]
fn test_copy_invalidates_shadow() {
    let api = Rc::new(SimulatedApi::single_gpu());
    let link = link(&api);
    let mut src = Variable::global_buffer(DataType::Int, 4);
    let mut dst = Variable::global_buffer(DataType::Int, 4);
    src.allocate(&link).unwrap();
    dst.allocate(&link).unwrap();

    src.as_buffer_mut().unwrap().write_slice(&[5i32, 6, 7, 8]).unwrap();
    src.as_buffer_mut().unwrap().upload(true).unwrap();
    dst.as_buffer_mut().unwrap().write_slice(&[0i32; 4]).unwrap();

    let parts = state(&src).partitions().to_vec();
    let mut buffer = dst.as_buffer_mut().unwrap();
    buffer.copy_from(&parts, true).unwrap();
    assert!(!buffer.host_has_data());
    assert!(!buffer.host_data_changed());
    assert_eq!(api.stats().copies, 1);

    let ints: Vec<i32> = buffer.read_vec().unwrap();
    assert_eq!(ints, vec![5, 6, 7, 8]);
}

#[test]
fn test_copy_requires_same_shape() {
    let api = Rc::new(SimulatedApi::single_gpu());
    let link = link(&api);
    let mut src = Variable::global_buffer(DataType::Int, 3);
    let mut dst = Variable::global_buffer(DataType::Int, 4);
    src.allocate(&link).unwrap();
    dst.allocate(&link).unwrap();

    let parts = state(&src).partitions().to_vec();
    let err = dst.as_buffer_mut().unwrap().copy_from(&parts, true).unwrap_err();
    assert!(matches!(err, RuntimeError::SizeMismatch { expected: 16, found: 12, .. }));
}

#[test]
fn test_release_frees_device_memory() {
    let api = dual_gpu();
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Float, 100);
    var.allocate(&link).unwrap();
    assert_eq!(api.live_buffers(), 2);

    var.release();
    assert!(var.is_pending());
    assert_eq!(api.live_buffers(), 0);
    assert!(state(&var).host_bytes().is_none());

    var.allocate(&link).unwrap();
    drop(var);
    assert_eq!(api.live_buffers(), 0);
    assert_eq!(api.stats().buffers_released, 4);
}

#[test]
fn test_failed_reallocation_leaves_no_device_memory() {
    let api = dual_gpu();
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Float, 100);
    var.allocate(&link).unwrap();
    assert_eq!(api.live_buffers(), 2);

    // reallocation drops the old partitions before creating new ones
    api.inject_failure(SimOp::CreateBuffer, ApiStatus::MEM_OBJECT_ALLOCATION_FAILURE);
    let err = var.allocate(&link).unwrap_err();
    assert_eq!(err.status(), Some(ApiStatus::MEM_OBJECT_ALLOCATION_FAILURE));
    assert_eq!(api.live_buffers(), 0);
    assert!(var.is_pending());
}

#[test]
fn test_resize_releases_split_storage() {
    let api = dual_gpu();
    let link = link(&api);
    let mut var = Variable::global_buffer(DataType::Float, 10);
    var.allocate(&link).unwrap();
    var.set_scalar(9, 4.0).unwrap();
    assert_eq!(api.live_buffers(), 2);

    var.set_space(DataType::Double, 6);
    assert!(var.is_pending());
    assert_eq!(api.live_buffers(), 0);
    assert!(!state(&var).is_allocated());
    assert!(state(&var).host_bytes().is_none());
    assert!(matches!(
        var.as_buffer_mut().unwrap().download(true, true),
        Err(RuntimeError::Unallocated { .. })
    ));

    var.allocate(&link).unwrap();
    let lens: Vec<usize> = state(&var).partitions().iter().map(|p| p.len).collect();
    assert_eq!(lens, vec![5, 1]);
    assert_eq!(var.get_scalar(5).unwrap(), 0.0);
}

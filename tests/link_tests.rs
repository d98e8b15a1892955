//! Device link tests

use kernlink::api::{ApiStatus, ComputeApi, DeviceType, SimDevice, SimOp, SimPlatform, SimulatedApi};
use kernlink::{DeviceCatalog, DeviceLink, RuntimeConfig, RuntimeError};
use std::rc::Rc;

fn mixed_api() -> Rc<SimulatedApi> {
    Rc::new(SimulatedApi::new(vec![
        SimPlatform::new("NVIDIA CUDA", "NVIDIA Corporation")
            .with_device(SimDevice::gpu("big", 30, 1000).with_work_group_size(512))
            .with_device(SimDevice::gpu("small", 10, 1000).with_work_group_size(1024)),
    ]))
}

#[test]
fn test_link_platform_devices() {
    let api = mixed_api();
    let catalog = DeviceCatalog::new(api.clone(), RuntimeConfig::default());
    let link = DeviceLink::from_platform(&catalog, None);

    assert_eq!(link.device_count(), 2);
    assert!(link.context().is_some());
    assert!(link.queue(0).is_some());
    assert!(link.queue(1).is_some());
    assert!(link.queue(2).is_none());
    assert_eq!(link.device(1).unwrap().name(), "small");
    assert_eq!(link.platform_name(), Some("NVIDIA CUDA"));
    assert_eq!(api.live_contexts(), 1);
    assert_eq!(api.live_queues(), 2);
}

#[test]
fn test_performance_factors_proportional() {
    let catalog = DeviceCatalog::new(mixed_api(), RuntimeConfig::default());
    let link = DeviceLink::from_platform(&catalog, None);
    assert_eq!(link.performance_factor(0), Some(0.75));
    assert_eq!(link.performance_factor(1), Some(0.25));
    assert_eq!(link.performance_factor(2), None);
    let total: f64 = link.performance_factors().iter().sum();
    assert!((total - 1.0).abs() < 1e-12);
}

#[test]
fn test_single_device_link() {
    let catalog = DeviceCatalog::new(mixed_api(), RuntimeConfig::default());
    let small = catalog.filter_devices(DeviceType::GPU, "small");
    let link = DeviceLink::from_device(&catalog, &small[0]);
    assert_eq!(link.device_count(), 1);
    assert_eq!(link.performance_factor(0), Some(1.0));
    assert_eq!(link.best_device(DeviceType::GPU).unwrap().name(), "small");
}

#[test]
fn test_empty_device_list_leaves_link_unusable() {
    let catalog = DeviceCatalog::new(mixed_api(), RuntimeConfig::default());
    let link = DeviceLink::new(&catalog, &[]);
    assert_eq!(link.device_count(), 0);
    assert!(link.context().is_none());
    assert_eq!(link.min_max_workgroup_size(), 0);

    let err = DeviceLink::connect(&catalog, &[]).unwrap_err();
    assert_eq!(err, RuntimeError::NoDevices);
}

#[test]
fn test_link_without_platforms() {
    let catalog = DeviceCatalog::new(Rc::new(SimulatedApi::empty()), RuntimeConfig::default());
    let link = DeviceLink::from_platform(&catalog, None);
    assert_eq!(link.device_count(), 0);
}

#[test]
fn test_failed_queue_creation_releases_context() {
    let api = mixed_api();
    let catalog = DeviceCatalog::new(api.clone(), RuntimeConfig::default());
    api.inject_failure(SimOp::CreateQueue, ApiStatus::OUT_OF_HOST_MEMORY);

    let devices: Vec<_> = catalog.devices().cloned().collect();
    let err = DeviceLink::connect(&catalog, &devices).unwrap_err();
    assert_eq!(err.status(), Some(ApiStatus::OUT_OF_HOST_MEMORY));
    assert_eq!(api.live_contexts(), 0);
    assert_eq!(api.live_queues(), 0);
}

#[test]
fn test_drop_releases_queues_and_context() {
    let api = mixed_api();
    let catalog = DeviceCatalog::new(api.clone(), RuntimeConfig::default());
    {
        let _link = DeviceLink::from_platform(&catalog, None);
        assert_eq!(api.live_queues(), 2);
    }
    assert_eq!(api.live_queues(), 0);
    assert_eq!(api.live_contexts(), 0);
}

#[test]
fn test_min_max_workgroup_size() {
    let catalog = DeviceCatalog::new(mixed_api(), RuntimeConfig::default());
    let link = DeviceLink::from_platform(&catalog, None);
    assert_eq!(link.min_max_workgroup_size(), 512);
}

#[test]
fn test_config_reaches_link() {
    let config = RuntimeConfig {
        profiling: true,
        max_workgroup_size: 64,
        ..RuntimeConfig::default()
    };
    let catalog = DeviceCatalog::new(mixed_api(), config);
    let link = DeviceLink::from_platform(&catalog, None);
    assert!(link.profiling());
    assert_eq!(link.workgroup_cap(), 64);
}

#[test]
fn test_build_appends_device_class_flags() {
    let api = mixed_api();
    let catalog = DeviceCatalog::new(api.clone(), RuntimeConfig::default());
    let link = DeviceLink::from_platform(&catalog, None);

    let program = api
        .create_program(link.context().unwrap(), "__kernel void k() {}")
        .unwrap();
    link.build_program(program, "-cl-mad-enable").unwrap();
    assert_eq!(
        api.last_build_options(),
        vec![
            "-cl-mad-enable -D GPU -D NVIDIA".to_string(),
            "-cl-mad-enable -D GPU -D NVIDIA".to_string()
        ]
    );
    api.release_program(program);
}

#[test]
fn test_build_failure_reports_device() {
    let api = mixed_api();
    let catalog = DeviceCatalog::new(api.clone(), RuntimeConfig::default());
    let link = DeviceLink::from_platform(&catalog, None);

    let program = api
        .create_program(link.context().unwrap(), "#error no solver\n")
        .unwrap();
    let err = link.build_program(program, "").unwrap_err();
    assert_eq!(
        err,
        RuntimeError::BuildFailed {
            device: "big".into(),
            status: ApiStatus::BUILD_PROGRAM_FAILURE
        }
    );
    // the first failure stops the per-device loop
    assert_eq!(api.stats().builds, 1);
    api.release_program(program);
}

#[test]
fn test_finish_drains_every_queue() {
    let api = mixed_api();
    let catalog = DeviceCatalog::new(api.clone(), RuntimeConfig::default());
    let link = DeviceLink::from_platform(&catalog, None);

    link.finish().unwrap();
    assert_eq!(api.stats().finishes, 2);

    api.inject_failure(SimOp::Finish, ApiStatus::OUT_OF_RESOURCES);
    let err = link.finish().unwrap_err();
    assert_eq!(err.status(), Some(ApiStatus::OUT_OF_RESOURCES));
    // the second queue was still drained
    assert_eq!(api.stats().finishes, 3);
}

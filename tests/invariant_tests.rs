//! Property tests for partitioning, launch sizing, value encoding and the
//! annotation scanner

use kernlink::api::{SimDevice, SimPlatform, SimulatedApi};
use kernlink::program::parser::parse;
use kernlink::program::resolve_local_size;
use kernlink::variable::split_partitions;
use kernlink::{DataType, DeviceCatalog, DeviceLink, RuntimeConfig, RuntimeError, Variable};
use proptest::prelude::*;
use std::rc::Rc;

/// Performance factors as a link computes them
fn factors(weights: &[u32]) -> Vec<f64> {
    let total: u32 = weights.iter().sum();
    weights.iter().map(|w| *w as f64 / total as f64).collect()
}

fn identifier() -> impl Strategy<Value = String> {
    "[A-Z][A-Z0-9_]{0,11}"
}

proptest! {
    #[test]
    fn test_split_covers_every_element(
        count in 0usize..100_000,
        weights in prop::collection::vec(1u32..1000, 1..6)
    ) {
        let parts = split_partitions(count, &factors(&weights));
        prop_assert_eq!(parts.len(), weights.len());
        prop_assert_eq!(parts.iter().map(|p| p.1).sum::<usize>(), count);

        let mut offset = 0;
        for (start, len) in &parts {
            prop_assert_eq!(*start, offset);
            offset += len;
        }
    }

    #[test]
    fn test_split_rounds_leading_partitions_up(
        count in 1usize..10_000,
        weights in prop::collection::vec(1u32..100, 2..5)
    ) {
        let f = factors(&weights);
        let parts = split_partitions(count, &f);
        let mut remaining = count;
        for (i, (_, len)) in parts.iter().enumerate().take(parts.len() - 1) {
            let wanted = (f[i] * count as f64).ceil() as usize;
            prop_assert_eq!(*len, wanted.min(remaining));
            remaining -= len;
        }
    }

    #[test]
    fn test_local_size_divides_global(global in 1usize..1_000_000, local in 0usize..2048) {
        let resolved = resolve_local_size(global, local);
        prop_assert!(resolved >= 1);
        prop_assert!(resolved <= local.max(1));
        prop_assert_eq!(global % resolved, 0);
    }

    #[test]
    fn test_int_scalars_round_trip(values in prop::collection::vec(any::<i32>(), 1..32)) {
        let mut var = Variable::global_buffer(DataType::Int, values.len());
        for (i, v) in values.iter().enumerate() {
            var.set_scalar(i, *v as f64).unwrap();
        }
        for (i, v) in values.iter().enumerate() {
            prop_assert_eq!(var.get_scalar(i).unwrap(), *v as f64);
        }
    }

    #[test]
    fn test_float_vectors_round_trip(x in any::<f32>(), y in any::<f32>(), z in any::<f32>()) {
        prop_assume!(x.is_finite() && y.is_finite() && z.is_finite());
        let value = [x as f64, y as f64, z as f64];

        let mut four = Variable::kernel_argument(DataType::Float4);
        four.set_vector(0, value).unwrap();
        prop_assert_eq!(four.get_vector(0).unwrap(), value);

        let mut two = Variable::kernel_argument(DataType::Float2);
        two.set_vector(0, value).unwrap();
        prop_assert_eq!(two.get_vector(0).unwrap(), [value[0], value[1], 0.0]);
    }

    #[test]
    fn test_uchar_scalars_saturate(v in -1000.0f64..1000.0) {
        let mut var = Variable::kernel_argument(DataType::UChar);
        var.set_scalar(0, v).unwrap();
        prop_assert_eq!(var.get_scalar(0).unwrap(), (v as u8) as f64);
    }

    #[test]
    fn test_parser_finds_annotated_semantics(
        semantics in prop::collection::vec(identifier(), 1..8),
        marker in any::<prop::sample::Index>()
    ) {
        let parallel = marker.index(semantics.len());
        let params: Vec<String> = semantics
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let hash = if i == parallel { "#" } else { "" };
                format!("__global float* p{i} :{s}{hash}")
            })
            .collect();
        let source = format!("__kernel void k({}) {{}}", params.join(", "));

        let parsed = parse("k", &source).unwrap();
        let kernel = parsed.kernel.unwrap();
        prop_assert_eq!(&kernel.semantics, &semantics);
        prop_assert_eq!(kernel.parallel.as_deref(), Some(semantics[parallel].as_str()));
        prop_assert!(!parsed.source.contains(':'));
        prop_assert!(!parsed.source.contains('#'));
    }

    #[test]
    fn test_parser_defaults_to_first_semantic(
        semantics in prop::collection::vec(identifier(), 1..8)
    ) {
        let params: Vec<String> = semantics
            .iter()
            .map(|s| format!("__global int* {} :{s}", s.to_lowercase()))
            .collect();
        let source = format!("__kernel void f({})\n{{\n}}\n", params.join(",\n    "));
        let kernel = parse("f", &source).unwrap().kernel.unwrap();
        prop_assert_eq!(kernel.parallel.as_deref(), Some(semantics[0].as_str()));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_device_partitions_match_link_factors(
        count in 1usize..5000,
        units in prop::collection::vec(1u32..64, 1..4)
    ) {
        let mut platform = SimPlatform::new("Sim", "kernlink");
        for (i, cu) in units.iter().enumerate() {
            platform = platform.with_device(SimDevice::gpu(format!("gpu{i}"), *cu, 1000));
        }
        let api = Rc::new(SimulatedApi::new(vec![platform]));
        let catalog = DeviceCatalog::new(api.clone(), RuntimeConfig::default());
        let link = Rc::new(DeviceLink::from_platform(&catalog, None));

        let mut var = Variable::global_buffer(DataType::Float, count);
        var.allocate(&link).unwrap();
        let buffer = var.as_buffer().unwrap();

        let expected = if units.len() > 1 {
            split_partitions(count, link.performance_factors())
        } else {
            vec![(0, count)]
        };
        let actual: Vec<_> = buffer.partitions().iter().map(|p| (p.offset, p.len)).collect();
        prop_assert_eq!(actual, expected);

        let bytes: usize = buffer.mem_handles().map(|m| api.buffer_size(m).unwrap()).sum();
        prop_assert_eq!(bytes, count * 4);
        let counted: usize = (0..units.len()).map(|d| var.element_count_on(d)).sum();
        prop_assert_eq!(counted, count);
    }
}

/// Value every element type stores exactly
fn exact(v: u8) -> f64 {
    (v % 100) as f64
}

/// What a vector read returns after writing `value`
fn stored(data_type: DataType, value: [f64; 3]) -> [f64; 3] {
    if data_type.components() == 2 {
        [value[0], value[1], 0.0]
    } else {
        value
    }
}

fn assert_round_trip(var: &mut Variable, values: &[[f64; 3]]) -> Result<(), TestCaseError> {
    let data_type = var.data_type();
    for (i, value) in values.iter().enumerate() {
        if data_type.is_scalar() {
            var.set_scalar(i, value[0]).unwrap();
        } else if data_type.is_vector() {
            var.set_vector(i, *value).unwrap();
        }
    }
    if let Some(mut buffer) = var.as_buffer_mut() {
        buffer.upload(true).unwrap();
        prop_assert!(!buffer.host_has_data());
        buffer.download(true, true).unwrap();
    }
    for (i, value) in values.iter().enumerate() {
        if data_type.is_scalar() {
            prop_assert_eq!(var.get_scalar(i).unwrap(), value[0]);
        } else if data_type.is_vector() {
            prop_assert_eq!(var.get_vector(i).unwrap(), stored(data_type, *value));
        } else {
            let scalar = var.set_scalar(i, value[0]);
            let is_scalar_mismatch =
                matches!(scalar, Err(RuntimeError::TypeMismatch { access: "scalar", .. }));
            prop_assert!(is_scalar_mismatch);
            let vector = var.get_vector(i);
            let is_vector_mismatch =
                matches!(vector, Err(RuntimeError::TypeMismatch { access: "vector", .. }));
            prop_assert!(is_vector_mismatch);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_every_type_round_trips(
        data_type in prop::sample::select(DataType::ALL.to_vec()),
        raw in prop::collection::vec(any::<[u8; 3]>(), 1..16)
    ) {
        let values: Vec<[f64; 3]> = raw.iter().map(|r| r.map(exact)).collect();

        let api = Rc::new(SimulatedApi::single_gpu());
        let catalog = DeviceCatalog::new(api.clone(), RuntimeConfig::default());
        let link = Rc::new(DeviceLink::from_platform(&catalog, None));
        let mut buffer = Variable::global_buffer(data_type, values.len());
        buffer.allocate(&link).unwrap();
        assert_round_trip(&mut buffer, &values)?;

        let mut argument = Variable::kernel_argument(data_type);
        assert_round_trip(&mut argument, &values[..1])?;
    }
}

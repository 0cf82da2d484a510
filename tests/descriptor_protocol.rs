mod common;

use std::sync::Arc;

use opcheck::oracle::softmax_last_axis;
use opcheck::{
    Device, ElementType, Fill, HostBackend, OpClient, OpError, OpKind, OperatorBackend, Status,
    TestTensor, Workspace, WorkspaceManager,
};

use common::{assert_approx_eq, ramp};

fn softmax_tensors(shape: &[usize], device: &Device) -> (TestTensor, TestTensor) {
    let count = shape.iter().product::<usize>();
    let input = TestTensor::from_values(&ramp(count, 0.01), shape, None, ElementType::F32, device)
        .expect("input");
    let output = TestTensor::new(shape, None, ElementType::F32, device, Fill::Zeros)
        .expect("output");
    (input, output)
}

#[test]
fn full_lifecycle_runs_and_releases_handle() {
    let backend = Arc::new(HostBackend::new());
    let device = Device::cpu();
    let client = OpClient::new(backend.clone(), &device);
    let (mut input, mut output) = softmax_tensors(&[3, 3], &device);

    let descriptor = client
        .create(
            OpKind::Softmax,
            output.descriptor().expect("output view"),
            &[input.descriptor().expect("input view")],
        )
        .expect("create");
    assert_eq!(backend.live_handles(), 1);
    input.destroy_desc();
    output.destroy_desc();

    let descriptor = descriptor.prepare().expect("prepare");
    assert_eq!(descriptor.workspace_bytes(), 3 * 4);
    let workspace = WorkspaceManager::new(&device)
        .acquire(descriptor.workspace_bytes())
        .expect("workspace");
    descriptor
        .execute(&workspace, output.data(), &[input.data()])
        .expect("execute");

    let expected = softmax_last_axis(&[3, 3], &input.read_logical().expect("input values"));
    let actual = output.read_logical().expect("output values");
    assert_approx_eq(&actual, &expected, 1e-6);
    for row in actual.chunks(3) {
        assert!((row.iter().sum::<f64>() - 1.0).abs() <= 1e-5);
    }

    drop(workspace);
    descriptor.destroy().expect("destroy");
    assert_eq!(backend.live_handles(), 0);
}

#[test]
fn raw_calls_after_destroy_fail() {
    let backend = Arc::new(HostBackend::new());
    let device = Device::cpu();
    let client = OpClient::new(backend.clone(), &device);
    let (input, output) = softmax_tensors(&[2, 4], &device);
    let descriptor = client
        .create(
            OpKind::Softmax,
            output.descriptor().expect("output view"),
            &[input.descriptor().expect("input view")],
        )
        .expect("create");
    let handle = descriptor.handle();
    descriptor.destroy().expect("destroy");

    assert_eq!(backend.workspace_size(handle), Err(Status::InvalidHandle));
    assert_eq!(
        backend.execute(handle, None, 0, output.data(), &[input.data()], None),
        Err(Status::InvalidHandle)
    );
    assert_eq!(backend.destroy(handle), Err(Status::InvalidHandle));

    let err = Status::InvalidHandle.into_error("test", Some(handle));
    assert!(matches!(err, OpError::UseAfterFree { .. }));
    assert!(err.is_protocol_misuse());
}

#[test]
fn second_destroy_is_reported() {
    let backend = Arc::new(HostBackend::new());
    let device = Device::cpu();
    let client = OpClient::new(backend.clone(), &device);
    let (input, output) = softmax_tensors(&[2, 4], &device);
    let descriptor = client
        .create(
            OpKind::Softmax,
            output.descriptor().expect("output view"),
            &[input.descriptor().expect("input view")],
        )
        .expect("create");
    backend
        .destroy(descriptor.handle())
        .expect("release behind the descriptor's back");

    let err = descriptor.destroy().expect_err("handle already gone");
    assert!(matches!(err, OpError::DoubleDestroy { .. }));
}

#[test]
fn dropped_descriptor_releases_its_handle() {
    let backend = Arc::new(HostBackend::new());
    let device = Device::cpu();
    let client = OpClient::new(backend.clone(), &device);
    let (input, output) = softmax_tensors(&[4, 4], &device);
    {
        let descriptor = client
            .create(
                OpKind::Softmax,
                output.descriptor().expect("output view"),
                &[input.descriptor().expect("input view")],
            )
            .expect("create");
        let _prepared = descriptor.prepare().expect("prepare");
        assert_eq!(backend.live_handles(), 1);
    }
    assert_eq!(backend.live_handles(), 0);
}

#[test]
fn workspace_size_is_stable_across_executions() {
    let backend = Arc::new(HostBackend::new());
    let device = Device::cpu();
    let client = OpClient::new(backend, &device);
    let (input, output) = softmax_tensors(&[32, 512], &device);
    let descriptor = client
        .create(
            OpKind::Softmax,
            output.descriptor().expect("output view"),
            &[input.descriptor().expect("input view")],
        )
        .expect("create")
        .prepare()
        .expect("prepare");
    let declared = descriptor.workspace_bytes();
    assert_eq!(declared, 512 * 4);
    let workspace = WorkspaceManager::new(&device)
        .acquire(declared)
        .expect("workspace");
    for _ in 0..3 {
        descriptor
            .execute(&workspace, output.data(), &[input.data()])
            .expect("execute");
        assert_eq!(descriptor.workspace_size().expect("size"), declared);
    }
}

#[test]
fn descriptors_are_independent() {
    let backend = Arc::new(HostBackend::new());
    let device = Device::cpu();
    let client = OpClient::new(backend.clone(), &device);
    let (small_in, small_out) = softmax_tensors(&[3, 3], &device);
    let (wide_in, wide_out) = softmax_tensors(&[2, 8], &device);
    let small = client
        .create(
            OpKind::Softmax,
            small_out.descriptor().expect("view"),
            &[small_in.descriptor().expect("view")],
        )
        .expect("create small")
        .prepare()
        .expect("prepare small");
    let wide = client
        .create(
            OpKind::Softmax,
            wide_out.descriptor().expect("view"),
            &[wide_in.descriptor().expect("view")],
        )
        .expect("create wide")
        .prepare()
        .expect("prepare wide");
    assert_ne!(small.handle(), wide.handle());
    assert_eq!(backend.live_handles(), 2);

    let manager = WorkspaceManager::new(&device);
    let small_ws = manager.acquire(small.workspace_bytes()).expect("ws");
    let wide_ws = manager.acquire(wide.workspace_bytes()).expect("ws");
    wide.execute(&wide_ws, wide_out.data(), &[wide_in.data()])
        .expect("execute wide");
    small
        .execute(&small_ws, small_out.data(), &[small_in.data()])
        .expect("execute small");
    wide.destroy().expect("destroy wide");
    small
        .execute(&small_ws, small_out.data(), &[small_in.data()])
        .expect("small survives the other destroy");

    let expected = softmax_last_axis(&[3, 3], &small_in.read_logical().expect("read"));
    assert_approx_eq(&small_out.read_logical().expect("read"), &expected, 1e-6);
    let expected = softmax_last_axis(&[2, 8], &wide_in.read_logical().expect("read"));
    assert_approx_eq(&wide_out.read_logical().expect("read"), &expected, 1e-6);
}

#[test]
fn undersized_workspace_is_rejected() {
    let device = Device::cpu();
    let client = OpClient::new(Arc::new(HostBackend::new()), &device);
    let (input, output) = softmax_tensors(&[3, 3], &device);
    let descriptor = client
        .create(
            OpKind::Softmax,
            output.descriptor().expect("view"),
            &[input.descriptor().expect("view")],
        )
        .expect("create")
        .prepare()
        .expect("prepare");
    let err = descriptor
        .execute(&Workspace::empty(), output.data(), &[input.data()])
        .expect_err("empty workspace");
    match err {
        OpError::WorkspaceTooSmall {
            required, provided, ..
        } => {
            assert_eq!(required, 12);
            assert_eq!(provided, 0);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn incompatible_shapes_fail_at_create() {
    let device = Device::cpu();
    let client = OpClient::new(Arc::new(HostBackend::new()), &device);
    let a = TestTensor::new(&[4, 4], None, ElementType::F32, &device, Fill::Zeros).expect("a");
    let b = TestTensor::new(&[4, 5], None, ElementType::F32, &device, Fill::Zeros).expect("b");
    let c = TestTensor::new(&[4, 4], None, ElementType::F32, &device, Fill::Zeros).expect("c");
    let err = client
        .create(
            OpKind::Add,
            c.descriptor().expect("view"),
            &[a.descriptor().expect("view"), b.descriptor().expect("view")],
        )
        .expect_err("shape mismatch");
    match err {
        OpError::InvalidLayout { shape, .. } => assert_eq!(shape, vec![4, 4]),
        other => panic!("unexpected error {other:?}"),
    }

    let half = TestTensor::new(&[4, 4], None, ElementType::F16, &device, Fill::Zeros).expect("f16");
    let err = client
        .create(
            OpKind::Add,
            c.descriptor().expect("view"),
            &[a.descriptor().expect("view"), half.descriptor().expect("view")],
        )
        .expect_err("type mismatch");
    assert!(matches!(err, OpError::InvalidLayout { .. }));
}

#[test]
fn wrong_arity_and_dead_views_are_argument_errors() {
    let device = Device::cpu();
    let client = OpClient::new(Arc::new(HostBackend::new()), &device);
    let (mut input, output) = softmax_tensors(&[3, 3], &device);
    let err = client
        .create(
            OpKind::Softmax,
            output.descriptor().expect("view"),
            &[input.descriptor().expect("view"), input.descriptor().expect("view")],
        )
        .expect_err("softmax takes one input");
    assert!(matches!(err, OpError::InvalidArgument { .. }));

    let stale = input.descriptor().expect("view").clone();
    input.destroy_desc();
    let err = client
        .create(OpKind::Softmax, output.descriptor().expect("view"), &[&stale])
        .expect_err("destroyed view");
    assert!(matches!(err, OpError::InvalidArgument { .. }));
}

#[test]
fn add_needs_no_workspace_and_handles_strided_operands() {
    let device = Device::cpu();
    let client = OpClient::new(Arc::new(HostBackend::new()), &device);
    let a_values = ramp(52, 0.5);
    let b_values = ramp(52, 0.25);
    let a = TestTensor::from_values(&a_values, &[13, 4], Some(&[10, 1]), ElementType::F64, &device)
        .expect("a");
    let b = TestTensor::from_values(&b_values, &[13, 4], None, ElementType::F64, &device)
        .expect("b");
    let c = TestTensor::new(&[13, 4], Some(&[1, 13]), ElementType::F64, &device, Fill::Zeros)
        .expect("c");
    let descriptor = client
        .create(
            OpKind::Add,
            c.descriptor().expect("view"),
            &[a.descriptor().expect("view"), b.descriptor().expect("view")],
        )
        .expect("create")
        .prepare()
        .expect("prepare");
    assert_eq!(descriptor.workspace_bytes(), 0);
    descriptor
        .execute(&Workspace::empty(), c.data(), &[a.data(), b.data()])
        .expect("execute");
    let expected: Vec<f64> = a_values.iter().zip(b_values.iter()).map(|(x, y)| x + y).collect();
    assert_eq!(c.read_logical().expect("read"), expected);
}

#[test]
fn stream_execution_is_visible_after_synchronize() {
    let device = Device::cpu_stream(0);
    let client = OpClient::new(Arc::new(HostBackend::new()), &device);
    let (input, output) = softmax_tensors(&[8, 16], &device);
    let descriptor = client
        .create(
            OpKind::Softmax,
            output.descriptor().expect("view"),
            &[input.descriptor().expect("view")],
        )
        .expect("create")
        .prepare()
        .expect("prepare");
    let workspace = WorkspaceManager::new(&device)
        .acquire(descriptor.workspace_bytes())
        .expect("workspace");
    descriptor
        .execute(&workspace, output.data(), &[input.data()])
        .expect("enqueue");
    device.synchronize().expect("synchronize");
    assert_eq!(device.stream().expect("stream").submitted(), 1);
    let expected = softmax_last_axis(&[8, 16], &input.read_logical().expect("read"));
    assert_approx_eq(&output.read_logical().expect("read"), &expected, 1e-6);
}

fn softmax_output_with_views(shape: &[usize], dtype: ElementType, release_views: bool) -> Vec<f64> {
    let backend = Arc::new(HostBackend::new());
    let device = Device::cpu();
    let client = OpClient::new(backend.clone(), &device);
    let count = shape.iter().product::<usize>();
    let mut input = TestTensor::from_values(&ramp(count, 0.03), shape, None, dtype, &device)
        .expect("input");
    let mut output = TestTensor::new(shape, None, dtype, &device, Fill::Zeros).expect("output");

    let descriptor = client
        .create(
            OpKind::Softmax,
            output.descriptor().expect("output view"),
            &[input.descriptor().expect("input view")],
        )
        .expect("create");
    if release_views {
        input.destroy_desc();
        output.destroy_desc();
    }
    let descriptor = descriptor.prepare().expect("prepare");
    let workspace = WorkspaceManager::new(&device)
        .acquire(descriptor.workspace_bytes())
        .expect("workspace");
    descriptor
        .execute(&workspace, output.data(), &[input.data()])
        .expect("execute");
    assert_eq!(input.has_descriptor(), !release_views);

    let values = output.read_logical().expect("output values");
    drop(workspace);
    descriptor.destroy().expect("destroy");
    assert_eq!(backend.live_handles(), 0);
    values
}

#[test]
fn results_do_not_depend_on_live_tensor_views() {
    for dtype in [ElementType::F16, ElementType::BF16, ElementType::F32] {
        for shape in [vec![3usize, 3], vec![32, 512], vec![4, 5, 6]] {
            let kept = softmax_output_with_views(&shape, dtype, false);
            let released = softmax_output_with_views(&shape, dtype, true);
            assert_eq!(kept.len(), released.len());
            for (idx, (a, b)) in kept.iter().zip(released.iter()).enumerate() {
                assert_eq!(a.to_bits(), b.to_bits(), "{dtype} {shape:?} differs at {idx}");
            }
        }
    }
}

#[test]
fn workspace_size_is_stable_across_descriptor_creations() {
    let device = Device::cpu();
    let shape = [32usize, 512];
    for dtype in [ElementType::F32, ElementType::BF16] {
        let mut sizes = Vec::new();
        for strides in [None, Some(vec![1024usize, 1])] {
            let backend = Arc::new(HostBackend::new());
            let client = OpClient::new(backend.clone(), &device);
            for _ in 0..8 {
                let input =
                    TestTensor::new(&shape, strides.as_deref(), dtype, &device, Fill::Zeros)
                        .expect("input");
                let output =
                    TestTensor::new(&shape, None, dtype, &device, Fill::Zeros).expect("output");
                let descriptor = client
                    .create(
                        OpKind::Softmax,
                        output.descriptor().expect("output view"),
                        &[input.descriptor().expect("input view")],
                    )
                    .expect("create");
                let queried = descriptor.workspace_size().expect("workspace size");
                let descriptor = descriptor.prepare().expect("prepare");
                assert_eq!(descriptor.workspace_bytes(), queried);
                sizes.push(queried);
                descriptor.destroy().expect("destroy");
            }
            assert_eq!(backend.live_handles(), 0);
        }
        assert_eq!(sizes.len(), 16);
        assert!(sizes.iter().all(|size| *size == sizes[0]), "{dtype}: {sizes:?}");
        assert_eq!(sizes[0], 512 * 4);
    }
}

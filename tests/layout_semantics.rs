use opcheck::layout::{
    contiguous_strides, numel, offset_of, required_elements, unravel, validate_layout,
};
use opcheck::{Layout, LayoutKind, OpError};

#[test]
fn contiguous_strides_are_row_major() {
    assert_eq!(contiguous_strides(&[32, 20, 512]), vec![10240, 512, 1]);
    assert_eq!(contiguous_strides(&[7]), vec![1]);
    assert!(contiguous_strides(&[]).is_empty());
}

#[test]
fn required_elements_covers_padded_rows() {
    assert_eq!(required_elements(&[32, 512], &[1024, 1]), Some(31 * 1024 + 511 + 1));
    assert_eq!(required_elements(&[3, 3], &[3, 1]), Some(9));
    assert_eq!(required_elements(&[4, 4], &[0, 1]), Some(4));
    assert_eq!(required_elements(&[2, 2], &[usize::MAX, 1]), None);
}

#[test]
fn layout_reports_contiguous_strided_and_aliased() {
    let contiguous = Layout::new(&[2, 2], None).expect("contiguous layout");
    assert_eq!(contiguous.kind(), LayoutKind::Contiguous);
    assert!(contiguous.is_contiguous());

    let strided = Layout::new(&[2, 2], Some(&[3, 1])).expect("strided layout");
    assert_eq!(strided.kind(), LayoutKind::Strided);
    assert!(!strided.is_contiguous());

    let aliased = Layout::new(&[3, 4], Some(&[0, 1])).expect("broadcast layout");
    assert_eq!(aliased.kind(), LayoutKind::Aliased);
    assert_eq!(aliased.required_elements(), 4);
}

#[test]
fn validate_layout_rejects_bad_shapes() {
    let err = validate_layout(&[], &[], 1, "test").expect_err("rank 0");
    assert!(matches!(err, OpError::InvalidLayout { .. }));

    let err = validate_layout(&[2, 2], &[1], 4, "test").expect_err("rank mismatch");
    assert!(matches!(err, OpError::InvalidLayout { .. }));

    let err = validate_layout(&[2, 0], &[1, 1], 4, "test").expect_err("zero dimension");
    assert!(matches!(err, OpError::InvalidLayout { .. }));

    let err = validate_layout(&[2, 2], &[3, 1], 4, "test").expect_err("storage too small");
    match err {
        OpError::InvalidLayout { shape, strides, .. } => {
            assert_eq!(shape, vec![2, 2]);
            assert_eq!(strides, vec![3, 1]);
        }
        other => panic!("unexpected error {other:?}"),
    }

    validate_layout(&[2, 2], &[3, 1], 5, "test").expect("exactly enough storage");
}

#[test]
fn offsets_follow_logical_row_major_order() {
    let transposed = Layout::new(&[2, 3], Some(&[1, 2])).expect("column-major layout");
    let offsets: Vec<usize> = transposed.offsets().collect();
    assert_eq!(offsets, vec![0, 2, 4, 1, 3, 5]);
    assert_eq!(transposed.offsets().len(), 6);

    let padded = Layout::new(&[2, 2], Some(&[3, 1])).expect("padded layout");
    let offsets: Vec<usize> = padded.offsets().collect();
    assert_eq!(offsets, vec![0, 1, 3, 4]);
}

#[test]
fn lanes_cover_every_innermost_row() {
    let layout = Layout::new(&[32, 20, 512], Some(&[20480, 512, 1])).expect("layout");
    assert_eq!(layout.lane(), (512, 1));
    let bases: Vec<usize> = layout.lane_offsets().collect();
    assert_eq!(bases.len(), 32 * 20);
    assert_eq!(bases[1], 512);
    assert_eq!(bases[20], 20480);

    let vector = Layout::new(&[5], None).expect("rank-1 layout");
    assert_eq!(vector.lane_offsets().collect::<Vec<_>>(), vec![0]);
}

#[test]
fn unravel_and_offset_of_agree_with_offsets() {
    let shape = [4, 3, 5];
    let strides = [40, 12, 2];
    let layout = Layout::new(&shape, Some(&strides)).expect("layout");
    for (flat, offset) in layout.offsets().enumerate() {
        let index = unravel(flat, &shape);
        assert_eq!(offset_of(&index, &strides), offset);
    }
    assert_eq!(numel(&shape), 60);
}

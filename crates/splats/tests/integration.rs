//! Integration tests for the splats crate: disk round-trips through the
//! public API and the positional ordering contract.

use burn::backend::ndarray::NdArray;
use burn::prelude::*;
use tempfile::TempDir;

use splats::reference::write_sample;
use splats::{GaussianSplatSet, ReferenceDataset};

type TestBackend = NdArray<f32>;

fn indexed_set(index: usize, device: &<TestBackend as Backend>::Device) -> GaussianSplatSet<TestBackend> {
    let fill = index as f32 + 1.0;
    GaussianSplatSet {
        xyz: Tensor::full([1, 6, 3], fill, device),
        rotation: Tensor::full([1, 6, 4], fill, device),
        scaling: Tensor::full([1, 6, 3], fill, device),
        opacity: Tensor::full([1, 6, 1], 0.5, device),
        features_dc: Tensor::full([1, 6, 1, 3], fill, device),
        features_rest: Tensor::full([1, 6, 3, 3], fill, device),
    }
}

#[test]
fn test_write_then_load_preserves_positional_order() {
    let device = Default::default();
    let dir = TempDir::new().unwrap();
    // Written out of order on purpose; sorted names must win.
    for index in [2usize, 0, 1] {
        write_sample(dir.path(), &format!("{index:05}"), &indexed_set(index, &device)).unwrap();
    }

    let dataset = ReferenceDataset::open(dir.path()).unwrap();
    assert_eq!(dataset.len(), 3);
    for index in 0..3 {
        let set = dataset.load::<TestBackend>(index, &device).unwrap();
        let values: Vec<f32> = set.xyz.into_data().to_vec().unwrap();
        assert!(
            values.iter().all(|v| (v - (index as f32 + 1.0)).abs() < 1e-6),
            "sample {index} does not match its sorted position"
        );
    }
}

#[test]
fn test_gap_in_reference_set_is_not_fatal() {
    let device = Default::default();
    let dir = TempDir::new().unwrap();
    write_sample(dir.path(), "00000", &indexed_set(0, &device)).unwrap();
    // Sample folder exists but holds no record.
    std::fs::create_dir(dir.path().join("00001")).unwrap();
    write_sample(dir.path(), "00002", &indexed_set(2, &device)).unwrap();

    let dataset = ReferenceDataset::open(dir.path()).unwrap();
    assert_eq!(dataset.len(), 3);
    assert!(dataset.load::<TestBackend>(0, &device).is_some());
    assert!(dataset.load::<TestBackend>(1, &device).is_none());
    assert!(dataset.load::<TestBackend>(2, &device).is_some());
}

#[test]
fn test_loaded_batches_concat_for_training() {
    let device = Default::default();
    let dir = TempDir::new().unwrap();
    for index in 0..4 {
        write_sample(dir.path(), &format!("{index:05}"), &indexed_set(index, &device)).unwrap();
    }
    let dataset = ReferenceDataset::open(dir.path()).unwrap();
    let sets: Vec<_> = (0..4).map(|i| dataset.load::<TestBackend>(i, &device).unwrap()).collect();
    let merged = GaussianSplatSet::concat(sets).unwrap();
    assert_eq!(merged.batch_size(), 4);
    merged.validate().unwrap();
}

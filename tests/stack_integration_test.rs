//! End-to-end stacking runs over a directory of slice images

use std::path::Path;
use tempfile::TempDir;
use zstack::{
    run, DataType, ImageMetadata, ImageShape, LengthUnit, PhysicalSize, PhysicalSizes, Region,
    StackConfig, StackError, TileSize, TiledImageReader, TiledImageWriter,
};

fn calibrated() -> PhysicalSizes {
    PhysicalSizes::new(
        Some(PhysicalSize::new(0.65, LengthUnit::Micrometer)),
        Some(PhysicalSize::new(0.65, LengthUnit::Micrometer)),
        Some(PhysicalSize::new(2.0, LengthUnit::Micrometer)),
    )
}

/// Write a u8 slice whose samples encode (channel, z, x)
async fn write_slice(path: &Path, channel: u8, z: u8, width: usize, height: usize) {
    let metadata = ImageMetadata::new(ImageShape::xyz(width, height, 1), DataType::U8)
        .with_tile_size(TileSize::square(16))
        .with_physical_size(calibrated());
    let writer = TiledImageWriter::create(path, metadata, 2).await.unwrap();
    let data: Vec<u8> = (0..width * height)
        .map(|i| channel * 50 + z * 10 + (i % width % 10) as u8)
        .collect();
    writer
        .write_region(&Region::new(0..width, 0..height, 0, 0, 0), &data)
        .await
        .unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_run_stacks_every_group() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("in");
    let output = temp_dir.path().join("out");
    std::fs::create_dir_all(&input).unwrap();

    for c in 1..=4u8 {
        for z in 1..=3u8 {
            let name = format!("img_c{}_z{:02}.zvol", c, z);
            write_slice(&input.join(name), c, z, 40, 24).await;
        }
    }
    // Ignored by enumeration
    std::fs::write(input.join(".DS_Store"), b"junk").unwrap();

    // More groups than workers
    let config = StackConfig::new(&input, &output, "img_c{c}_z{zz}.zvol")
        .with_workers(Some(2))
        .with_max_chunk_edge(16);
    let report = run(&config).await.unwrap();
    assert!(report.is_success(), "failures: {:?}", report.failures);
    assert_eq!(report.total(), 4);

    for c in 1..=4u8 {
        let name = format!("img_c{}_z(01-03).zvol", c);
        assert!(report.succeeded.contains(&name));

        let reader = TiledImageReader::open(output.join(&name)).await.unwrap();
        assert_eq!(reader.metadata().shape, ImageShape::xyz(40, 24, 3));
        assert_eq!(
            reader.metadata().physical_size.z,
            Some(PhysicalSize::new(2.0, LengthUnit::Micrometer))
        );

        for z in 0..3u8 {
            let plane = reader
                .read_region(&Region::new(0..40, 0..24, z as usize, 0, 0))
                .await
                .unwrap();
            assert_eq!(plane[0], c * 50 + (z + 1) * 10);
            assert_eq!(plane[39], c * 50 + (z + 1) * 10 + 9);
        }
    }
}

#[tokio::test]
async fn test_failed_group_does_not_affect_others() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("in");
    let output = temp_dir.path().join("out");
    std::fs::create_dir_all(&input).unwrap();

    write_slice(&input.join("img_c1_z01.zvol"), 1, 1, 32, 16).await;
    write_slice(&input.join("img_c1_z02.zvol"), 1, 2, 32, 16).await;
    write_slice(&input.join("img_c2_z01.zvol"), 2, 1, 32, 16).await;
    write_slice(&input.join("img_c2_z02.zvol"), 2, 2, 33, 16).await;

    let config = StackConfig::new(&input, &output, "img_c{c}_z{zz}.zvol").with_workers(Some(2));
    let report = run(&config).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.succeeded, vec!["img_c1_z(01-02).zvol".to_string()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].job, "img_c2_z(01-02).zvol");
    assert!(matches!(
        report.failures[0].error,
        StackError::MetadataInconsistency { field: "x", .. }
    ));

    let mut entries: Vec<String> = std::fs::read_dir(&output)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["img_c1_z(01-02).zvol".to_string()]);
}

#[tokio::test]
async fn test_pattern_mismatch_fails_before_any_job() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("in");
    let output = temp_dir.path().join("out");
    std::fs::create_dir_all(&input).unwrap();

    write_slice(&input.join("img_c1_z01.zvol"), 1, 1, 8, 8).await;
    std::fs::write(input.join("notes.txt"), b"not a slice").unwrap();

    let config = StackConfig::new(&input, &output, "img_c{c}_z{zz}.zvol");
    match run(&config).await {
        Err(StackError::PatternMismatch { name, .. }) => assert_eq!(name, "notes.txt"),
        other => panic!("expected pattern mismatch, got {:?}", other.map(|r| r.total())),
    }
    assert!(!output.exists());
}

#[tokio::test]
async fn test_duplicate_z_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("in");
    std::fs::create_dir_all(&input).unwrap();

    write_slice(&input.join("img_z1.zvol"), 0, 1, 8, 8).await;
    write_slice(&input.join("img_z01.zvol"), 0, 1, 8, 8).await;

    let config = StackConfig::new(&input, temp_dir.path().join("out"), "img_z{z+}.zvol");
    let err = run(&config).await.unwrap_err();
    assert!(matches!(err, StackError::DuplicateSlice { z: 1, .. }));
    assert!(err.is_pre_job());
}

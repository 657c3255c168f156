//! Example: Create a seismic volume, write it through page accessors and
//! read it back with asynchronous subset/sample requests
//!
//! Run with: cargo run --example seismic_subset

use vds_access::{
    AccessManagerOptions, AccessMode, AxisDescriptor, BrickSize, ChannelDescriptor, Dataset,
    DimensionsND, FileVolumeStore, InterpolationMethod, ValueRange, VolumeLayout, VolumeStore,
    VoxelFormat, VoxelRange,
};

use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("VDS Access Example: Seismic Subset Requests");
    println!("===========================================\n");

    // Define a small 3D seismic volume
    let axes = vec![
        AxisDescriptor::new(128, "Inline", "trace", 1000.0, 1127.0),
        AxisDescriptor::new(96, "Crossline", "trace", 2000.0, 2095.0),
        AxisDescriptor::new(64, "Depth", "ms", 0.0, 252.0),
    ];
    let channels = vec![ChannelDescriptor::new(
        VoxelFormat::R32,
        "Amplitude",
        "",
        ValueRange::new(-1.0, 1.0),
    )];
    let layout = VolumeLayout::new(axes, channels)?
        .with_brick_size(BrickSize::new([32, 32, 32, 1, 1, 1]));

    println!("Layout info:");
    println!("  {}", layout.summary());
    println!();

    // Create the dataset on the local filesystem
    let temp_dir = tempfile::tempdir()?;
    println!("Creating volume at: {}", temp_dir.path().display());
    let store = Arc::new(FileVolumeStore::new(temp_dir.path()));
    let dataset = Dataset::create(
        store as Arc<dyn VolumeStore>,
        layout,
        AccessManagerOptions::default(),
    )?;
    let manager = dataset.access_manager();
    println!("✓ Volume created\n");

    // Write a synthetic wavefield chunk by chunk
    println!("Writing synthetic data through a page accessor...");
    let mut writer = manager.create_page_accessor(
        DimensionsND::Dimensions012,
        0,
        0,
        8,
        AccessMode::Create,
        1024,
    )?;
    for chunk in 0..writer.chunk_count() {
        let mut page = writer.create_page(chunk)?;
        let (min, max) = page.min_max();
        let extent_y = (max[1] - min[1]) as usize;
        let extent_z = (max[2] - min[2]) as usize;
        let buffer = page.writable_buffer()?;
        for x in min[0]..max[0] {
            for y in min[1]..max[1] {
                for z in min[2]..max[2] {
                    let local = ((x - min[0]) as usize * extent_y + (y - min[1]) as usize)
                        * extent_z
                        + (z - min[2]) as usize;
                    let value = (0.05 * (x as f32) + 0.1 * (y as f32)).sin()
                        * (0.2 * (z as f32)).cos();
                    buffer[local * 4..local * 4 + 4].copy_from_slice(&value.to_ne_bytes());
                }
            }
        }
        writer.release_page(page)?;
    }
    writer.commit()?;
    manager.flush_upload_queue(true);
    println!(
        "✓ {} chunks committed, {} upload errors\n",
        writer.chunk_count(),
        manager.upload_error_count()
    );

    // Launch several requests concurrently; dispatch never blocks
    println!("Dispatching concurrent requests:");
    let subset = manager.request_volume_subset(
        VoxelRange::normalize(&[16, 8, 0], &[48, 40, 64]),
        DimensionsND::Dimensions012,
        0,
        0,
        VoxelFormat::R32,
        None,
        None,
    )?;
    let samples = manager.request_volume_samples(
        &[
            [20.5, 10.5, 30.5, 0.0, 0.0, 0.0],
            [64.5, 48.5, 32.5, 0.0, 0.0, 0.0],
        ],
        DimensionsND::Dimensions012,
        0,
        0,
        InterpolationMethod::Linear,
        None,
    )?;
    let traces = manager.request_volume_traces(
        &[[40.5, 20.5, 0.0, 0.0, 0.0, 0.0]],
        2,
        DimensionsND::Dimensions012,
        0,
        0,
        InterpolationMethod::Cubic,
        None,
    )?;

    let subset_data = subset.data_as::<f32>()?;
    println!(
        "  Subset {:?}: {} samples ({}), first = {:.4}",
        subset.shape(),
        subset_data.len(),
        vds_access::utils::format_bytes(subset_data.len() * 4),
        subset_data[0]
    );
    let sample_data = samples.data_as::<f32>()?;
    println!("  Samples: {:?}", sample_data);
    let trace_data = traces.data_as::<f32>()?;
    println!(
        "  Trace: {} samples, peak = {:.4}",
        trace_data.len(),
        trace_data.iter().cloned().fold(f32::MIN, f32::max)
    );

    println!("\n✓ Example complete!");
    Ok(())
}

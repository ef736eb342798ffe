//! Example: write a 3D field, then read it back at several resolutions
//!
//! Run with: cargo run --example write_read

use anyhow::Context;
use std::sync::Arc;
use vdc::{
    CalcRegion, DataMgr, Pipeline, VarType, VdcAccess, VdcMetadata, VolumeReader, VoxelCoord,
};

/// Magnitude of the (u, v) pair
struct Speed;

impl Pipeline for Speed {
    fn name(&self) -> &str {
        "speed"
    }

    fn inputs(&self) -> Vec<String> {
        vec!["u".to_string(), "v".to_string()]
    }

    fn outputs(&self) -> Vec<(String, VarType)> {
        vec![("speed".to_string(), VarType::Var3D)]
    }

    fn calculate(&self, _region: &CalcRegion, inputs: &[&[f32]]) -> vdc::Result<Vec<Vec<f32>>> {
        let speed = inputs[0]
            .iter()
            .zip(inputs[1])
            .map(|(u, v)| (u * u + v * v).sqrt())
            .collect();
        Ok(vec![speed])
    }
}

fn main() -> anyhow::Result<()> {
    println!("VDC Example: Multiresolution Write/Read");
    println!("=======================================\n");

    let dims = [64, 48, 32];
    let metadata = VdcMetadata::new(dims, [16, 16, 16], 2)
        .with_wavelet(2, 2)
        .with_extents([0.0, 0.0, 0.0, 6.4, 4.8, 3.2])
        .with_variable("u", VarType::Var3D)
        .with_variable("v", VarType::Var3D);

    let temp_dir = tempfile::tempdir()?;
    let path = temp_dir.path().join("vortex");
    let url = path.to_string_lossy().to_string();
    println!("Creating dataset at: {}", path.display());
    let vdc = VdcAccess::create(url.clone(), metadata)?;

    // A rotating flow around the volume's center axis
    let (cx, cy) = (dims[0] as f32 / 2.0, dims[1] as f32 / 2.0);
    let mut u = Vec::with_capacity(dims.iter().product());
    let mut v = Vec::with_capacity(u.capacity());
    for z in 0..dims[2] {
        for y in 0..dims[1] {
            for x in 0..dims[0] {
                let (dx, dy) = (x as f32 - cx, y as f32 - cy);
                let falloff = (-(dx * dx + dy * dy) / 400.0).exp() * (1.0 + z as f32 / 32.0);
                u.push(-dy * falloff);
                v.push(dx * falloff);
            }
        }
    }

    let mut writer = vdc.slab_writer()?;
    for (name, data) in [("u", &u), ("v", &v)] {
        writer.open_variable_write(0, name, None)?;
        writer.write_volume(data)?;
        writer.close_variable()?;
    }
    println!("✓ Wrote u and v with 2 transforms\n");

    let stats = vdc.get_stats("u")?;
    println!("Variable statistics:");
    println!("  {}", stats.summary());
    println!("  u range: {:?}", vdc.data_range(0, "u")?);
    println!();

    // A corner region read straight from the files
    let corner = vdc.read_region(0, "u", 2, VoxelCoord::new(0, 0, 0), VoxelCoord::new(3, 3, 3))?;
    println!("Corner region: {} samples, first {:.4}", corner.len(), corner[0]);
    println!();

    let mut dm = DataMgr::open(url, 64).context("opening data manager")?;
    dm.new_pipeline(Arc::new(Speed))?;

    println!("Speed at the domain center by refinement level:");
    for level in 0..=dm.num_transforms() {
        let grid = dm.get_variable(0, "speed", level, 0, false)?;
        let center = grid.value(3.2, 2.4, 1.6);
        println!(
            "  level {}: dims {:?}, value {:?}, range {:?}",
            level,
            grid.dimensions(),
            center,
            grid.range()
        );
    }
    println!();

    println!("Cache holds {} regions in {} blocks", dm.cache().len(), dm.cache().pool().in_use());
    Ok(())
}

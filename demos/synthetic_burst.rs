// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Simulates a binary burst of a smooth scene drifting across the sensor
//! and reconstructs it. Run with `cargo run --example synthetic_burst`.

use flexi_logger::Logger;
use libqbp::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SIZE: usize = 128;
const FRAMES: usize = 64;

fn scene(x: f64, y: f64) -> f64 {
    let r = ((x - 64.0).powi(2) + (y - 64.0).powi(2)).sqrt();
    0.2 + 0.6 * (0.5 + 0.5 * (r / 6.0).sin()) * (0.5 + 0.5 * (x / 9.0).cos())
}

fn main() -> Result<(), QbpError> {
    let _logger = Logger::try_with_env_or_str("info")
        .and_then(|l| l.start())
        .map_err(|e| QbpError::ProcessingError(format!("logger initialization failed: {e}")))?;

    let mut rng = StdRng::seed_from_u64(2025);
    // drift of 0.1 px per frame to the right and 0.05 px down
    let frames: Vec<Frame> = (0..FRAMES)
        .map(|k| {
            let (ox, oy) = (0.1 * k as f64, 0.05 * k as f64);
            Frame::from_plane(Plane::from_fn(SIZE, SIZE, |x, y| {
                let flux = scene(x as f64 - ox, y as f64 - oy);
                let p = 1.0 - (-flux).exp();
                if rng.random_bool(p) { 1.0 } else { 0.0 }
            }))
        })
        .collect();

    let params = BurstParams {
        align_tw_size: 8,
        align_tw_num: 8,
        merge_tw_size: 4,
        merge_tw_num: 16,
        ..Default::default()
    };
    let now = std::time::Instant::now();
    let r = reconstruct(&frames, &params, None)?;
    println!("Calculated reconstruct() in {:?}", now.elapsed());

    for (i, flow) in r.flows.iter().enumerate() {
        if let Some([dx, dy]) = flow.median_displacement() {
            println!("block {i}: median flow ({dx:+.2}, {dy:+.2})");
        }
    }
    // frame 32 is the reference, it sees the scene moved by (3.1, 1.55)
    let err = |img: &Frame| {
        let p = img.channel(0);
        let mut sum = 0.0;
        let mut n = 0usize;
        for y in 16..SIZE - 16 {
            for x in 16..SIZE - 16 {
                let v = p.get(x, y);
                if v.is_finite() {
                    sum += (v - scene(x as f64 - 3.1, y as f64 - 1.55)).abs();
                    n += 1;
                }
            }
        }
        sum / n.max(1) as f64
    };
    println!("mean abs error, naive: {:.4}", err(&r.naive.burst.intensity));
    println!("mean abs error, merged: {:.4}", err(&r.intensity));
    Ok(())
}

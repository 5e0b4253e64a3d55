use flexi_logger::Logger;
use libqbp::prelude::*;
use libqbp::utils::{read_binary_frames, write_counts, write_intensity};
use std::path::PathBuf;

const USAGE: &str = "usage: qbp <params.json> <frames-dir> <out-dir>";

fn main() -> Result<(), QbpError> {
    let _logger = Logger::try_with_env_or_str("info")
        .and_then(|l| l.start())
        .map_err(|e| QbpError::ProcessingError(format!("logger initialization failed: {e}")))?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [params, frames, out] = args.as_slice() else {
        eprintln!("{USAGE}");
        return Err(QbpError::InvalidParams(USAGE.to_string()));
    };
    let params = BurstParams::from_json_file(params)?;
    let out = PathBuf::from(out);
    std::fs::create_dir_all(&out)?;

    let now = std::time::Instant::now();
    let frames = read_binary_frames(&PathBuf::from(frames), params.n_binary == 1)?;
    log::info!("read {} frames in {:?}", frames.len(), now.elapsed());

    let now = std::time::Instant::now();
    let r = reconstruct(&frames, &params, None)?;
    log::info!("reconstructed in {:?}", now.elapsed());
    for (i, flow) in r.flows.iter().enumerate() {
        if let Some([dx, dy]) = flow.median_displacement() {
            log::info!("block {i}: median flow ({dx:.3}, {dy:.3})");
        }
    }
    if !r.degenerate.is_empty() {
        log::warn!("{} patches had no valid match", r.degenerate.len());
    }

    write_counts(&out.join("naive_counts.png"), &r.naive.counts)?;
    write_intensity(&out.join("naive.png"), &r.naive.burst.intensity)?;
    write_intensity(&out.join("naive_ref.png"), &r.naive.reference.intensity)?;
    write_counts(&out.join("merged_counts.png"), &r.merged_counts)?;
    write_intensity(&out.join("result.png"), &r.intensity)?;
    log::info!("results written to {}", out.display());
    Ok(())
}

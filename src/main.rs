//! Run a raw guest image under KVM.
//!
//! Usage: microvmm [config.json]
//!
//! Without a config the built-in demo guest writes 0x42 to port 0x10 and
//! halts. The process exit code is 0 when the guest halts or shuts down and
//! `VmmError::exit_code()` otherwise.

use anyhow::Context;
use microvmm::{run_vm, VmmConfig, DEMO_PAYLOAD};
use std::env;
use std::path::Path;
use std::process::ExitCode;

fn load(config_path: Option<&str>) -> anyhow::Result<(VmmConfig, Vec<u8>)> {
    let config = match config_path {
        Some(path) => VmmConfig::from_json_file(Path::new(path))
            .with_context(|| format!("loading config {}", path))?,
        None => VmmConfig::default(),
    };
    let payload = match &config.payload {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("reading guest image {}", path.display()))?,
        None => DEMO_PAYLOAD.to_vec(),
    };
    Ok((config, payload))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let (config, payload) = match load(args.get(1).map(String::as_str)) {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("{:#}", e);
            return ExitCode::from(1);
        }
    };

    match run_vm(&config, &payload) {
        Ok(report) => {
            log::info!(
                "guest stopped: {:?} after {} exits ({} out, {} in)",
                report.stop,
                report.exits,
                report.io_out,
                report.io_in
            );
            if let Ok(json) = serde_json::to_string(&report) {
                log::debug!("report: {}", json);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("VM error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

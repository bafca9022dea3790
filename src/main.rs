use std::env;
use std::io;
use std::path::PathBuf;

use log::{error, info};
use structured_logger::json::new_writer;
use structured_logger::Builder;

use osm_frames::errors::Result;
use osm_frames::{run, UserConfig};

const DEFAULT_CONFIG_PATH: &str = "config/osm.json";

fn setup_logging(level: &str) {
    Builder::with_level(level)
        .with_target_writer("*", new_writer(io::stdout()))
        .init();
}

fn main() -> Result<()> {
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let user_config = UserConfig::load(&config_path)?;
    setup_logging(&user_config.log_level);

    info!(config = &*config_path.to_string_lossy(), dest_path = user_config.dest_path.as_str(); "Loaded config");
    if let Err(err) = run(&user_config) {
        error!(err = err.message.as_str(); "Run failed");
        return Err(err);
    }
    Ok(())
}

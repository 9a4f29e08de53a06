//! GStreamer initialization for the GStreamer output backend
//!
//! `gstreamer::init` may be called any number of times, but the environment
//! tweaks below must happen before the first call, so everything goes through
//! `init_gstreamer` exactly once per process.

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static GSTREAMER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Extra plugin directory picked up before GStreamer scans its registry
pub const PLUGIN_PATH_ENV: &str = "ASREC_GST_PLUGIN_PATH";

/// Initialize GStreamer once. Later calls return the first call's outcome.
pub fn init_gstreamer() -> Result<(), String> {
    GSTREAMER_INIT
        .get_or_init(|| {
            if let Some(dir) = private_plugin_dir() {
                prepend_plugin_path(&dir);
            }

            match gstreamer::init() {
                Ok(()) => {
                    log::info!("GStreamer initialized successfully");
                    log_gstreamer_version();
                    Ok(())
                }
                Err(e) => {
                    log::error!("Failed to initialize GStreamer: {}", e);
                    log::error!("The GStreamer output backend will not be available");
                    Err(e.to_string())
                }
            }
        })
        .clone()
}

/// Plugin directory requested through `ASREC_GST_PLUGIN_PATH`, if it exists
fn private_plugin_dir() -> Option<PathBuf> {
    let dir = PathBuf::from(env::var_os(PLUGIN_PATH_ENV)?);
    if dir.is_dir() {
        Some(dir)
    } else {
        log::warn!("{} points at {:?}, which is not a directory", PLUGIN_PATH_ENV, dir);
        None
    }
}

fn prepend_plugin_path(dir: &PathBuf) {
    let mut paths = vec![dir.clone()];
    if let Some(existing) = env::var_os("GST_PLUGIN_PATH") {
        paths.extend(env::split_paths(&existing));
    }
    match env::join_paths(paths) {
        Ok(joined) => {
            env::set_var("GST_PLUGIN_PATH", &joined);
            log::debug!("Set GST_PLUGIN_PATH: {}", joined.to_string_lossy());
        }
        Err(e) => log::warn!("Cannot extend GST_PLUGIN_PATH with {:?}: {}", dir, e),
    }
}

fn log_gstreamer_version() {
    let (major, minor, micro, nano) = gstreamer::version();
    let nano_str = match nano {
        0 => String::new(),
        1 => " (CVS)".to_string(),
        2 => " (prerelease)".to_string(),
        _ => format!(" (nano: {})", nano),
    };
    log::info!("GStreamer version: {}.{}.{}{}", major, minor, micro, nano_str);
}

/// Whether an element factory is installed (e.g. `x264enc`)
pub fn has_element(name: &str) -> bool {
    init_gstreamer().is_ok() && gstreamer::ElementFactory::find(name).is_some()
}

/// Information about the GStreamer installation for diagnostics
#[derive(Debug, Clone)]
pub struct GStreamerInfo {
    pub is_available: bool,
    pub version: Option<String>,
    pub plugin_path: Option<String>,
}

pub fn gstreamer_info() -> GStreamerInfo {
    let version = init_gstreamer().ok().map(|_| {
        let (major, minor, micro, _) = gstreamer::version();
        format!("{}.{}.{}", major, minor, micro)
    });

    GStreamerInfo {
        is_available: version.is_some(),
        version,
        plugin_path: env::var("GST_PLUGIN_PATH").ok(),
    }
}

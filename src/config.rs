//! Configuration options
//!
//! The decoder can be configured at runtime using environment variables or
//! by using functions in this module. Options set by calling functions in this
//! module override options set in environment variables, and thread-local
//! options override both.
//!
//! ```
//! use jp2_tiles::config::*;
//!
//! // Limit prefetching to two worker threads
//! set_config_option("GDAL_NUM_THREADS", "2").unwrap();
//! assert_eq!(get_config_option("GDAL_NUM_THREADS", ""), "2");
//!
//! // Back to the default
//! clear_config_option("GDAL_NUM_THREADS").unwrap();
//! assert_eq!(get_config_option("GDAL_NUM_THREADS", "ALL_CPUS"), "ALL_CPUS");
//! ```

use std::cell::RefCell;
use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::errors::{Jp2Error, Result};

/// Maximum number of prefetch workers, `ALL_CPUS` or an integer.
pub const NUM_THREADS: &str = "GDAL_NUM_THREADS";
/// Block cache budget, in megabytes below 100000 and in bytes above.
pub const CACHE_MAX: &str = "GDAL_CACHEMAX";
/// Whether a 1-bit alpha band is exposed as 0/255 instead of 0/1.
pub const PROMOTE_1BIT_ALPHA: &str = "JP2OPENJPEG_PROMOTE_1BIT_ALPHA_AS_8BIT";
/// Single-tile images larger than this are decoded window by window.
pub const TILE_SIZE_CAP: &str = "JP2OPENJPEG_TILE_SIZE_CAP";

pub const DEFAULT_CACHE_MAX: usize = 64 * 1024 * 1024;
pub const DEFAULT_TILE_SIZE_CAP: usize = 1024;
pub const MAX_THREADS: usize = 128;

static GLOBAL_OPTIONS: Lazy<RwLock<HashMap<String, String>>> = Lazy::new(Default::default);

thread_local! {
    static THREAD_OPTIONS: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(|c| c == '=' || c == '\0') {
        return Err(Jp2Error::BadArgument(format!(
            "Invalid configuration key: '{}'",
            key.escape_debug()
        )));
    }
    Ok(())
}

fn check_value(value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(Jp2Error::BadArgument(format!(
            "Invalid configuration value: '{}'",
            value.escape_debug()
        )));
    }
    Ok(())
}

/// Set a configuration option
pub fn set_config_option(key: &str, value: &str) -> Result<()> {
    check_key(key)?;
    check_value(value)?;
    GLOBAL_OPTIONS
        .write()
        .insert(key.to_string(), value.to_string());
    Ok(())
}

/// Get the value of a configuration option
///
/// Thread-local options win over global ones, global ones over the process
/// environment. If the option is found nowhere, `default` is returned.
pub fn get_config_option(key: &str, default: &str) -> String {
    if let Some(value) = THREAD_OPTIONS.with(|options| options.borrow().get(key).cloned()) {
        return value;
    }
    if let Some(value) = GLOBAL_OPTIONS.read().get(key) {
        return value.clone();
    }
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Clear the value of a configuration option
pub fn clear_config_option(key: &str) -> Result<()> {
    check_key(key)?;
    GLOBAL_OPTIONS.write().remove(key);
    Ok(())
}

/// Set a configuration option with **thread local** scope
pub fn set_thread_local_config_option(key: &str, value: &str) -> Result<()> {
    check_key(key)?;
    check_value(value)?;
    THREAD_OPTIONS.with(|options| {
        options
            .borrow_mut()
            .insert(key.to_string(), value.to_string())
    });
    Ok(())
}

/// Get the value of a configuration option with **thread local** scope
pub fn get_thread_local_config_option(key: &str, default: &str) -> String {
    THREAD_OPTIONS
        .with(|options| options.borrow().get(key).cloned())
        .unwrap_or_else(|| default.to_string())
}

/// Clear the value of a configuration option with **thread local** scope
pub fn clear_thread_local_config_option(key: &str) -> Result<()> {
    check_key(key)?;
    THREAD_OPTIONS.with(|options| options.borrow_mut().remove(key));
    Ok(())
}

/// Interpret a string the way GDAL's `CPLTestBool` does.
pub fn parse_bool(value: &str) -> bool {
    !matches!(
        value.to_ascii_uppercase().as_str(),
        "NO" | "FALSE" | "OFF" | "0"
    )
}

pub fn get_config_bool(key: &str, default: bool) -> bool {
    let value = get_config_option(key, "");
    if value.is_empty() {
        default
    } else {
        parse_bool(&value)
    }
}

/// Resolve the prefetch worker count from [`NUM_THREADS`].
pub fn num_threads() -> usize {
    let value = get_config_option(NUM_THREADS, "ALL_CPUS");
    let threads = if value.eq_ignore_ascii_case("ALL_CPUS") {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        value.trim().parse::<i64>().unwrap_or(0).max(0) as usize
    };
    threads.clamp(1, MAX_THREADS)
}

/// Resolve the block cache budget in bytes from [`CACHE_MAX`].
pub fn cache_max() -> usize {
    match get_config_option(CACHE_MAX, "").trim().parse::<usize>() {
        Ok(value) if value < 100_000 => value * 1024 * 1024,
        Ok(value) => value,
        Err(_) => DEFAULT_CACHE_MAX,
    }
}

pub fn tile_size_cap() -> usize {
    get_config_option(TILE_SIZE_CAP, "")
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|&cap| cap > 0)
        .unwrap_or(DEFAULT_TILE_SIZE_CAP)
}

//! JVM flag sets shared by the Java-based game variants.

use std::path::Path;

/// Heaps at or above this size get the large young-generation profile.
const LARGE_HEAP_MB: u32 = 12 * 1024;
const MIN_HEAP_MB: u32 = 256;

pub fn heap_flags(memory_mb: u32) -> Vec<String> {
    let mb = memory_mb.max(MIN_HEAP_MB);
    vec![format!("-Xms{mb}M"), format!("-Xmx{mb}M")]
}

/// G1 tuning ("Aikar's flags"). These values are what server operators expect to see; do not
/// reorder or reword them.
pub fn g1_flags(memory_mb: u32) -> Vec<String> {
    let large = memory_mb >= LARGE_HEAP_MB;
    let (new_size, max_new_size, region_size, reserve, ihop) = if large {
        (40, 50, "16M", 15, 20)
    } else {
        (30, 40, "8M", 20, 15)
    };

    vec![
        "-XX:+UseG1GC".to_string(),
        "-XX:+ParallelRefProcEnabled".to_string(),
        "-XX:MaxGCPauseMillis=200".to_string(),
        "-XX:+UnlockExperimentalVMOptions".to_string(),
        "-XX:+DisableExplicitGC".to_string(),
        "-XX:+AlwaysPreTouch".to_string(),
        format!("-XX:G1NewSizePercent={new_size}"),
        format!("-XX:G1MaxNewSizePercent={max_new_size}"),
        format!("-XX:G1HeapRegionSize={region_size}"),
        format!("-XX:G1ReservePercent={reserve}"),
        "-XX:G1HeapWastePercent=5".to_string(),
        "-XX:G1MixedGCCountTarget=4".to_string(),
        format!("-XX:InitiatingHeapOccupancyPercent={ihop}"),
        "-XX:G1MixedGCLiveThresholdPercent=90".to_string(),
        "-XX:G1RSetUpdatingPauseTimePercent=5".to_string(),
        "-XX:SurvivorRatio=32".to_string(),
        "-XX:+PerfDisableSharedMem".to_string(),
        "-XX:MaxTenuringThreshold=1".to_string(),
        "-Dusing.aikars.flags=https://mcflags.emc.gs".to_string(),
        "-Daikars.new.flags=true".to_string(),
    ]
}

/// `-XX:AOTCache=<file>` when the cache file exists in `cwd`.
pub fn aot_cache_flag(cwd: &Path, file_name: &str) -> Option<String> {
    cwd.join(file_name)
        .is_file()
        .then(|| format!("-XX:AOTCache={file_name}"))
}

/// Heap, GC tuning, optional AOT cache, in that order.
pub fn server_flags(memory_mb: u32, cwd: &Path, aot_cache: Option<&str>) -> Vec<String> {
    let mut args = heap_flags(memory_mb);
    args.extend(g1_flags(memory_mb));
    if let Some(flag) = aot_cache.and_then(|name| aot_cache_flag(cwd, name)) {
        args.push(flag);
    }
    args
}

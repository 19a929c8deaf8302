//! Profiling and configuration integration tests

use arena_runtime::{ArcRuntime, RuntimeConfig, TgcRuntime};
use serde_json::Value;
use std::path::Path;

fn profiled_config(dir: &Path, frequency: u64) -> RuntimeConfig {
    let text = format!(
        r#"
[stack]
segment_bits = 3

[heap]
nursery_bits = 7

[profiling]
enabled = true
frequency = {}
stack_log = "{}"
heap_log = "{}"
"#,
        frequency,
        dir.join("stack.json").display(),
        dir.join("heap.json").display()
    );
    let path = dir.join("arena.toml");
    std::fs::write(&path, text).unwrap();
    RuntimeConfig::from_file(&path).unwrap()
}

fn read_log(path: &Path) -> Vec<Value> {
    let text = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[test]
fn test_tgc_profile_logs_parse() {
    let dir = tempfile::tempdir().unwrap();
    let config = profiled_config(dir.path(), 1);
    let mut rt = TgcRuntime::new(&config).unwrap();

    let mut sp = rt.base();
    for _ in 0..10 {
        sp = rt.push(sp).unwrap();
    }
    // 128 byte semispaces: the ninth allocation triggers a collection
    for _ in 0..9 {
        rt.allocate(16, sp).unwrap();
    }
    rt.shutdown().unwrap();

    let stack = read_log(&config.profiling.stack_log);
    assert_eq!(stack.len(), 11);
    assert_eq!(stack.last().unwrap()["stack_offset"], 10);
    assert_eq!(stack.last().unwrap()["stack_count"], 10);

    let heap = read_log(&config.profiling.heap_log);
    let kinds: Vec<&str> = heap.iter().map(|r| r["event"].as_str().unwrap()).collect();
    assert_eq!(kinds.iter().filter(|k| **k == "type_alloc").count(), 9);
    assert_eq!(kinds.iter().filter(|k| **k == "tgc").count(), 1);

    let last = heap.last().unwrap();
    assert_eq!(last["total_allocated_objects"], 9);
    assert_eq!(last["total_allocated_bytes"], 144);
    assert_eq!(last["currently_allocated_bytes"], 16);
    assert_eq!(last["stack_offset"], 10);
    assert!(last["total_pause_ticks"].as_u64().unwrap() >= last["total_alloc_pause_ticks"].as_u64().unwrap());
}

#[test]
fn test_arc_profile_respects_frequency() {
    let dir = tempfile::tempdir().unwrap();
    let config = profiled_config(dir.path(), 4);
    let mut rt = ArcRuntime::new(&config).unwrap();
    let sp = rt.base();

    // alloc, access, drop and free: 4 heap events per object
    for _ in 0..8 {
        let obj = rt.allocate(24, sp).unwrap();
        rt.access(obj, sp).unwrap();
        rt.release(obj, sp).unwrap();
    }
    rt.shutdown().unwrap();

    let heap = read_log(&config.profiling.heap_log);
    assert_eq!(heap.len(), 8);
    for record in &heap {
        assert_eq!(record["stack_offset"], 0);
    }
    let last = heap.last().unwrap();
    assert_eq!(last["event"], "type_free");
    assert_eq!(last["currently_allocated_bytes"], 0);
    assert_eq!(last["total_allocated_bytes"], 8 * 24);
}

#[test]
fn test_config_round_trip_through_toml() {
    let dir = tempfile::tempdir().unwrap();
    let config = profiled_config(dir.path(), 25);

    let text = config.to_toml().unwrap();
    let parsed = RuntimeConfig::from_str(&text).unwrap();
    assert_eq!(parsed, config);
    assert_eq!(parsed.stack.segment_len(), 8);
    assert_eq!(parsed.heap.semispace_len(), 128);
}

#[test]
fn test_disabled_profiling_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = profiled_config(dir.path(), 1);
    config.profiling.enabled = false;

    let mut rt = TgcRuntime::new(&config).unwrap();
    let sp = rt.push(rt.base()).unwrap();
    rt.allocate(32, sp).unwrap();
    rt.shutdown().unwrap();

    assert!(!config.profiling.stack_log.exists());
    assert!(!config.profiling.heap_log.exists());
}

#![cfg(feature = "sqlite-persistence")]

//! Two wired instances over the same SQLite files behave like two processes
//! sharing one store.

use std::collections::HashMap;
use std::path::PathBuf;

use holdfast_counters::CounterRecord;
use holdfast_pause_control::{JobPayload, LiveQueue};
use holdfast_runtime::{Holdfast, HoldfastConfig, WorkerBinding};
use serde_json::json;

struct TempFiles(Vec<PathBuf>);

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn sqlite_config() -> (HoldfastConfig, TempFiles) {
    let dir = std::env::temp_dir();
    let kv = dir.join(format!("holdfast-runtime-kv-{}.db", uuid::Uuid::new_v4()));
    let counters = dir.join(format!("holdfast-runtime-counters-{}.db", uuid::Uuid::new_v4()));
    let envs: HashMap<String, String> = [
        ("HOLDFAST_STORE_BACKEND", "sqlite".to_string()),
        ("HOLDFAST_SQLITE_DB", kv.display().to_string()),
        ("HOLDFAST_COUNTERS_DB", counters.display().to_string()),
        ("HOLDFAST_BUFFERED_ATTRIBUTES", "ProjectStatistics.storage_size".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    let config = HoldfastConfig::from_env_map(&envs).expect("config");
    (config, TempFiles(vec![kv, counters]))
}

fn bindings() -> Vec<WorkerBinding> {
    vec!["search_indexing=Search::IndexWorker".parse().expect("binding")]
}

#[test]
fn pause_set_by_one_process_is_seen_by_another() {
    let (config, _files) = sqlite_config();
    let operator = Holdfast::build(&config, &bindings()).expect("operator");
    let worker_host = Holdfast::build(&config, &bindings()).expect("worker host");

    operator.toggle.enable("search_indexing").expect("pause");
    for i in 0..3 {
        let outcome = worker_host
            .dispatcher
            .enqueue(&JobPayload::new("Search::IndexWorker", vec![json!(i)]))
            .expect("enqueue");
        assert!(outcome.is_paused());
    }
    assert_eq!(operator.queue.queue_size("Search::IndexWorker").expect("size"), 3);

    operator.toggle.disable("search_indexing").expect("unpause");
    let report = operator.tick().expect("tick");
    assert_eq!(report.resume.resumed.get("Search::IndexWorker"), Some(&0));

    let jobs = worker_host.live.pop("Search::IndexWorker", 10).expect("pop");
    let args: Vec<_> = jobs.iter().map(|job| job.args[0].clone()).collect();
    assert_eq!(args, vec![json!(0), json!(1), json!(2)]);
}

#[test]
fn stale_sweep_flushes_counters_incremented_elsewhere() {
    let (config, _files) = sqlite_config();
    let web = Holdfast::build(&config, &[]).expect("web");
    let sweeper = Holdfast::build(&config, &[]).expect("sweeper");
    let record = CounterRecord::new(4, "ProjectStatistics", 40);

    let counter = web.counters.counter_for(&record, "storage_size").expect("counter");
    counter.increment(100).expect("increment");
    counter.increment(-30).expect("increment");

    let report = sweeper.flush_stale.execute(&[record]).expect("sweep");
    assert_eq!(report.flushed, 1);
    assert_eq!(web.counters.durable_value(counter.target()).expect("durable"), 70);
    assert_eq!(counter.get().expect("get"), 0);
}

//! E2E tests for asynchronous execution on per-path worker pools.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{service_with_factory, sink, test_config, LogEntry, RecordingLogger, DEFAULT_TIMEOUT};
use extscript::{
    ExecutionParameters, ExecutionPath, PoolFactory, ScriptIdentity, TokioWorkerPool, WorkerPool,
    SUCCESS_MESSAGE,
};

/// Factory building tokio pools and keeping a handle to each one.
fn recording_factory() -> (PoolFactory, Arc<Mutex<Vec<Arc<TokioWorkerPool>>>>) {
    let created: Arc<Mutex<Vec<Arc<TokioWorkerPool>>>> = Arc::default();
    let pools = Arc::clone(&created);
    let prefix = test_config().pools.thread_name_prefix;
    let factory: PoolFactory = Arc::new(move |path: &ExecutionPath| {
        let pool = Arc::new(TokioWorkerPool::new(format!("{}-{}", prefix, path), 2)?);
        pools.lock().unwrap().push(Arc::clone(&pool));
        Ok(pool as Arc<dyn WorkerPool>)
    });
    (factory, created)
}

#[test]
fn test_async_script_reports_through_logger() {
    let (factory, _) = recording_factory();
    let service = service_with_factory(factory);
    let logger = RecordingLogger::new();

    service.execute_script_async(
        &ExecutionPath::for_organization(1),
        ScriptIdentity::new("notify", "notify-hash"),
        Box::new(|| Ok("extensionLogger.logError(\"boom\")".to_string())),
        None,
        sink(&logger),
    );

    let entries = logger.wait_for_outcomes(1, DEFAULT_TIMEOUT);
    assert_eq!(
        entries,
        vec![
            LogEntry::Error("boom".to_string()),
            LogEntry::Success(SUCCESS_MESSAGE.to_string()),
        ]
    );
    assert_eq!(service.active_pools(), 1);
}

#[test]
fn test_async_failure_stays_in_logger() {
    let (factory, _) = recording_factory();
    let service = service_with_factory(factory);
    let logger = RecordingLogger::new();

    service.execute_script_async(
        &ExecutionPath::from("org:1"),
        ScriptIdentity::new("broken", "broken-hash"),
        Box::new(|| Ok("return (".to_string())),
        None,
        sink(&logger),
    );

    let entries = logger.wait_for_outcomes(1, DEFAULT_TIMEOUT);
    assert_eq!(entries.len(), 1);
    assert!(matches!(&entries[0], LogEntry::Error(m) if m.starts_with("Was not able to compile script: ")));
}

#[test]
fn test_paths_get_their_own_pools() {
    let (factory, pools) = recording_factory();
    let service = service_with_factory(factory);
    let logger = RecordingLogger::new();

    for path in ["org:1", "org:1-event:7", "org:2"] {
        service.execute_script_async(
            &ExecutionPath::from(path),
            ScriptIdentity::new("noop", "noop-hash"),
            Box::new(|| Ok("return nil".to_string())),
            None,
            sink(&logger),
        );
    }

    logger.wait_for_outcomes(3, DEFAULT_TIMEOUT);
    assert_eq!(logger.successes(), 3);
    assert_eq!(pools.lock().unwrap().len(), 3);
    assert_eq!(service.active_pools(), 3);
    assert_eq!(service.compiler().compiles(), 1);
}

#[test]
fn test_evicted_pool_is_replaced() {
    let (factory, pools) = recording_factory();
    let service = service_with_factory(factory);
    let logger = RecordingLogger::new();
    let path = ExecutionPath::for_event(3, 9);

    let submit = |value: i64| {
        service.execute_script_async(
            &path,
            ScriptIdentity::new("count", "count-hash"),
            Box::new(|| Ok("extensionLogger.logInfo(tostring(n))".to_string())),
            Some(ExecutionParameters::new().with("n", value)),
            sink(&logger),
        );
    };

    submit(1);
    logger.wait_for_outcomes(1, DEFAULT_TIMEOUT);

    service.evict_pool(&path);
    let old = Arc::clone(&pools.lock().unwrap()[0]);
    assert!(old.is_shutdown());
    assert!(old.execute(Box::new(|| {})).is_err());
    assert_eq!(service.active_pools(), 0);

    submit(2);
    let entries = logger.wait_for_outcomes(2, DEFAULT_TIMEOUT);

    assert_eq!(pools.lock().unwrap().len(), 2);
    assert!(!pools.lock().unwrap()[1].is_shutdown());
    assert!(entries.contains(&LogEntry::Info("2".to_string())));
    assert_eq!(logger.successes(), 2);
}

#[test]
fn test_shutdown_stops_pools() {
    let (factory, pools) = recording_factory();
    let service = service_with_factory(factory);
    let logger = RecordingLogger::new();

    service.execute_script_async(
        &ExecutionPath::from("org:5"),
        ScriptIdentity::new("noop", "noop-hash"),
        Box::new(|| Ok("return true".to_string())),
        None,
        sink(&logger),
    );
    logger.wait_for_outcomes(1, DEFAULT_TIMEOUT);

    service.shutdown();

    assert!(pools.lock().unwrap().iter().all(|p| p.is_shutdown()));
    assert_eq!(service.active_pools(), 0);
}

#[test]
fn test_idle_pool_expires() {
    let (factory, pools) = recording_factory();
    let mut config = test_config();
    config.pools.idle_ttl_secs = 1;
    let service = extscript::ScriptingService::new(
        common::CountingCompiler::default(),
        Arc::new(common::FakeHttp::default()),
        factory,
        &config,
    );
    let logger = RecordingLogger::new();

    service.execute_script_async(
        &ExecutionPath::from("org:8"),
        ScriptIdentity::new("noop", "noop-hash"),
        Box::new(|| Ok("return 1".to_string())),
        None,
        sink(&logger),
    );
    logger.wait_for_outcomes(1, DEFAULT_TIMEOUT);

    std::thread::sleep(Duration::from_millis(1500));
    service.run_maintenance();

    assert!(pools.lock().unwrap()[0].is_shutdown());
    assert_eq!(service.active_pools(), 0);
}

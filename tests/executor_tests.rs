
use std::collections::HashSet;
use std::time::Duration;

use relay_exec::config::{SandboxConfig, DEFAULT_RAM_BYTES};
use relay_exec::sandbox::{ResourceLimits, SandboxExecutor};
use test_harness::{file_count, sandbox_config, FakeBehavior, FakeSandbox};

const LIMITS: ResourceLimits = ResourceLimits {
    cpu_count: 1,
    ram_bytes: DEFAULT_RAM_BYTES,
};

fn test_executor(
    behavior: FakeBehavior,
) -> (SandboxExecutor, std::sync::Arc<FakeSandbox>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = FakeSandbox::new(behavior);
    let executor = SandboxExecutor::new(sandbox.clone(), sandbox_config(dir.path()));
    (executor, sandbox, dir)
}

#[tokio::test]
async fn test_execute_simple_program() {
    let (executor, sandbox, dir) = test_executor(FakeBehavior::default());

    let result = executor.execute("print(\"hello\")", LIMITS).await;

    assert!(result.is_success());
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output, "hello\n");
    assert!(result.error.is_none());
    assert_eq!(sandbox.leaked_units(), 0);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn test_execute_empty_output() {
    let (executor, _sandbox, _dir) = test_executor(FakeBehavior::default());

    let result = executor.execute("x = 1", LIMITS).await;

    assert!(result.is_success());
    assert!(result.output.is_empty());
}

#[tokio::test]
async fn test_execute_large_output() {
    let (executor, _sandbox, _dir) = test_executor(FakeBehavior::default());
    let code: String = (1..=1000).map(|i| format!("print(\"{}\")\n", i)).collect();

    let result = executor.execute(&code, LIMITS).await;

    assert!(result.is_success());
    assert_eq!(result.output.lines().count(), 1000);
    assert_eq!(result.output.lines().last(), Some("1000"));
}

#[tokio::test]
async fn test_unit_spec_mounts_artifact_read_only() {
    let (executor, sandbox, dir) = test_executor(FakeBehavior::default());

    executor
        .execute(
            "print(1)",
            ResourceLimits {
                cpu_count: 2,
                ram_bytes: 1024,
            },
        )
        .await;

    let spec = &sandbox.created()[0];
    assert_eq!(spec.image, "python:alpine");
    assert_eq!(spec.command, vec!["python3", "/app/code.py"]);
    assert_eq!(spec.cpu_limit, 2.0);
    assert_eq!(spec.memory_limit, 1024);
    assert!(spec.network_disabled);

    let mount = &spec.mounts[0];
    assert!(mount.read_only);
    assert_eq!(mount.target, "/app/code.py");
    assert!(mount.source.starts_with(dir.path()));
    assert_eq!(mount.source.extension().and_then(|e| e.to_str()), Some("py"));
}

#[tokio::test]
async fn test_concurrent_executions_use_distinct_artifacts() {
    let (executor, sandbox, dir) = test_executor(FakeBehavior {
        run_for: Some(Duration::from_millis(20)),
        ..Default::default()
    });

    let mut handles = Vec::new();
    for i in 0..8 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor.execute(&format!("print(\"job-{}\")", i), LIMITS).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        assert_eq!(result.output, format!("job-{}\n", i));
    }

    let sources: HashSet<_> = sandbox
        .created()
        .iter()
        .map(|spec| spec.mounts[0].source.clone())
        .collect();
    assert_eq!(sources.len(), 8);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn test_execute_non_zero_exit() {
    let (executor, sandbox, dir) = test_executor(FakeBehavior {
        exit_code: 3,
        ..Default::default()
    });

    let result = executor.execute("print(\"boom\")", LIMITS).await;

    assert!(!result.is_success());
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.output, "boom\n");
    let error = result.error.unwrap();
    assert!(error.starts_with("Process exited with code 3"));
    assert!(error.contains("boom"));
    assert_eq!(sandbox.leaked_units(), 0);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn test_create_failure_cleans_up_artifact() {
    let (executor, sandbox, dir) = test_executor(FakeBehavior {
        fail_create: true,
        ..Default::default()
    });

    let result = executor.execute("print(1)", LIMITS).await;

    assert!(!result.is_success());
    assert!(result.exit_code.is_none());
    assert!(result.error.unwrap().contains("No such image"));
    assert_eq!(sandbox.removed_count(), 0);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn test_start_failure_removes_unit() {
    let (executor, sandbox, dir) = test_executor(FakeBehavior {
        fail_start: true,
        ..Default::default()
    });

    let result = executor.execute("print(1)", LIMITS).await;

    assert!(result.error.unwrap().contains("cannot start container"));
    assert_eq!(sandbox.create_count(), 1);
    assert_eq!(sandbox.leaked_units(), 0);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn test_log_stream_failure_removes_unit() {
    let (executor, sandbox, dir) = test_executor(FakeBehavior {
        log_error: true,
        ..Default::default()
    });

    let result = executor.execute("print(1)", LIMITS).await;

    assert!(result.error.unwrap().contains("log stream broke"));
    assert_eq!(sandbox.leaked_units(), 0);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn test_remove_failure_is_an_error() {
    let (executor, _sandbox, dir) = test_executor(FakeBehavior {
        fail_remove: true,
        ..Default::default()
    });

    let result = executor.execute("print(1)", LIMITS).await;

    assert!(result.error.unwrap().contains("removal in progress"));
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn test_execution_timeout_tears_down_unit() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = FakeSandbox::new(FakeBehavior {
        hang: true,
        ..Default::default()
    });
    let config = SandboxConfig {
        execution_timeout: Some(Duration::from_millis(100)),
        ..sandbox_config(dir.path())
    };
    let executor = SandboxExecutor::new(sandbox.clone(), config);

    let started = std::time::Instant::now();
    let result = executor.execute("while True: pass", LIMITS).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.error.unwrap().contains("timed out"));
    assert_eq!(sandbox.leaked_units(), 0);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn test_unwritable_work_dir_fails_before_create() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = FakeSandbox::healthy();
    let executor = SandboxExecutor::new(
        sandbox.clone(),
        sandbox_config(&dir.path().join("missing").join("nested")),
    );

    let result = executor.execute("print(1)", LIMITS).await;

    assert!(result.error.unwrap().contains("Failed to write code artifact"));
    assert_eq!(sandbox.create_count(), 0);
}

#[tokio::test]
#[ignore = "requires a local docker daemon and the python:alpine image"]
async fn test_docker_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SandboxExecutor::docker(sandbox_config(dir.path()));

    let result = executor.execute("print('HELLO-42')", LIMITS).await;

    assert!(result.is_success(), "error: {:?}", result.error);
    assert_eq!(result.output.trim(), "HELLO-42");
    assert_eq!(file_count(dir.path()), 0);
}

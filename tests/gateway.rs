// [[file:../fleet.note::5c1e8b70][5c1e8b70]]
mod common;

use gosh_fleet::gateway::{push_and_run, GatewayError, RunMode};

use common::*;
// 5c1e8b70 ends here

// [[file:../fleet.note::e49a7d15][e49a7d15]]
#[tokio::test]
async fn test_push_and_run() {
    let shell = FakeShell::failing_setup(&["ab-hw-000"]);
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("probe.sh");
    std::fs::write(&script, "#!/bin/sh\n").unwrap();

    let args = vec!["a".to_string(), "b c".to_string()];
    let status = push_and_run(&shell, "ab-hm", &script, &args, Some("hadoop"), RunMode::Wait)
        .await
        .unwrap();
    assert_eq!(status, 0);
    assert_eq!(
        shell.pushed.lock().unwrap().clone(),
        vec![("ab-hm".to_string(), "/tmp/probe.sh".to_string())]
    );
    assert_eq!(
        shell.commands_on("ab-hm"),
        vec!["chmod +x /tmp/probe.sh && /tmp/probe.sh a 'b c'"]
    );

    // the exit status of the script is handed back, not turned into an error
    let args = vec!["setup".to_string()];
    let status = push_and_run(&shell, "ab-hw-000", &script, &args, None, RunMode::Wait)
        .await
        .unwrap();
    assert_eq!(status, 1);
}

#[tokio::test]
async fn test_push_failure_names_machine() {
    let shell = FakeShell::default();
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.sh");
    let e = push_and_run(&shell, "ab-hw-003", &missing, &[], None, RunMode::Detach)
        .await
        .unwrap_err();
    assert!(matches!(e, GatewayError::Push { .. }), "{e}");
    assert_eq!(e.machine(), "ab-hw-003");
    assert!(e.to_string().contains("missing.sh"));
    // nothing ran
    assert!(shell.commands.lock().unwrap().is_empty());
}
// e49a7d15 ends here

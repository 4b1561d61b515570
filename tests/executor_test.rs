//! Integration tests for executors and executor report parsing.

use std::collections::BTreeMap;

use claimq::executor::command::parse_report;
use claimq::executor::{ExecutionRequest, RawOutcome, TaskExecutor, from_fn};
use claimq::model::{ClaimedUnit, PoolId, TaskKey};
use uuid::Uuid;

fn request(key: &str) -> ExecutionRequest {
    ExecutionRequest {
        execution_id: Uuid::new_v4(),
        key: TaskKey::new(key),
        params: BTreeMap::from([("email".to_string(), format!("{key}@example.com"))]),
        unit: ClaimedUnit {
            pool: PoolId::new("2"),
            row: 0,
            payload: BTreeMap::from([("name".to_string(), "unit-0".to_string())]),
        },
        attempt: 1,
    }
}

#[test]
fn parse_report_accepts_json_object() {
    let report = parse_report(
        r#"{"outcome": "success", "result": {"confirmation": "C-1", "pages": 3, "note": null}}"#,
    );
    assert_eq!(report.outcome, "success");
    assert_eq!(report.result["confirmation"], "C-1");
    assert_eq!(report.result["pages"], "3");
    assert_eq!(report.result["note"], "");
}

#[test]
fn parse_report_falls_back_to_last_line() {
    assert_eq!(
        parse_report("navigating\nsubmitting form\nblocked\n\n").outcome,
        "blocked"
    );
    assert_eq!(parse_report("  success  ").outcome, "success");
    assert_eq!(parse_report("progress...\n"), RawOutcome::new("progress..."));
    // JSON without an outcome is just a line of text.
    assert_eq!(parse_report(r#"{"status": 1}"#).outcome, r#"{"status": 1}"#);
}

#[test]
fn parse_report_on_empty_output() {
    assert_eq!(parse_report("").outcome, "executor reported no outcome");
    assert_eq!(parse_report(" \n\n").outcome, "executor reported no outcome");
}

#[test]
fn request_serializes_for_external_programs() {
    let value = serde_json::to_value(request("acct-1")).unwrap();
    assert_eq!(value["key"], "acct-1");
    assert_eq!(value["params"]["email"], "acct-1@example.com");
    assert_eq!(value["unit"]["pool"], "2");
    assert_eq!(value["unit"]["payload"]["name"], "unit-0");
    assert_eq!(value["attempt"], 1);
}

#[tokio::test]
async fn closure_executor_runs() {
    let executor = from_fn(|req: ExecutionRequest| async move {
        Ok(RawOutcome::success().with_result("seen", req.key.to_string()))
    });
    let report = executor.execute(request("k")).await.unwrap();
    assert_eq!(report.outcome, "success");
    assert_eq!(report.result["seen"], "k");
}

#[cfg(unix)]
mod command {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use claimq::error::Error;
    use claimq::executor::{CommandExecutor, TaskExecutor};

    use super::request;

    /// Write `body` as a script and run it through `/bin/sh`.
    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("exec.sh");
        std::fs::write(&path, format!("{body}\n")).unwrap();
        path
    }

    fn sh(script: &Path, extra: &[&str]) -> CommandExecutor {
        let mut args = vec![script.display().to_string()];
        args.extend(extra.iter().map(|a| a.to_string()));
        CommandExecutor::new("/bin/sh").args(args)
    }

    #[tokio::test]
    async fn command_sees_environment_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(
            dir.path(),
            r#"input=$(cat)
case "$input" in
  *'"email":"acct-7@example.com"'*) found=yes ;;
  *) found=no ;;
esac
printf '{"outcome":"success","result":{"key":"%s","pool":"%s","attempt":"%s","stdin":"%s"}}\n' \
  "$CLAIMQ_TASK_KEY" "$CLAIMQ_POOL" "$CLAIMQ_ATTEMPT" "$found""#,
        );

        let report = sh(&exec, &[])
            .execute(request("acct-7"))
            .await
            .unwrap();
        assert_eq!(report.outcome, "success");
        assert_eq!(report.result["key"], "acct-7");
        assert_eq!(report.result["pool"], "2");
        assert_eq!(report.result["attempt"], "1");
        assert_eq!(report.result["stdin"], "yes");
    }

    #[tokio::test]
    async fn command_plain_word_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "echo 'loading page'\necho invalid-credentials");

        let report = sh(&exec, &[])
            .execute(request("a"))
            .await
            .unwrap();
        assert_eq!(report.outcome, "invalid-credentials");
    }

    #[tokio::test]
    async fn command_args_are_passed() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), r#"echo "$1""#);

        let report = sh(&exec, &["blocked"])
            .execute(request("a"))
            .await
            .unwrap();
        assert_eq!(report.outcome, "blocked");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "echo 'selector not found' >&2\nexit 3");

        let err = sh(&exec, &[])
            .execute(request("a"))
            .await
            .unwrap_err();
        match err {
            Error::Executor(msg) => {
                assert!(msg.contains("status 3"), "{msg}");
                assert!(msg.contains("selector not found"), "{msg}");
            }
            other => panic!("expected Executor error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "sleep 5\necho success");

        let started = std::time::Instant::now();
        let err = sh(&exec, &[])
            .timeout(Some(Duration::from_millis(200)))
            .execute(request("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Executor(ref msg) if msg.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn timeout_covers_an_unread_large_request() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "sleep 3\necho success");
        let mut big = request("a");
        big.params.insert("blob".to_string(), "x".repeat(300 * 1024));

        let started = std::time::Instant::now();
        let err = sh(&exec, &[])
            .timeout(Some(Duration::from_millis(200)))
            .execute(big)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Executor(ref msg) if msg.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn large_request_reaches_a_reading_program() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(dir.path(), "bytes=$(wc -c)\necho \"read-$bytes\" | tr -d ' '");
        let mut big = request("a");
        big.params.insert("blob".to_string(), "x".repeat(300 * 1024));
        let expected = serde_json::to_vec(&big).unwrap().len();

        let report = sh(&exec, &[]).execute(big).await.unwrap();
        assert_eq!(report.outcome, format!("read-{expected}"));
    }

    #[tokio::test]
    async fn missing_program_cannot_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandExecutor::new(dir.path().join("nope.sh"))
            .execute(request("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Executor(ref msg) if msg.contains("cannot spawn")));
    }
}

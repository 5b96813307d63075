//! Hooks module tests

use pretty_assertions::assert_eq;

use super::*;

#[tokio::test]
async fn test_command_reports_stdout_lines() {
    let hook = CommandReloadHook::new("printf 'index.tea\\n\\n  layout.tea \\n'");
    let report = hook.reload(false).await;
    assert_eq!(
        report,
        ReloadReport {
            reloaded: vec!["index.tea".to_string(), "layout.tea".to_string()],
            errors: vec![],
        }
    );
}

#[tokio::test]
async fn test_command_sees_reload_all_flag() {
    let hook = CommandReloadHook::new("echo \"$TEACLUSTER_RELOAD_ALL\"");
    assert_eq!(hook.reload(true).await.reloaded, vec!["true".to_string()]);
    assert_eq!(hook.reload(false).await.reloaded, vec!["false".to_string()]);
}

#[tokio::test]
async fn test_failing_command_reports_stderr() {
    let hook = CommandReloadHook::new("echo 'index.tea:3: unclosed tag' >&2; exit 1");
    let report = hook.reload(false).await;
    assert!(!report.is_success());
    assert!(report.reloaded.is_empty());
    assert_eq!(report.errors, vec!["index.tea:3: unclosed tag".to_string()]);
}

#[tokio::test]
async fn test_silent_failure_reports_status() {
    let hook = CommandReloadHook::new("exit 3");
    let report = hook.reload(false).await;
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("exit 3"));
}

use crate::integration::infrastructure::*;
use anyhow::Result;
use sigwright::{HarnessError, ModuleState, ModuleSubject, Severity, Step, StopReason, TestCase};
use std::time::Duration;
use tempfile::TempDir;

const LOADING: &str = "challenge_201: Loading";
const UNLOADING: &str = "challenge_201: Unloading";

fn kernel() -> FakeModuleControl {
    FakeModuleControl::new()
        .logs_on_init(Severity::Notice, LOADING)
        .logs_on_exit(Severity::Notice, UNLOADING)
}

fn module_case(
    control: &FakeModuleControl,
    dir: &TempDir,
) -> Result<TestCase<ModuleSubject<FakeModuleControl>>> {
    let artifact = fake_artifact(dir.path(), "challenge_201.ko")?;
    let subject = ModuleSubject::new(control.clone(), artifact).with_settle_delay(Duration::ZERO);
    Ok(TestCase::new(subject, fast_config()))
}

#[tokio::test]
async fn test_double_load_rejected_before_privileged_command() -> Result<()> {
    let dir = TempDir::new()?;
    let control = kernel();
    let mut case = module_case(&control, &dir)?;

    case.load().await?;
    let issued = control.privileged_calls();

    let second = case.load().await;
    assert!(matches!(second, Err(HarnessError::DoubleLoad(ref name)) if name == "challenge_201"));
    assert_eq!(control.privileged_calls(), issued);

    case.finish().await?;
    assert!(!control.is_registered("challenge_201"));
    Ok(())
}

#[tokio::test]
async fn test_unload_when_not_loaded_is_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    let control = kernel();
    let mut case = module_case(&control, &dir)?;

    assert!(matches!(case.unload().await, Err(HarnessError::NotLoaded(_))));
    assert_eq!(control.privileged_calls(), 0);
    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_log_is_cleared_before_load() -> Result<()> {
    let dir = TempDir::new()?;
    let control = kernel();
    let mut case = module_case(&control, &dir)?;

    case.load().await?;
    let calls = control.calls();
    let clear = calls.iter().position(|c| *c == Call::ClearLog);
    let load = calls.iter().position(|c| matches!(c, Call::Load(_)));
    assert!(clear.is_some() && clear < load, "calls: {calls:?}");

    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_load_messages_found() -> Result<()> {
    let dir = TempDir::new()?;
    let control = kernel();
    let mut case = module_case(&control, &dir)?;

    case.check_for_load_msgs([LOADING], None).await?;
    case.check_log([LOADING], Some(Severity::Notice)).await?;

    case.finish().await?;
    assert!(control.calls().contains(&Call::ReadLog(Some(Severity::Notice))));
    Ok(())
}

#[tokio::test]
async fn test_load_message_at_wrong_level() -> Result<()> {
    let dir = TempDir::new()?;
    let control = kernel();
    let mut case = module_case(&control, &dir)?;

    case.check_for_load_msgs([LOADING], Some(Severity::Info)).await?;

    let failures = expect_report(case.finish().await);
    assert_failure_count(&failures, 1);
    assert_failure_mentions(&failures, "Unable to locate challenge_201: Loading in the kernel log at level info");
    Ok(())
}

#[tokio::test]
async fn test_unload_messages_found() -> Result<()> {
    let dir = TempDir::new()?;
    let control = kernel();
    let mut case = module_case(&control, &dir)?;

    case.check_for_unload_msgs([LOADING, UNLOADING], Some(Severity::Notice))
        .await?;
    assert!(!case.subject().is_loaded());

    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_empty_log_query_is_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    let control = kernel();
    let mut case = module_case(&control, &dir)?;

    let result = case.check_for_load_msgs(Vec::<String>::new(), None).await;
    assert!(result.is_err());
    assert_eq!(control.privileged_calls(), 0);
    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_missing_privilege_is_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    let control = kernel().without_privilege();
    let mut case = module_case(&control, &dir)?;

    assert!(matches!(
        case.start().await,
        Err(HarnessError::PrivilegeUnavailable(_))
    ));
    assert!(matches!(
        case.load().await,
        Err(HarnessError::PrivilegeUnavailable(_))
    ));
    assert_eq!(control.privileged_calls(), 0);
    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_missing_artifact_is_fatal() -> Result<()> {
    let control = kernel();
    let subject = ModuleSubject::new(control.clone(), "/nonexistent/challenge_201.ko");
    let mut case = TestCase::new(subject, fast_config());

    assert!(matches!(
        case.load().await,
        Err(HarnessError::ArtifactMissing(_))
    ));
    assert!(!control.calls().iter().any(|c| matches!(c, Call::Load(_))));
    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_scripted_load_and_unload() -> Result<()> {
    let dir = TempDir::new()?;
    let control = kernel();
    let mut case = module_case(&control, &dir)?;

    case.check_signals(vec![Step::load(), Step::unload()])?;
    let report = case.run().await?;
    assert!(report.stop.is_completed(), "stopped at: {}", report.stop);
    assert_eq!(report.final_state, ModuleState::Unloaded);

    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_insmod_tolerated_then_caught() -> Result<()> {
    let dir = TempDir::new()?;
    let control = kernel().failing_insmod();
    let mut case = module_case(&control, &dir)?;

    case.check_signals(vec![Step::load(), Step::unload()])?;
    let report = case.run().await?;
    assert_eq!(report.stop, StopReason::MissingTransition { index: 0 });
    assert!(report.outcome.stderr_lossy().contains("could not insert module"));

    let failures = expect_report(case.finish().await);
    assert_failure_count(&failures, 1);
    assert_failure_mentions(&failures, "challenge_201 did not load");
    Ok(())
}

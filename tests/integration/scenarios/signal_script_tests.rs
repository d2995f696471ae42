use crate::integration::infrastructure::*;
use anyhow::Result;
use sigwright::signals::max_signal;
use sigwright::{
    Action, HarnessError, ProcessState, ProcessSubject, SignalNumber, Step, StopReason, Subject, TestCase,
    Termination,
};
use std::time::Duration;

#[tokio::test]
async fn test_ignored_quit_then_kill() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let config = fixtures.ignoring("quit_trap.sh", &[libc::SIGQUIT])?;
    let mut case = TestCase::new(ProcessSubject::new(config), fast_config());

    case.check_signals(vec![
        Step::survives(SignalNumber::QUIT),
        Step::exits(SignalNumber::KILL),
    ])?
    .expect_stdout(["Ignoring signal: 3"])
    .verify_stderr_empty()
    .expect_exit(Termination::Signaled(libc::SIGKILL));

    let report = case.run().await?;
    assert!(report.stop.is_completed());
    assert_eq!(report.final_state, ProcessState::Exited);
    assert_eq!(report.outcome.termination_signal(), Some(libc::SIGKILL));

    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_continue_kill() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let mut case = TestCase::new(ProcessSubject::new(fixtures.idle("pausable.sh")?), fast_config());

    case.check_signals(vec![
        Step::survives(SignalNumber::STOP),
        Step::survives(SignalNumber::CONT),
        Step::exits(SignalNumber::KILL),
    ])?
    .expect_ignore();

    let report = case.run().await?;
    assert!(report.stop.is_completed(), "stopped at: {}", report.stop);
    assert_eq!(report.steps_delivered, 3);
    assert_eq!(report.outcome.termination_signal(), Some(libc::SIGKILL));

    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_subject_alive_between_stop_and_continue() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let mut case = TestCase::new(ProcessSubject::new(fixtures.idle("paused.sh")?), fast_config());
    case.start().await?;

    case.subject_mut().deliver(Action::Signal(SignalNumber::STOP)).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(case.subject_mut().poll().await?, ProcessState::Stopped);
    assert!(case.subject().exit_status().is_none());

    case.subject_mut().deliver(Action::Signal(SignalNumber::CONT)).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(case.subject_mut().poll().await?, ProcessState::Running);

    case.check_signals(vec![Step::exits(SignalNumber::KILL)])?;
    let report = case.run().await?;
    assert!(report.stop.is_completed(), "stopped at: {}", report.stop);
    assert_eq!(report.outcome.termination_signal(), Some(libc::SIGKILL));

    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_finalizer_kills_subject_left_stopped() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let mut case = TestCase::new(ProcessSubject::new(fixtures.idle("frozen.sh")?), fast_config());

    case.check_signals(vec![Step::survives(SignalNumber::STOP)])?
        .expect_exit(Termination::Signaled(libc::SIGKILL));

    let report = case.run().await?;
    assert!(report.stop.is_completed(), "stopped at: {}", report.stop);
    assert_eq!(report.steps_delivered, 1);
    assert_eq!(report.final_state, ProcessState::Exited);
    assert_eq!(report.outcome.termination_signal(), Some(libc::SIGKILL));

    case.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_realtime_signal_default_action() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let mut case = TestCase::new(ProcessSubject::new(fixtures.idle("rt_target.sh")?), fast_config());
    let sigrtmax = SignalNumber::new(max_signal())?;

    case.check_signals(vec![Step::exits(sigrtmax)])?
        .expect_exit(Termination::Signaled(max_signal()));

    case.execute().await?;
    Ok(())
}

#[tokio::test]
async fn test_premature_exit_stops_script() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let mut case = TestCase::new(ProcessSubject::new(fixtures.idle("fragile.sh")?), fast_config());

    case.check_signals(vec![
        Step::survives(SignalNumber::TERM),
        Step::survives(SignalNumber::HUP),
        Step::exits(SignalNumber::KILL),
    ])?;

    let report = case.run().await?;
    assert_eq!(report.stop, StopReason::UnexpectedTransition { index: 0 });
    assert_eq!(report.steps_delivered, 1);

    let failures = expect_report(case.finish().await);
    assert_failure_count(&failures, 1);
    assert_failure_mentions(&failures, "fragile.sh prematurely exited on signal 15");
    Ok(())
}

#[tokio::test]
async fn test_missing_exit_is_finalized() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let config = fixtures.ignoring("stubborn.sh", &[libc::SIGTERM])?;
    let mut case = TestCase::new(ProcessSubject::new(config), fast_config());

    case.check_signals(vec![Step::exits(SignalNumber::TERM)])?;

    let report = case.run().await?;
    assert_eq!(report.stop, StopReason::MissingTransition { index: 0 });
    assert_eq!(report.final_state, ProcessState::Exited);
    assert_eq!(report.outcome.termination_signal(), Some(libc::SIGKILL));

    let failures = expect_report(case.finish().await);
    assert_failure_count(&failures, 1);
    assert_failure_mentions(&failures, "stubborn.sh did not exit on signal 15");
    Ok(())
}

#[tokio::test]
async fn test_exited_subject_rejects_steps() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let mut case = TestCase::new(
        ProcessSubject::new(fixtures.short_lived("quitter.sh", 3)?),
        fast_config(),
    );

    case.check_signals(vec![Step::survives(SignalNumber::INT)])?
        .expect_exit_code(3);

    let report = case.run().await?;
    assert_eq!(report.stop, StopReason::AlreadyTerminal { index: 0 });
    assert_eq!(report.steps_delivered, 0);
    assert_eq!(report.outcome.exit_code(), Some(3));

    let failures = expect_report(case.finish().await);
    assert_failure_count(&failures, 1);
    assert_failure_mentions(&failures, "quitter.sh is not running");
    Ok(())
}

#[tokio::test]
async fn test_empty_script_is_fatal_before_start() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let mut case = TestCase::new(ProcessSubject::new(fixtures.idle("never_run.sh")?), fast_config());

    assert!(matches!(case.check_signals(vec![]), Err(HarnessError::EmptyScript)));
    assert!(matches!(case.execute().await, Err(HarnessError::EmptyScript)));
    assert!(case.subject().pid().is_none());
    Ok(())
}

#[tokio::test]
async fn test_handled_signal_exit_code() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let config = fixtures.exiting_on("graceful.sh", libc::SIGINT, 7)?;
    let mut case = TestCase::new(ProcessSubject::new(config), fast_config());

    case.check_signals(vec![Step::exits(SignalNumber::INT)])?
        .verify_stdout_empty()
        .expect_exit_code(7);

    case.execute().await?;
    Ok(())
}

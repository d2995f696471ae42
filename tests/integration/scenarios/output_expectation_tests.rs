use crate::integration::infrastructure::*;
use anyhow::Result;
use sigwright::{HarnessError, ProcessSubject, SignalNumber, Step, TestCase};

#[tokio::test]
async fn test_printed_substring_passes() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let config = fixtures.ignoring("announcer.sh", &[libc::SIGQUIT])?;
    let mut case = TestCase::new(ProcessSubject::new(config), fast_config());

    case.check_signals(vec![
        Step::survives(SignalNumber::QUIT),
        Step::exits(SignalNumber::KILL),
    ])?
    .expect_stdout(["Ignoring signal: 3"]);

    case.execute().await?;
    Ok(())
}

#[tokio::test]
async fn test_missing_substring_named_once() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let mut case = TestCase::new(ProcessSubject::new(fixtures.idle("silent.sh")?), fast_config());

    case.check_signals(vec![Step::exits(SignalNumber::KILL)])?
        .expect_stdout(["Ignoring signal: 3"]);

    let failures = expect_report(case.execute().await);
    assert_failure_count(&failures, 1);
    assert_eq!(failures.failures[0], "Unable to locate Ignoring signal: 3 in Stdout");
    Ok(())
}

#[tokio::test]
async fn test_independent_mismatches_all_reported() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let config = fixtures.chatty("talker.sh", "hello", "oops")?;
    let mut case = TestCase::new(ProcessSubject::new(config), fast_config());

    case.check_signals(vec![Step::exits(SignalNumber::KILL)])?
        .expect_stdout(["first missing", "second missing"])
        .verify_stderr_empty()
        .expect_exit_code(0);

    let failures = expect_report(case.execute().await);
    assert_failure_count(&failures, 4);
    assert_eq!(failures.failures[0], "Unable to locate first missing in Stdout");
    assert_eq!(failures.failures[1], "Unable to locate second missing in Stdout");
    assert!(failures.failures[2].starts_with("Stderr was not empty: oops"));
    assert_failure_mentions(&failures, "killed by signal 9");
    Ok(())
}

#[tokio::test]
async fn test_empty_stdout_check() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let config = fixtures.chatty("noisy.sh", "unexpected output", "")?;
    let mut case = TestCase::new(ProcessSubject::new(config), fast_config());

    case.check_signals(vec![Step::exits(SignalNumber::KILL)])?
        .verify_stdout_empty();

    let failures = expect_report(case.execute().await);
    assert_failure_count(&failures, 1);
    assert_failure_mentions(&failures, "Stdout was not empty: unexpected output");
    Ok(())
}

#[tokio::test]
async fn test_expect_ignore_discards_declarations() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let config = fixtures.chatty("ignored.sh", "anything", "goes")?;
    let mut case = TestCase::new(ProcessSubject::new(config), fast_config());

    case.check_signals(vec![Step::exits(SignalNumber::KILL)])?
        .verify_stdout_empty()
        .expect_exit_code(0)
        .expect_ignore();

    case.execute().await?;
    assert_eq!(case.outcome().map(|o| o.stdout_lossy()), Some("anything\n".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_second_presentation_is_distinct_error() -> Result<()> {
    let fixtures = SubjectFixtures::new()?;
    let mut case = TestCase::new(ProcessSubject::new(fixtures.idle("twice.sh")?), fast_config());

    case.check_signals(vec![Step::exits(SignalNumber::KILL)])?
        .expect_exit_code(0);

    let first = case.execute().await;
    assert!(matches!(first, Err(HarnessError::Assertions(_))));
    let second = case.present();
    assert!(matches!(second, Err(HarnessError::FailuresAlreadyPresented)));
    assert!(!second.unwrap_err().is_assertion());
    Ok(())
}

//! Per-test-case context: one subject, one failure list, one script.

use crate::config::HarnessConfig;
use crate::delivery::{DeliveryLoop, DeliveryReport};
use crate::error::{HarnessError, Result};
use crate::expect::{Expectations, StreamExpectation};
use crate::failures::FailureList;
use crate::kernel_log::{LogQuery, Severity};
use crate::module::{ModuleControl, ModuleSubject};
use crate::outcome::{ExecutionOutcome, Termination};
use crate::script::{Script, Step};
use crate::subject::Subject;

use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Everything one test case owns.
///
/// Teardown runs at most once and always before presentation; presenting a
/// second time yields [`HarnessError::FailuresAlreadyPresented`].
pub struct TestCase<S: Subject> {
    id: Uuid,
    subject: S,
    config: HarnessConfig,
    failures: FailureList,
    script: Option<Script>,
    expectations: Expectations,
    outcome: Option<ExecutionOutcome>,
    started: bool,
    torn_down: bool,
    span: Span,
}

impl<S: Subject> TestCase<S> {
    pub fn new(subject: S, config: HarnessConfig) -> Self {
        let id = Uuid::new_v4();
        let span = info_span!("case", id = %id, subject = subject.name());
        Self {
            id,
            subject,
            config,
            failures: FailureList::new(),
            script: None,
            expectations: Expectations::ignore(),
            outcome: None,
            started: false,
            torn_down: false,
            span,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    pub fn subject_mut(&mut self) -> &mut S {
        &mut self.subject
    }

    /// Failure list, for checks that live outside the harness.
    pub fn failures(&mut self) -> &mut FailureList {
        &mut self.failures
    }

    /// Outcome captured by the last [`TestCase::run`].
    pub fn outcome(&self) -> Option<&ExecutionOutcome> {
        self.outcome.as_ref()
    }

    /// Declares the ordered steps to deliver.
    ///
    /// An empty list is rejected here, before any subject is started.
    pub fn check_signals(&mut self, steps: Vec<Step>) -> Result<&mut Self> {
        self.script = Some(Script::new(steps)?);
        Ok(self)
    }

    pub fn check_script(&mut self, script: Script) -> &mut Self {
        self.script = Some(script);
        self
    }

    pub fn expect_stdout<I, T>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.expectations.stdout = StreamExpectation::contains(entries);
        self
    }

    pub fn expect_stderr<I, T>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.expectations.stderr = StreamExpectation::contains(entries);
        self
    }

    pub fn verify_stdout_empty(&mut self) -> &mut Self {
        self.expectations.stdout = StreamExpectation::Empty;
        self
    }

    pub fn verify_stderr_empty(&mut self) -> &mut Self {
        self.expectations.stderr = StreamExpectation::Empty;
        self
    }

    pub fn expect_exit(&mut self, termination: Termination) -> &mut Self {
        self.expectations.termination = Some(termination);
        self
    }

    pub fn expect_exit_code(&mut self, code: i32) -> &mut Self {
        self.expect_exit(Termination::Exited(code))
    }

    /// Output streams and exit status are not checked.
    pub fn expect_ignore(&mut self) -> &mut Self {
        self.expectations = Expectations::ignore();
        self
    }

    /// Starts the subject if it is not running yet.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let span = self.span.clone();
        self.subject.start().instrument(span).await?;
        self.started = true;
        Ok(())
    }

    /// Starts the subject, delivers the script, finalizes and validates the
    /// captured outcome against the declared expectations.
    pub async fn run(&mut self) -> Result<DeliveryReport<S::State>> {
        let Some(script) = self.script.take() else {
            return Err(HarnessError::EmptyScript);
        };
        let span = self.span.clone();
        let result = async {
            self.start().await?;
            let report = DeliveryLoop::new(&self.config)
                .run(&mut self.subject, &script, &mut self.failures)
                .await?;
            self.expectations.validate(&report.outcome, &mut self.failures);
            self.outcome = Some(report.outcome.clone());
            Ok::<_, HarnessError>(report)
        }
        .instrument(span)
        .await;
        self.script = Some(script);
        result
    }

    /// Releases the subject; leaks land in the failure list.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let span = self.span.clone();
        self.subject
            .teardown(&mut self.failures)
            .instrument(span)
            .await;
    }

    /// Presents the accumulated failures once.
    pub fn present(&mut self) -> Result<()> {
        let _entered = self.span.enter();
        self.failures.present()?;
        info!("test case passed");
        Ok(())
    }

    /// Teardown followed by presentation.
    pub async fn finish(&mut self) -> Result<()> {
        self.teardown().await;
        self.present()
    }

    /// Runs the whole case: script, validation, teardown, presentation.
    ///
    /// A fatal error still tears the subject down; it then takes precedence
    /// over any accumulated failures.
    pub async fn execute(&mut self) -> Result<()> {
        match self.run().await {
            Ok(_) => self.finish().await,
            Err(fatal) => Err(self.abort(fatal).await),
        }
    }

    /// Tears down after a fatal error and hands the error back.
    ///
    /// Failures accumulated so far are presented and logged, not returned.
    pub async fn abort(&mut self, fatal: HarnessError) -> HarnessError {
        self.teardown().await;
        let _entered = self.span.enter();
        match self.failures.present() {
            Err(HarnessError::Assertions(report)) => {
                warn!("discarding {} after fatal error: {}", report, fatal)
            }
            Err(e) => warn!("{} after fatal error: {}", e, fatal),
            Ok(()) => {}
        }
        fatal
    }
}

impl<C: ModuleControl> TestCase<ModuleSubject<C>> {
    pub async fn load(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.subject.load().instrument(span).await
    }

    pub async fn unload(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.subject.unload().instrument(span).await
    }

    /// Appends a failure for every entry missing from the kernel log.
    pub async fn check_log<I, T>(&mut self, entries: I, severity: Option<Severity>) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let query = LogQuery::new(entries, severity)?;
        let span = self.span.clone();
        self.subject
            .check_log(&query, &mut self.failures)
            .instrument(span)
            .await
    }

    /// Loads the module and checks the kernel log for `entries`.
    pub async fn check_for_load_msgs<I, T>(&mut self, entries: I, severity: Option<Severity>) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let query = LogQuery::new(entries, severity)?;
        self.load().await?;
        let span = self.span.clone();
        self.subject
            .check_log(&query, &mut self.failures)
            .instrument(span)
            .await
    }

    /// Loads and unloads the module, then checks the kernel log for `entries`.
    pub async fn check_for_unload_msgs<I, T>(&mut self, entries: I, severity: Option<Severity>) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let query = LogQuery::new(entries, severity)?;
        self.load().await?;
        self.unload().await?;
        let span = self.span.clone();
        self.subject
            .check_log(&query, &mut self.failures)
            .instrument(span)
            .await
    }
}

//! Supervises a user-mode program or a loadable kernel module through a
//! scripted sequence of signals or load/unload steps, checks what it did,
//! and makes sure nothing it started outlives the test case.

pub mod build;
pub mod case;
pub mod config;
pub mod delivery;
pub mod error;
pub mod expect;
pub mod failures;
pub mod imports;
pub mod kernel_log;
pub mod module;
pub mod outcome;
pub mod process;
pub mod script;
pub mod signals;
pub mod subject;

pub use build::{find_path_to_dir, MakeBuild};
pub use case::TestCase;
pub use config::{HarnessConfig, ProcessConfig};
pub use delivery::{DeliveryLoop, DeliveryReport, StopReason};
pub use error::{HarnessError, Result};
pub use expect::{Expectations, StreamExpectation};
pub use failures::{FailureList, FailureReport};
pub use imports::{DynamicImports, STDIO_FUNCTIONS};
pub use kernel_log::{LogQuery, Severity};
pub use module::{CommandOutput, ModuleControl, ModuleState, ModuleSubject, SudoModuleControl};
pub use outcome::{ExecutionOutcome, Termination};
pub use process::{
    carries_lineage, find_processes_by_name, group_has_members, ProcEntry, ProcessState, ProcessSubject,
    LINEAGE_VAR,
};
pub use script::{Action, Script, Step};
pub use signals::SignalNumber;
pub use subject::{Subject, SubjectState, WaitOutcome};

type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{CaseCommand, Cli, ModuleArgs, ProcessArgs};
use sigwright::{HarnessConfig, MakeBuild, ModuleSubject, ProcessSubject, TestCase};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.harness_config();

    if let Some(ref dir) = cli.make_dir {
        let tolerant = matches!(cli.command, CaseCommand::Module(_));
        MakeBuild::new(dir)
            .tolerant(tolerant)
            .build(&cli.make_target)
            .await?;
    }

    match cli.command {
        CaseCommand::Process(args) => run_process(args, config).await?,
        CaseCommand::Module(args) => run_module(args, config).await?,
    }

    info!("all checks passed");
    Ok(())
}

async fn run_process(args: ProcessArgs, config: HarnessConfig) -> Result<()> {
    let subject = ProcessSubject::new(args.process_config());
    let mut case = TestCase::new(subject, config);
    case.check_signals(args.steps.clone())?;

    if args.stdout_empty {
        case.verify_stdout_empty();
    } else if !args.expect_stdout.is_empty() {
        case.expect_stdout(args.expect_stdout.iter().cloned());
    }
    if args.stderr_empty {
        case.verify_stderr_empty();
    } else if !args.expect_stderr.is_empty() {
        case.expect_stderr(args.expect_stderr.iter().cloned());
    }
    if let Some(termination) = args.termination() {
        case.expect_exit(termination);
    }

    case.execute().await?;
    Ok(())
}

async fn run_module(args: ModuleArgs, config: HarnessConfig) -> Result<()> {
    args.validate()?;

    let subject = ModuleSubject::with_sudo(&args.artifact).with_settle_delay(config.settle_delay);
    let mut case = TestCase::new(subject, config);
    case.start().await?;

    let checks = async {
        if !args.steps.is_empty() {
            case.check_signals(args.steps.clone())?;
            case.run().await?;
        }
        if !args.load_msg.is_empty() {
            case.check_for_load_msgs(args.load_msg.iter().cloned(), args.level).await?;
        }
        if !args.unload_msg.is_empty() {
            if case.subject().is_loaded() {
                case.unload().await?;
                case.check_log(args.unload_msg.iter().cloned(), args.level).await?;
            } else {
                case.check_for_unload_msgs(args.unload_msg.iter().cloned(), args.level).await?;
            }
        }
        Ok::<_, sigwright::HarnessError>(())
    }
    .await;

    if let Err(fatal) = checks {
        return Err(case.abort(fatal).await.into());
    }
    case.finish().await?;
    Ok(())
}

use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use build_service::{
    progress_channel, BuildEvent, BuildStatus, BuildStore, ContainerTracker, DbEngine, Engines,
    ExecEngine, InMemoryBuildStore, LogLevel, Plan, ServiceConfig,
};
use clap::Args;
use color_eyre::Result;

/// Run a plan as a tracked build
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the plan YAML file
    pub plan: PathBuf,

    /// Service configuration file (default: ~/.keel/config.yml when present)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Pipeline name recorded on the build
    #[arg(long, value_name = "PIPELINE")]
    pub pipeline: Option<String>,

    /// Job name recorded on the build
    #[arg(long, value_name = "JOB")]
    pub job: Option<String>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    if !args.plan.exists() {
        color_eyre::eyre::bail!("Plan file not found: {}", args.plan.display());
    }

    let config = ServiceConfig::load(args.config.as_deref())?;

    output::status("Loading", &format!("{}", args.plan.display()));
    let plan = Plan::from_file(&args.plan)?;
    plan.validate()?;
    output::info(&format!("Plan with {} put steps", plan.puts().len()));

    let provider = config.backend.provider().await?;
    let tracker = Arc::new(ContainerTracker::new(provider));
    let store = Arc::new(InMemoryBuildStore::new());
    let (tx, mut rx) = progress_channel();

    let exec = ExecEngine::new(store.clone(), tracker.clone())
        .with_progress(tx.clone())
        .with_release_policy(config.release_policy());
    let engine = DbEngine::new(Engines::default().with_engine(Arc::new(exec)), store.clone())
        .with_track_lease(config.tracking_lease())
        .with_progress(tx);

    let record = store.create_build(args.pipeline.as_deref(), args.job.as_deref());
    let build = engine.create_build(record, &plan).await?;

    let mut resume = {
        let build = build.clone();
        tokio::spawn(async move { build.resume().await })
    };

    loop {
        tokio::select! {
            Some(event) = rx.recv() => render(&event),
            _ = tokio::signal::ctrl_c() => {
                output::warning(&format!("Aborting build {}", build.id()));
                if let Err(e) = build.abort().await {
                    output::error(&format!("Failed to abort: {}", e));
                }
            }
            result = &mut resume => {
                result?;
                break;
            }
        }
    }

    while let Ok(event) = rx.try_recv() {
        render(&event);
    }

    tracker.destroy_all().await;

    let status = store
        .reload(build.id())
        .await?
        .map(|record| record.status)
        .unwrap_or(BuildStatus::Errored);
    if status != BuildStatus::Succeeded {
        std::process::exit(1);
    }

    Ok(())
}

fn render(event: &BuildEvent) {
    match event {
        BuildEvent::BuildStarted { labels } => {
            println!();
            let scope = match (&labels.pipeline_name, &labels.job_name) {
                (Some(pipeline), Some(job)) => format!(" of {}/{}", pipeline, job),
                (Some(pipeline), None) => format!(" of {}", pipeline),
                _ => String::new(),
            };
            output::header(&format!("Build {}{}", labels.build_name, scope));
        }

        BuildEvent::BuildFinished {
            status, duration, ..
        } => {
            println!();
            let seconds = duration.as_secs_f64();
            if *status == BuildStatus::Succeeded {
                output::success(&format!("Build succeeded in {:.2}s", seconds));
            } else {
                output::failure(&format!("Build {} after {:.2}s", status, seconds));
            }
        }

        BuildEvent::StepStarted { step_name, .. } => {
            println!("    put '{}'", step_name);
        }

        BuildEvent::StepOutput {
            step_name,
            output,
            is_error,
            ..
        } => {
            if *is_error {
                output::step_error(step_name, output);
            } else {
                output::step_output(step_name, output);
            }
        }

        BuildEvent::StepCompleted {
            step_name,
            exit_status,
            version,
            ..
        } => match version {
            Some(info) => {
                let version = info
                    .version
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect::<Vec<_>>()
                    .join(", ");
                output::dim_success(&format!("    put '{}' OK ({})", step_name, version));
                for field in &info.metadata {
                    output::dim(&format!("        {}: {}", field.name, field.value));
                }
            }
            None => {
                output::dim_failure(&format!("    put '{}' FAIL ({})", step_name, exit_status));
            }
        },

        BuildEvent::StepErrored {
            step_name, message, ..
        } => {
            output::error(&format!("put '{}' errored: {}", step_name, message));
        }

        BuildEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            LogLevel::Info => output::info(message),
        },
    }
}

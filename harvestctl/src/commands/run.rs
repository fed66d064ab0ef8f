use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use harvest_core::engine::{CdpPortalFactory, CodeProvider, FileInbox, HttpSmsCodeProvider};
use harvest_core::{
    Credentials, EngineError, PortalLauncher, RunLog, SessionController, StepCatalog,
};

use crate::{AppContext, AppError, Result, RunArgs};

pub fn execute(context: &AppContext, args: &RunArgs) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = context.config.clone();
    if let Some(queue) = &args.queue {
        if !config.portal.queues.contains(queue) {
            return Err(AppError::MissingResource(format!(
                "queue '{queue}' is not configured"
            )));
        }
        config.portal.queues = vec![queue.clone()];
    }
    let config = Arc::new(config);
    let catalog = Arc::new(StepCatalog::from_csv_path(&context.steps_path)?);
    let credentials = Credentials::from_env(&config.portal)?;

    let run_log = Arc::new(
        RunLog::new(
            config.resolve_path(&config.observability.run_log),
            config.resolve_path(&config.observability.events_db),
        )
        .map_err(EngineError::from)?,
    );
    info!(run_id = %run_log.run_id(), config = %context.config_path.display(), "starting run");

    let code_provider: Option<Arc<dyn CodeProvider>> = if config.two_factor.enabled {
        Some(Arc::new(HttpSmsCodeProvider::from_config(&config.two_factor)?))
    } else {
        None
    };

    let launcher = PortalLauncher::new(config.clone())
        .with_headless(args.headed.then_some(false));
    let factory = CdpPortalFactory::new(launcher);
    let mut controller = SessionController::new(
        config.clone(),
        catalog,
        credentials,
        code_provider,
        run_log,
    )?;

    let runtime = tokio::runtime::Runtime::new()?;
    let metrics = runtime.block_on(async {
        if args.no_recovery {
            controller.run(&factory).await
        } else {
            let channel = FileInbox::new(
                config.resolve_path(&config.paths.inbox_dir),
                config.resolve_path(&config.paths.outbox_dir),
            );
            controller.run_with_recovery(&factory, &channel).await
        }
    });

    match metrics {
        Ok(metrics) => {
            info!(
                targets_completed = metrics.targets_completed,
                targets_failed = metrics.targets_failed,
                targets_skipped = metrics.targets_skipped,
                steps_executed = metrics.steps_executed,
                interferences_cleared = metrics.interferences_cleared,
                "run finished"
            );
            Ok(())
        }
        Err(EngineError::Cancelled) => Err(AppError::Aborted(
            "operator cancelled the run".to_string(),
        )),
        Err(err) => Err(err.into()),
    }
}

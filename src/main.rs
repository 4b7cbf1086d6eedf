//! Task Finalizer CLI
//!
//! Finalizes tasks, reports finalize status, polls PRs, or runs the long-lived
//! service that streams events as JSON lines on stdout.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use task_finalizer::{
    ApprovalTrigger, Backend, EventBus, EventPayload, EventStreamer, FileBackend,
    FinalizeRequest, FinalizeService, FinalizerConfig, GhCiMerger, GhCliProvider, GitService,
    HostingProvider, JsonLinesSink, PrPoller, Publisher, Result, SubscribeFilter,
    SyncPhaseExecutor, Validate, WorktreeGit,
};

const USAGE: &str = "Usage: task-finalizer <command>

Commands:
  serve                                    Run the PR poller and stream events
  finalize <task-id> [--force] [--gate-override]
                                           Finalize a task and follow its progress
  status <task-id>                         Print the finalize status of a task
  poll <task-id>                           Refresh a task's PR status now

Environment variables:
  FINALIZER_CONFIG     Path to a TOML config file
  FINALIZER_TASKS_DIR  Directory holding task YAML files (default: .tasks)";

struct App {
    config: Arc<FinalizerConfig>,
    backend: Arc<dyn Backend>,
    bus: Arc<EventBus>,
    hosting: Arc<dyn HostingProvider>,
    service: Arc<FinalizeService>,
}

impl App {
    fn build() -> Result<Self> {
        let config = match std::env::var_os("FINALIZER_CONFIG") {
            Some(path) => FinalizerConfig::load(&PathBuf::from(path))?,
            None => {
                let config = FinalizerConfig::default();
                config.validate().into_result()?;
                config
            }
        };
        let config = Arc::new(config);

        let repo_path = std::env::current_dir()?;
        let tasks_dir = std::env::var_os("FINALIZER_TASKS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| repo_path.join(".tasks"));

        let backend: Arc<dyn Backend> = Arc::new(FileBackend::new(tasks_dir));
        let bus = Arc::new(EventBus::new(config.events.buffer_size));
        let git: Arc<dyn GitService> = Arc::new(WorktreeGit::new(
            repo_path.clone(),
            config.worktree.dir.clone(),
        ));
        let hosting: Arc<dyn HostingProvider> = Arc::new(GhCliProvider::new(repo_path));
        let executor = Arc::new(SyncPhaseExecutor::new(Arc::clone(&git), &config.completion));
        let ci_merger = Arc::new(GhCiMerger::new(
            Arc::clone(&git),
            Arc::clone(&hosting),
            config.completion.clone(),
        ));

        let service = Arc::new(FinalizeService::new(
            Arc::clone(&config),
            Arc::clone(&backend),
            bus.clone(),
            git,
            executor,
            ci_merger,
        ));

        Ok(Self {
            config,
            backend,
            bus,
            hosting,
            service,
        })
    }

    fn poller(&self) -> PrPoller {
        let mut poller = PrPoller::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.hosting),
            &self.config.pr_poller,
        )
        .with_publisher(self.bus.clone());
        if self.config.completion.auto_trigger_on_approval {
            poller = poller.with_listener(Arc::new(ApprovalTrigger::new(Arc::clone(&self.service))));
        }
        poller
    }
}

async fn serve(app: App) -> Result<i32> {
    app.service.start_background();

    let shutdown = CancellationToken::new();
    let poller = Arc::new(app.poller());
    poller.start(shutdown.clone());

    let streamer = EventStreamer::new(app.bus.clone(), Arc::clone(&app.backend))
        .with_heartbeat_interval(app.config.heartbeat_interval());
    let stream_cancel = shutdown.child_token();
    let stream = tokio::spawn(async move {
        let mut sink = JsonLinesSink::new(tokio::io::stdout());
        streamer
            .run(SubscribeFilter::all().with_heartbeat(true), &mut sink, stream_cancel)
            .await
    });

    tracing::info!("finalizer service running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    shutdown.cancel();
    poller.stop().await;
    app.service.shutdown().await;
    app.bus.close();

    match stream.await {
        Ok(Ok(())) => Ok(0),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "event stream ended with error");
            Ok(0)
        }
        Err(e) => {
            tracing::error!(error = %e, "event stream task panicked");
            Ok(1)
        }
    }
}

async fn finalize(app: App, task_id: &str, request: FinalizeRequest) -> Result<i32> {
    let mut subscription = app.bus.subscribe(task_id);
    let response = app.service.start_finalize(task_id, request).await?;
    println!("{}: {}", response.task_id, response.message);

    while let Some(event) = subscription.recv().await {
        let EventPayload::FinalizeProgress(progress) = event.payload else {
            continue;
        };
        println!(
            "[{:>3}%] {} - {}",
            progress.step_percent, progress.step, progress.progress
        );
        if progress.status.is_terminal() {
            break;
        }
    }
    app.bus.unsubscribe(task_id, &subscription);

    let view = app.service.get_finalize_status(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    app.service.shutdown().await;

    Ok(match view.error {
        Some(_) => 1,
        None => 0,
    })
}

async fn status(app: App, task_id: &str) -> Result<i32> {
    let view = app.service.get_finalize_status(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(0)
}

async fn poll(app: App, task_id: &str) -> Result<i32> {
    let status = app.poller().poll_task_by_id(task_id).await?;
    println!("{}: {}", task_id, status);
    Ok(0)
}

async fn run(args: &[String]) -> Result<i32> {
    let command = args.get(1).map(String::as_str);
    let task_id = args.get(2).map(String::as_str);

    match (command, task_id) {
        (Some("serve"), _) => serve(App::build()?).await,
        (Some("finalize"), Some(task_id)) => {
            let flags = &args[3..];
            let request = FinalizeRequest {
                force: flags.iter().any(|f| f == "--force"),
                gate_override: flags.iter().any(|f| f == "--gate-override"),
            };
            finalize(App::build()?, task_id, request).await
        }
        (Some("status"), Some(task_id)) => status(App::build()?, task_id).await,
        (Some("poll"), Some(task_id)) => poll(App::build()?, task_id).await,
        _ => {
            eprintln!("{}", USAGE);
            Ok(2)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let code = match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use arena_judge::config::{CliArgs, Config};
use arena_judge::judge::Judge;
use arena_judge::problems::ProblemStore;
use arena_judge::queue::JobQueue;
use arena_judge::sandbox::{create_sandbox_runner, prepare_work_root};
use arena_judge::session::SessionManager;
use arena_judge::web_server::build_server;
use arena_judge::worker::worker;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        judge: judge_config,
    } = cli.to_config().context("Failed to load configuration")?;

    let work_root = prepare_work_root(judge_config.work_root.as_deref())
        .context("Failed to prepare the work directory")?;
    log::info!("Workspaces live under {}", work_root.display());

    let runner = create_sandbox_runner(&judge_config).context("Failed to set up the sandbox")?;
    let judge = Arc::new(Judge::new(&judge_config, work_root, runner));
    let job_queue = Arc::new(JobQueue::new(judge_config.queue_capacity));
    let shutdown_token = CancellationToken::new();
    let manager = Arc::new(SessionManager::new(
        &judge_config,
        job_queue.clone(),
        shutdown_token.clone(),
    ));
    let problems = ProblemStore::new(judge_config.problems_dir.clone());

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=judge_config.workers {
        workers.spawn(worker(
            i,
            judge.clone(),
            job_queue.clone(),
            shutdown_token.clone(),
        ));
    }
    log::info!("Started {} workers", judge_config.workers);

    let reaper = tokio::spawn(
        manager
            .clone()
            .reaper(judge_config.reap_interval.into()),
    );

    let server =
        build_server(server_config, manager, problems).context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop accepting requests
    server_handle.stop(true).await;

    // 2. Kill every running session and stop workers and reaper
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Err(e)) => log::error!("Worker finished with error: {e:?}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {e:?}"),
            Err(e) => log::error!("Worker handle finished with error: {e:?}"),
            Ok(Ok(())) => {}
        }
    }
    if let Err(e) = reaper.await {
        log::error!("Session reaper failed: {e:?}");
    }

    log::info!("Shutdown complete");
    Ok(())
}

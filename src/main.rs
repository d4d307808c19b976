use std::sync::Arc;

use anyhow::{Context, bail};
use secrecy::ExposeSecret;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use inbox_sync::auth::{AuthorizationGrant, CredentialManager, GoogleTokenEndpoint};
use inbox_sync::config::Config;
use inbox_sync::crypto::Cipher;
use inbox_sync::enrich::{EnrichmentWorker, LlmClassifier};
use inbox_sync::llm::create_provider;
use inbox_sync::locks::UserLocks;
use inbox_sync::provider::gmail::GmailClient;
use inbox_sync::queue::{RetryPolicy, Task, TaskQueue, TaskRunner};
use inbox_sync::scheduler::Scheduler;
use inbox_sync::store::{Database, LibSqlBackend};
use inbox_sync::sync::{Reconciler, SyncEngine};
use inbox_sync::tasks::TaskContext;

const USAGE: &str =
    "usage: inbox-sync [worker | enqueue-sync <user_id> | register <email> [full name] | drain]";

enum Command {
    Worker,
    EnqueueSync(i64),
    /// Token-exchange JSON is read from stdin.
    Register {
        email: String,
        full_name: Option<String>,
    },
    Drain,
}

fn parse_args() -> anyhow::Result<Command> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["worker"] => Ok(Command::Worker),
        ["drain"] => Ok(Command::Drain),
        ["enqueue-sync", user_id] => {
            let user_id = user_id
                .parse()
                .with_context(|| format!("invalid user id '{user_id}'"))?;
            Ok(Command::EnqueueSync(user_id))
        }
        ["register", email, name @ ..] => Ok(Command::Register {
            email: email.to_string(),
            full_name: (!name.is_empty()).then(|| name.join(" ")),
        }),
        _ => bail!(USAGE),
    }
}

/// Install the global subscriber. The returned guard flushes the file
/// writer and must live until exit.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-sync.log");
            let (file, guard) = tracing_appender::non_blocking(appender);
            builder.with_writer(std::io::stderr.and(file)).init();
            Some(guard)
        }
        None => {
            builder.with_writer(std::io::stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = parse_args()?;
    let config = Config::from_env().context("failed to load configuration")?;
    let _log_guard = init_tracing(&config);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "inbox-sync starting");

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| {
                format!("failed to open database at {}", config.database_path.display())
            })?,
    );
    let db: Arc<dyn Database> = backend.clone();
    let queue: Arc<dyn TaskQueue> = backend;

    if let Command::EnqueueSync(user_id) = command {
        let id = queue.enqueue(&Task::SyncUser { user_id }).await?;
        tracing::info!(%id, user_id, "Sync queued");
        return Ok(());
    }

    // ── Services ─────────────────────────────────────────────────────────
    let cipher = Arc::new(Cipher::from_base64(config.encryption_key.expose_secret())?);
    let http = reqwest::Client::new();
    let endpoint = Arc::new(GoogleTokenEndpoint::new(
        http.clone(),
        config.google.token_uri.clone(),
        config.google.client_id.clone(),
        config.google.client_secret.clone(),
    ));
    let mailbox = Arc::new(GmailClient::with_base_url(http, &config.google.api_base));
    let locks = Arc::new(UserLocks::new());

    let credentials = Arc::new(CredentialManager::new(
        Arc::clone(&db),
        Arc::clone(&cipher),
        endpoint,
        Arc::clone(&locks),
    ));
    if let Command::Register { email, full_name } = &command {
        let json = std::io::read_to_string(std::io::stdin())
            .context("failed to read token JSON from stdin")?;
        let grant =
            AuthorizationGrant::from_token_json(email, full_name.clone(), &json, chrono::Utc::now())
                .context("invalid token JSON")?;
        let user = credentials.register_grant(&grant).await?;
        let id = queue.enqueue(&Task::SyncUser { user_id: user.id }).await?;
        tracing::info!(user_id = user.id, %id, "User registered, first sync queued");
        return Ok(());
    }

    let sync = Arc::new(SyncEngine::new(
        Arc::clone(&db),
        Arc::clone(&cipher),
        mailbox.clone(),
        Arc::clone(&credentials),
        config.sync.page_size,
    ));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&db),
        mailbox,
        config.sync.reconcile_page_size,
        config.sync.reconcile_max_pages,
    ));

    let llm = create_provider(&config.llm)?;
    let enrichment = Arc::new(EnrichmentWorker::new(
        Arc::clone(&db),
        Arc::clone(&cipher),
        Arc::new(LlmClassifier::new(llm)),
        config.enrich.batch_size,
        config.enrich.excerpt_chars,
        config.enrich.max_attempts,
    ));

    let context = Arc::new(TaskContext::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        credentials,
        sync,
        reconciler,
        enrichment,
        locks,
    ));
    let runner = Arc::new(TaskRunner::new(
        Arc::clone(&queue),
        context,
        RetryPolicy::from_config(&config.queue),
        config.queue.lease,
    ));

    if let Command::Drain = command {
        let summary = runner.run_until_idle().await?;
        tracing::info!(
            completed = summary.completed,
            retried = summary.retried,
            failed = summary.failed,
            "Queue drained"
        );
        return Ok(());
    }

    // ── Workers + scheduler ──────────────────────────────────────────────
    let mut handles = Vec::with_capacity(config.queue.concurrency + 1);
    for worker in 0..config.queue.concurrency {
        handles.push(Arc::clone(&runner).spawn(worker, config.queue.poll_interval));
    }
    let scheduler = Scheduler::new(Arc::clone(&db), Arc::clone(&queue), &config.schedule)?;
    handles.push(scheduler.spawn());

    tracing::info!(
        workers = config.queue.concurrency,
        sync_schedule = %config.schedule.sync,
        reconcile_schedule = %config.schedule.reconcile,
        "Running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    for (_, shutdown) in &handles {
        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    }
    for (handle, _) in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
    tracing::info!("Stopped");
    Ok(())
}

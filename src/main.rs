use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use relayflow::api::{ApiState, api_routes};
use relayflow::channels::{
    BotApi, EmailConfig, ImapMailbox, MailSender, Mailbox, SmtpMailer, TelegramBotApi,
    TelegramConfig,
};
use relayflow::config::{ApiConfig, RunnerConfig, StoreConfig, SupervisorConfig};
use relayflow::llm::{LlmConfig, create_model};
use relayflow::pipeline::{DestinationFactory, SourceFactory};
use relayflow::store::{LibSqlBackend, WorkflowStore};
use relayflow::supervisor::{LeasedWakeLock, Supervisor};
use relayflow::workflow::{PipelineExecutor, WorkflowRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // ── Logging ─────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match std::env::var("RELAYFLOW_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "relayflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    // ── Configuration ───────────────────────────────────────────────────
    let runner_config = RunnerConfig::from_env()?;
    let supervisor_config = SupervisorConfig::from_env()?;
    let api_config = ApiConfig::from_env()?;
    let store_config = StoreConfig::from_env()?;
    let llm_config = LlmConfig::from_env()?;

    eprintln!("relayflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} at {}", llm_config.model, llm_config.base_url);
    eprintln!("   Database: {}", store_config.db_path.display());
    eprintln!("   API: http://{}/api", api_config.addr());

    // ── Database ────────────────────────────────────────────────────────
    let store: Arc<dyn WorkflowStore> = Arc::new(
        LibSqlBackend::new_local(&store_config.db_path)
            .await
            .with_context(|| format!("opening database at {}", store_config.db_path.display()))?,
    );

    // ── Channel backends ────────────────────────────────────────────────
    let (mailbox, mail_sender): (Option<Arc<dyn Mailbox>>, Option<Arc<dyn MailSender>>) =
        match EmailConfig::from_env()? {
            Some(config) => {
                let config = Arc::new(config);
                tracing::info!(address = %config.from_address, "Email backend enabled");
                (
                    Some(Arc::new(ImapMailbox::new(Arc::clone(&config))) as Arc<dyn Mailbox>),
                    Some(Arc::new(SmtpMailer::new(config)) as Arc<dyn MailSender>),
                )
            }
            None => {
                tracing::info!("Email backend disabled (EMAIL_IMAP_HOST not set)");
                (None, None)
            }
        };

    let bot: Option<Arc<dyn BotApi>> = match TelegramConfig::from_env()? {
        Some(config) => {
            tracing::info!("Telegram backend enabled");
            Some(Arc::new(TelegramBotApi::new(config.bot_token)) as Arc<dyn BotApi>)
        }
        None => {
            tracing::info!("Telegram backend disabled (TELEGRAM_BOT_TOKEN not set)");
            None
        }
    };

    // ── Workflow engine ─────────────────────────────────────────────────
    let model = create_model(&llm_config);
    let executor = Arc::new(PipelineExecutor::new(
        SourceFactory::new(mailbox, bot.clone()).with_settings(Arc::clone(&store)),
        Arc::new(DestinationFactory::new(mail_sender, bot)),
        model,
        runner_config,
    ));
    let runner = Arc::new(WorkflowRunner::new(executor, Arc::clone(&store)));
    let supervisor = Supervisor::new(
        runner,
        Arc::clone(&store),
        supervisor_config,
        Arc::new(LeasedWakeLock::new()),
    );

    // ── Startup recovery ────────────────────────────────────────────────
    match supervisor.recover().await {
        Ok(true) => {
            let status = supervisor.status().await;
            eprintln!("   Resumed {} workflow(s)", status.running_workflows.len());
        }
        Ok(false) => eprintln!("   Supervisor stopped by user; start it from the API"),
        Err(e) => tracing::error!(error = %e, "Startup recovery failed; the API can start workflows"),
    }

    // ── HTTP API ────────────────────────────────────────────────────────
    let app = api_routes(ApiState {
        store,
        supervisor: supervisor.clone(),
    });
    let listener = tokio::net::TcpListener::bind(api_config.addr())
        .await
        .with_context(|| format!("binding {}", api_config.addr()))?;
    tracing::info!(addr = %api_config.addr(), "Control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("serving control API")?;

    supervisor.shutdown().await;
    Ok(())
}

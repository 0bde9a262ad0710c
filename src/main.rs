use anyhow::{Context, Result};
use bucket_drive::{
    AppConfig, Backend, MemoryStore, NavigationEngine, ObjectStoreClient, SqliteStore,
    shell::{Command, Outcome, Shell},
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting bucket-drive with config: {:?}", cfg);

    // --- Initialize backend ---
    let store: Arc<dyn ObjectStoreClient> = match cfg.backend {
        Backend::Sqlite => {
            let store = SqliteStore::connect(&cfg.database_url, &cfg.storage_dir)
                .await
                .with_context(|| format!("opening database {}", cfg.database_url))?;
            store
                .run_migrations()
                .await
                .context("running migrations")?;
            if migrate {
                tracing::info!("Database migration complete.");
                return Ok(());
            }
            Arc::new(store)
        }
        Backend::Memory => {
            if migrate {
                tracing::warn!("--migrate has no effect on the memory backend");
                return Ok(());
            }
            let store = MemoryStore::new();
            store.add_project(&cfg.navigator.default_project);
            Arc::new(store)
        }
    };

    let engine = Arc::new(NavigationEngine::new(store, cfg.navigator.clone()));
    run_shell(Shell::new(engine)).await
}

/// Read commands from stdin until `exit` or EOF. Ctrl-C cancels the
/// running command, not the shell.
async fn run_shell(mut shell: Shell) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(shell.prompt().as_bytes()).await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };
        let outcome = shell.execute(command, &cancel).await;
        interrupt.abort();

        match outcome {
            Ok(Outcome::Exit) => break,
            Ok(Outcome::Output(text)) if text.is_empty() => {}
            Ok(Outcome::Output(text)) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
            Err(err) => eprintln!("error: {err:#}"),
        }
    }

    tracing::info!("Shell closed");
    Ok(())
}

//! Sandbox worker: one pre-request script sandbox in its own process.
//!
//! Spawned by [`af_sandbox::SandboxHandle`] with a cleared environment. The
//! first frame on stdin is a [`WorkerConfig`]; after that stdin carries host
//! messages and stdout carries sandbox messages, all as length-delimited JSON.
//! The process exits when its single evaluation settles or the host closes stdin.

use af_sandbox::protocol::{read_message, read_message_with_limit, write_message, WorkerConfig};
use af_sandbox::{HostMessage, SandboxLoop, SandboxMessage};
use anyhow::{Context, Result};
use tokio::io::{self, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // stdout is the message channel, so logs go to stderr (null unless AF_DEBUG)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let config: WorkerConfig = read_message(&mut stdin)
        .await
        .context("failed to read worker config from parent")?
        .context("parent closed stdin before sending the worker config")?;
    let max_frame = config.max_ipc_message_size;
    let sandbox_config = config.to_sandbox_config();

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<HostMessage>();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<SandboxMessage>();

    // V8 isolates are !Send; the loop gets its own thread and runtime.
    let sandbox_thread = std::thread::Builder::new()
        .name("af-sandbox".into())
        .spawn(move || -> Result<()> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to create sandbox runtime")?;
            rt.block_on(async move {
                let sandbox = SandboxLoop::new(sandbox_config, inbox_rx, outbox_tx)
                    .context("failed to create sandbox")?;
                let state = sandbox.run().await;
                tracing::debug!(?state, "sandbox loop finished");
                Ok(())
            })
        })
        .context("failed to spawn sandbox thread")?;

    let reader = tokio::spawn(async move {
        loop {
            match read_message_with_limit::<HostMessage, _>(&mut stdin, max_frame).await {
                Ok(Some(msg)) => {
                    if inbox_tx.send(msg).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("parent closed stdin");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to read from parent");
                    break;
                }
            }
        }
    });

    while let Some(msg) = outbox_rx.recv().await {
        write_message(&mut stdout, &msg)
            .await
            .context("failed to write message to parent")?;
    }

    reader.abort();
    match sandbox_thread.join() {
        Ok(result) => result,
        Err(_) => anyhow::bail!("sandbox thread panicked"),
    }
}

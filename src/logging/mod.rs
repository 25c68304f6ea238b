use std::io::{self, Write};
use std::path::Path;

use env_logger::Builder;
use log::LevelFilter;
use tokio::{
    fs::{create_dir_all, metadata, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};

use crate::config;
use crate::core::{ErrorContext, GatewayError, GatewayResult};

/// `Write` half handed to env_logger; lines go to the file sink task.
pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = buf.to_vec();
        self.sender
            .send(data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: Option<UnboundedReceiver<Vec<u8>>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver: Some(receiver),
            config,
        }
    }

    pub fn create_async_writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.config.level.parse().unwrap_or(LevelFilter::Info)
    }

    /// Installs env_logger at the configured level; `RUST_LOG` still applies.
    ///
    /// With `log.path` set, output goes through the file sink instead of stderr.
    pub fn init_env_logger(&self) -> GatewayResult<()> {
        let mut builder = Builder::new();
        builder
            .filter_level(self.level())
            .parse_env(env_logger::Env::default());
        if self.config.path.is_some() {
            builder.target(env_logger::Target::Pipe(Box::new(self.create_async_writer())));
        }
        builder
            .try_init()
            .map_err(|e| GatewayError::Internal(format!("logger already initialized: {e}")))
    }

    /// Spawns the task appending log lines to `log.path` until `shutdown` flips.
    ///
    /// Returns `None` without a configured path or when already spawned.
    pub fn spawn_file_sink(
        &mut self,
        shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<GatewayResult<()>>> {
        let path = self.config.path.clone()?;
        let receiver = self.receiver.take()?;
        Some(tokio::spawn(run_file_sink(path, receiver, shutdown)))
    }
}

async fn run_file_sink(
    path: String,
    mut receiver: UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) -> GatewayResult<()> {
    if let Some(parent) = Path::new(&path).parent() {
        if metadata(parent).await.is_err() {
            create_dir_all(parent)
                .await
                .with_context("Failed to create log path")?;
        }
    }

    let mut file = BufWriter::new(
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .with_context("Failed to open or create log file")?,
    );

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    log::info!("Shutdown signal received, stopping write log");
                    // flush what was logged before the signal
                    while let Ok(data) = receiver.try_recv() {
                        if let Err(e) = file.write_all(&data).await {
                            log::error!("Failed to write to log file: {e}");
                        }
                    }
                    break;
                }
            },

            data = receiver.recv() => {
                match data {
                    Some(data) => {
                        if let Err(e) = file.write_all(&data).await {
                            log::error!("Failed to write to log file: {e}");
                        }
                    }
                    None => {
                        log::info!("Log channel closed, stopping write log");
                        break;
                    }
                }
            }
        }
    }

    file.flush().await.with_context("Failed to flush log file")
}

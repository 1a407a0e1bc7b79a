/*
 * Copyright (c) 2025 MirageDB contributors. All rights reserved.
 *
 * MirageDB - MongoDB-compatible database facade
 *
 * @file shutdown.rs
 * @brief Graceful shutdown and signal handling
 */

use crate::cursor::CursorRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(i32),
    Request,
    Error(String),
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::Request => "request",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub graceful_timeout: Duration,
    pub signal_handling: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(30),
            signal_handling: true,
        }
    }
}

/// Coordinates graceful stop: the accept loop watches the token and
/// refuses new connections, in-flight cursors are drained (closed), and
/// a caller-provided cleanup runs under a timeout.
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    token: CancellationToken,
    is_shutting_down: Arc<RwLock<bool>>,
    config: ShutdownConfig,
}

impl ShutdownManager {
    pub fn new(config: ShutdownConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            token: CancellationToken::new(),
            is_shutting_down: Arc::new(RwLock::new(false)),
            config,
        }
    }

    /// Token observed by the accept loop and background tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.is_shutting_down.read().await
    }

    pub async fn start_signal_handling(&self) {
        if !self.config.signal_handling {
            return;
        }

        let shutdown_tx = self.shutdown_tx.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Failed to register SIGTERM handler: {}", e);
                    return;
                }
            };
            sigterm.recv().await;
            info!("Received SIGTERM, initiating graceful shutdown");
            let _ = shutdown_tx.send(ShutdownReason::Signal(15));
            token.cancel();
        });

        let shutdown_tx = self.shutdown_tx.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT, initiating graceful shutdown");
                let _ = shutdown_tx.send(ShutdownReason::Signal(2));
                token.cancel();
            }
        });
    }

    pub async fn initiate_shutdown(&self, reason: ShutdownReason) {
        {
            let mut is_shutting_down = self.is_shutting_down.write().await;
            if *is_shutting_down {
                return;
            }
            *is_shutting_down = true;
        }
        info!("Initiating graceful shutdown: {:?}", reason);
        let _ = self.shutdown_tx.send(reason);
        self.token.cancel();
    }

    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        let mut rx = self.subscribe();
        match rx.recv().await {
            Ok(reason) => reason,
            Err(_) => ShutdownReason::Request,
        }
    }

    /// Drain in-flight cursors, then run `cleanup_fn` under the graceful
    /// timeout.
    pub async fn graceful_shutdown<F, Fut>(
        &self,
        registry: &CursorRegistry,
        cleanup_fn: F,
    ) -> Result<(), String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let drained = registry.close_all();
        if drained > 0 {
            info!("Drained {} in-flight cursors", drained);
        }

        match timeout(self.config.graceful_timeout, cleanup_fn()).await {
            Ok(Ok(())) => {
                info!("Graceful shutdown completed");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Cleanup failed during shutdown: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Cleanup timed out after {:?}",
                    self.config.graceful_timeout
                );
                Err("graceful shutdown timeout".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_initiate_shutdown_fires_token_and_channel() {
        let manager = ShutdownManager::new(ShutdownConfig {
            signal_handling: false,
            ..ShutdownConfig::default()
        });
        let mut rx = manager.subscribe();
        let token = manager.token();

        assert!(!manager.is_shutting_down().await);
        manager.initiate_shutdown(ShutdownReason::Request).await;

        assert!(manager.is_shutting_down().await);
        assert!(token.is_cancelled());
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::Request);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_drains_cursors() {
        let manager = ShutdownManager::new(ShutdownConfig {
            signal_handling: false,
            ..ShutdownConfig::default()
        });
        let registry = CursorRegistry::new(Duration::from_secs(600));
        let id = registry.allocate_id();
        registry.register(crate::cursor::Cursor::from_documents(
            id,
            crate::cursor::Namespace::new("test", "c"),
            vec![bson::doc! {"_id": 1}],
        ));

        manager.initiate_shutdown(ShutdownReason::Request).await;
        manager
            .graceful_shutdown(&registry, || async { Ok(()) })
            .await
            .unwrap();
        assert!(registry.is_empty());
    }
}

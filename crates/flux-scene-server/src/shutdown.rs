use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

/// 关闭信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Term,

    /// SIGINT / Ctrl+C
    Interrupt,

    /// 手动触发
    Manual,
}

/// 把系统信号转成广播，控制器循环与总线任务各自订阅
pub struct SignalHandler {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl SignalHandler {
    pub fn new() -> (Self, broadcast::Receiver<ShutdownSignal>) {
        let (tx, rx) = broadcast::channel(16);
        (Self { shutdown_tx: tx }, rx)
    }

    #[cfg(unix)]
    pub async fn wait_for_system_signal(&self) -> ShutdownSignal {
        use signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
                return self.wait_for_ctrl_c().await;
            }
        };

        let sig = tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                ShutdownSignal::Term
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                ShutdownSignal::Interrupt
            }
        };
        let _ = self.shutdown_tx.send(sig);
        sig
    }

    #[cfg(not(unix))]
    pub async fn wait_for_system_signal(&self) -> ShutdownSignal {
        self.wait_for_ctrl_c().await
    }

    async fn wait_for_ctrl_c(&self) -> ShutdownSignal {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received Ctrl+C");
        let _ = self.shutdown_tx.send(ShutdownSignal::Interrupt);
        ShutdownSignal::Interrupt
    }

    /// 手动触发关闭
    pub fn trigger_shutdown(&self) {
        info!("Manual shutdown triggered");
        let _ = self.shutdown_tx.send(ShutdownSignal::Manual);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }
}

/// 等待第一个关闭信号；发送端全部关闭也视为关闭
pub async fn recv_shutdown(mut rx: broadcast::Receiver<ShutdownSignal>) {
    let _ = rx.recv().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_trigger_reaches_subscribers() {
        let (handler, mut rx) = SignalHandler::new();
        let mut other = handler.subscribe();

        handler.trigger_shutdown();

        assert_eq!(rx.recv().await.unwrap(), ShutdownSignal::Manual);
        assert_eq!(other.recv().await.unwrap(), ShutdownSignal::Manual);
    }

    #[tokio::test]
    async fn test_recv_shutdown_returns_on_drop() {
        let (handler, rx) = SignalHandler::new();
        drop(handler);
        recv_shutdown(rx).await;
    }
}

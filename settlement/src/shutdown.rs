//! Coordinated shutdown
//!
//! Every long-running component implements [`Stoppable`]. The node stops
//! them all concurrently and then closes the broker client, giving up once
//! the overall deadline passes rather than hanging.

use async_trait::async_trait;
use futures::future::join_all;
use message_bus::BrokerClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Something that can be asked to stop
#[async_trait]
pub trait Stoppable: Send + Sync {
    /// Component name for logs
    fn name(&self) -> &str;

    /// Stop taking work, let in-flight work finish, release resources
    async fn stop(&self);
}

/// Stop every component, then close `client`, all within `timeout`.
///
/// Returns `false` if the deadline passed first.
pub async fn shutdown_all(
    components: &[Arc<dyn Stoppable>],
    client: Option<&BrokerClient>,
    timeout: Duration,
) -> bool {
    info!("Stopping {} components", components.len());

    let work = async {
        join_all(components.iter().map(|component| async move {
            component.stop().await;
            info!("{} stopped", component.name());
        }))
        .await;

        if let Some(client) = client {
            client.close().await;
        }
    };

    match tokio::time::timeout(timeout, work).await {
        Ok(()) => {
            info!("✅ Shutdown complete");
            true
        }
        Err(_) => {
            warn!(
                "⚠️ Shutdown did not finish within {:?}, abandoning",
                timeout
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Component {
        name: &'static str,
        delay: Duration,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl Stoppable for Component {
        fn name(&self) -> &str {
            self.name
        }

        async fn stop(&self) {
            tokio::time::sleep(self.delay).await;
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn component(name: &'static str, delay: Duration) -> Arc<Component> {
        Arc::new(Component {
            name,
            delay,
            stopped: AtomicBool::new(false),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_components_stop_concurrently() {
        let a = component("a", Duration::from_secs(20));
        let b = component("b", Duration::from_secs(20));
        let all: Vec<Arc<dyn Stoppable>> = vec![a.clone(), b.clone()];

        // Sequential stops would need 40s
        assert!(shutdown_all(&all, None, Duration::from_secs(30)).await);
        assert!(a.stopped.load(Ordering::SeqCst));
        assert!(b.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_abandoned_after_timeout() {
        let slow = component("slow", Duration::from_secs(120));
        let all: Vec<Arc<dyn Stoppable>> = vec![slow.clone()];

        assert!(!shutdown_all(&all, None, Duration::from_secs(30)).await);
        assert!(!slow.stopped.load(Ordering::SeqCst));
    }
}

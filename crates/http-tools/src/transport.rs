//! Process-wide pooled HTTP client.
//!
//! The client is swapped for a fresh one every `idle_sweep_interval`, which releases the idle
//! sockets held by the previous pool once in-flight requests on it finish.

use crate::runtime::{OperationError, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 10;
pub const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub idle_sweep_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            idle_sweep_interval: DEFAULT_IDLE_SWEEP_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    options: TransportOptions,
    client: RwLock<reqwest::Client>,
    generation: AtomicU64,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`OperationError::Transport`] if the TLS backend cannot be initialized.
    pub fn new(options: TransportOptions) -> Result<Self> {
        let client = build_client(&options)?;
        Ok(Self {
            inner: Arc::new(TransportInner {
                options,
                client: RwLock::new(client),
                generation: AtomicU64::new(0),
            }),
        })
    }

    /// Current client. Cheap: `reqwest::Client` is a handle to a shared pool.
    #[must_use]
    pub fn client(&self) -> reqwest::Client {
        self.inner.client.read().clone()
    }

    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    /// Number of times the client has been replaced.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Relaxed)
    }

    /// Replace the client with a fresh pool.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Transport`] if the new client cannot be built; the old one stays.
    pub fn rebuild(&self) -> Result<()> {
        let fresh = build_client(&self.inner.options)?;
        *self.inner.client.write() = fresh;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(generation, "http client pool replaced");
        Ok(())
    }

    /// Periodically [`Self::rebuild`] until `shutdown` fires.
    pub fn spawn_idle_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let transport = self.clone();
        let period = self.inner.options.idle_sweep_interval;
        tokio::spawn(async move {
            if period.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("http client sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = transport.rebuild() {
                            warn!(error = %e, "failed to replace http client; keeping the current pool");
                        }
                    }
                }
            }
        })
    }
}

fn build_client(options: &TransportOptions) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(options.connect_timeout)
        .pool_idle_timeout(options.pool_idle_timeout)
        .pool_max_idle_per_host(options.pool_max_idle_per_host)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(OperationError::from)
}

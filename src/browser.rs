//! Bounded pool of headless-browser execution contexts.
//!
//! One long-lived Chrome driver process backs every lease; contexts (pages)
//! are cheap and are what callers actually check out. Capacity is enforced
//! by a semaphore sized to the configured maximum; a [`Lease`] that is
//! dropped without an explicit [`Lease::release`] still returns its permit
//! and tears its context down, so a panicking or cancelled caller can never
//! leak pool capacity.

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::Page;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;
const DEFAULT_VIEWPORT_HEIGHT: u32 = 720;
const MAX_CONSOLE_LOGS: usize = 1000;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    LaunchFailed(String),
    #[error("browser operation failed: {0}")]
    OperationFailed(String),
    #[error("browser pool exhausted: no lease available within the deadline")]
    PoolExhausted,
    #[error("lease acquisition cancelled")]
    Cancelled,
}

impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        BrowserError::OperationFailed(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleEntry {
    pub level: String,
    pub text: String,
    pub timestamp: Instant,
}

struct Driver {
    #[allow(dead_code)] // keeps the browser process alive
    browser: Browser,
    #[allow(dead_code)] // keeps the CDP event pump alive
    handler_task: JoinHandle<()>,
}

/// A checked-out, exclusive browser context. Not `Clone`; moved into the
/// worker that leased it and consumed by [`release`](Lease::release).
pub struct Lease {
    page: Page,
    console_logs: Arc<StdMutex<VecDeque<ConsoleEntry>>>,
    console_task: Option<JoinHandle<()>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
    released: bool,
}

impl Lease {
    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn console_logs(&self) -> Vec<ConsoleEntry> {
        self.console_logs.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear_console_logs(&self) {
        self.console_logs.lock().unwrap().clear();
    }

    /// Return the lease to the pool. `ok=false` tears the context down
    /// instead of reusing it, since its state may be unrecoverable.
    pub async fn release(mut self, ok: bool) {
        self.released = true;
        if ok {
            let _ = self.page.goto("about:blank").await;
        }
        if let Some(task) = self.console_task.take() {
            task.abort();
        }
        let _ = self.page.close().await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            if let Some(task) = self.console_task.take() {
                task.abort();
            }
            tracing::warn!("browser lease dropped without explicit release; tearing down context");
        }
    }
}

/// Bounded lease/release pool over a single shared browser driver.
pub struct BrowserPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    driver: OnceCell<Driver>,
}

impl BrowserPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            driver: OnceCell::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn driver(&self) -> Result<&Driver, BrowserError> {
        self.driver
            .get_or_try_init(|| async {
                let config = BrowserConfig::builder()
                    .new_headless_mode()
                    .no_sandbox()
                    .arg("--disable-gpu")
                    .arg("--disable-software-rasterizer")
                    .viewport(chromiumoxide::handler::viewport::Viewport {
                        width: DEFAULT_VIEWPORT_WIDTH,
                        height: DEFAULT_VIEWPORT_HEIGHT,
                        device_scale_factor: Some(1.0),
                        emulating_mobile: false,
                        is_landscape: true,
                        has_touch: false,
                    })
                    .build()
                    .map_err(BrowserError::LaunchFailed)?;

                let (browser, mut handler) = Browser::launch(config)
                    .await
                    .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

                let handler_task = tokio::spawn(async move {
                    while let Some(event) = handler.next().await {
                        if let Err(e) = event {
                            tracing::warn!("CDP handler error: {e}");
                        }
                    }
                });

                Ok(Driver {
                    browser,
                    handler_task,
                })
            })
            .await
    }

    /// Acquire a lease, blocking up to `deadline`. Returns immediately with
    /// `Cancelled` if `cancel` is already set.
    pub async fn acquire(&self, cancel: &CancellationToken, deadline: Duration) -> Result<Lease, BrowserError> {
        if cancel.is_cancelled() {
            return Err(BrowserError::Cancelled);
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BrowserError::Cancelled),
            res = tokio::time::timeout(deadline, self.semaphore.clone().acquire_owned()) => {
                match res {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(BrowserError::OperationFailed("semaphore closed".into())),
                    Err(_) => return Err(BrowserError::PoolExhausted),
                }
            }
        };

        let driver = self.driver().await?;
        let page = driver
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::OperationFailed(e.to_string()))?;

        let console_logs = Arc::new(StdMutex::new(VecDeque::with_capacity(MAX_CONSOLE_LOGS)));
        let console_task = setup_console_listener(&page, console_logs.clone()).await.ok();

        Ok(Lease {
            page,
            console_logs,
            console_task,
            _permit: permit,
            released: false,
        })
    }

    pub async fn shutdown(&self) {
        if let Some(driver) = self.driver.get() {
            driver.handler_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_reports_configured_value() {
        let pool = BrowserPool::new(3);
        assert_eq!(pool.capacity(), 3);
    }

    #[tokio::test]
    async fn cancelled_token_returns_immediately_without_touching_the_pool() {
        let pool = BrowserPool::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pool.acquire(&cancel, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(BrowserError::Cancelled)));
        // No permit was taken, and no browser was launched.
        assert_eq!(pool.semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn acquire_blocks_second_caller_until_release() {
        let pool = BrowserPool::new(1);
        let cancel = CancellationToken::new();

        let first = pool.acquire(&cancel, Duration::from_secs(30)).await.unwrap();

        let second = pool.acquire(&cancel, Duration::from_millis(200)).await;
        assert!(matches!(second, Err(BrowserError::PoolExhausted)));

        first.release(true).await;
        let third = pool.acquire(&cancel, Duration::from_secs(30)).await;
        assert!(third.is_ok());
        third.unwrap().release(true).await;
    }
}

async fn setup_console_listener(
    page: &Page,
    console_logs: Arc<StdMutex<VecDeque<ConsoleEntry>>>,
) -> Result<JoinHandle<()>, BrowserError> {
    let mut events = page.event_listener::<EventConsoleApiCalled>().await?;
    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let level = format!("{:?}", event.r#type).to_lowercase();
            let text = event
                .args
                .iter()
                .map(|arg| {
                    if let Some(value) = &arg.value {
                        match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        }
                    } else if let Some(desc) = &arg.description {
                        desc.clone()
                    } else if let Some(unser) = &arg.unserializable_value {
                        unser.inner().clone()
                    } else {
                        String::from("[unknown]")
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");

            if let Ok(mut logs) = console_logs.lock() {
                if logs.len() >= MAX_CONSOLE_LOGS {
                    logs.pop_front();
                }
                logs.push_back(ConsoleEntry {
                    level,
                    text,
                    timestamp: Instant::now(),
                });
            }
        }
    }))
}

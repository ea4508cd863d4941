/// BLE scanner
///
/// Drives the platform central role, filtered to the Exposure Notification
/// service UUID. Raw callbacks are normalised into `Advertisement`s; packets
/// whose service data is missing or not exactly 20 bytes are dropped, since
/// partial packets are routine on a noisy channel.
///
/// A scan failure reported by the platform ends the stream with an error.
/// The scanner never restarts itself.

use super::payload::{Advertisement, AdvertisementPayload};
use crate::rotation::Clock;
use crate::transport::abstraction::{
    BleCentral, BleError, RawAdvertisement, ScanEvent, ScanSettings, EN_SERVICE_UUID,
};
use futures::task::AtomicWaker;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors for scanner operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScannerError {
    #[error("Could not start scan: {0}")]
    StartFailed(BleError),
    #[error("Scan failed: {0}")]
    ScanFailed(BleError),
}

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    Scanning,
}

// ============================================================================
// SCAN SESSION
// ============================================================================

/// Shared between the scanner and the stream it handed out. Whichever side
/// cancels first releases the platform scan; later cancels are no-ops.
struct ScanSession {
    central: Arc<dyn BleCentral>,
    cancelled: AtomicBool,
    waker: AtomicWaker,
}

impl ScanSession {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.central.stop_scan();
            self.waker.wake();
            tracing::debug!("Stopped scanning");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Stream of valid advertisements from one scan session
///
/// Once the session is cancelled nothing more is yielded, even if the
/// platform had already queued results. Dropping the stream cancels it.
pub struct AdvertisementStream {
    session: Arc<ScanSession>,
    events: mpsc::Receiver<ScanEvent>,
    clock: Arc<dyn Clock>,
    finished: bool,
}

impl AdvertisementStream {
    fn normalize(&self, raw: RawAdvertisement, now: SystemTime) -> Option<Advertisement> {
        let data = match raw.service_data.get(&EN_SERVICE_UUID) {
            Some(data) => data,
            None => {
                tracing::trace!("Dropping scan result without EN service data");
                return None;
            }
        };
        match AdvertisementPayload::parse(data) {
            Some(payload) => Some(Advertisement::new(payload, raw.rssi, now)),
            None => {
                tracing::trace!(len = data.len(), "Dropping malformed EN service data");
                None
            }
        }
    }
}

impl Stream for AdvertisementStream {
    type Item = Result<Advertisement, ScannerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            this.session.waker.register(cx.waker());
            if this.session.is_cancelled() {
                this.finished = true;
                this.events.close();
                return Poll::Ready(None);
            }

            match this.events.poll_recv(cx) {
                Poll::Ready(Some(ScanEvent::Result(raw))) => {
                    let now = this.clock.now();
                    if let Some(advertisement) = this.normalize(raw, now) {
                        return Poll::Ready(Some(Ok(advertisement)));
                    }
                }
                Poll::Ready(Some(ScanEvent::Failed(e))) => {
                    tracing::warn!(error = %e, "Platform reported scan failure");
                    this.finished = true;
                    this.session.cancel();
                    return Poll::Ready(Some(Err(ScannerError::ScanFailed(e))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for AdvertisementStream {
    fn drop(&mut self) {
        self.session.cancel();
    }
}

// ============================================================================
// SCANNER
// ============================================================================

/// Scanner over a platform central
pub struct BleScanner {
    central: Arc<dyn BleCentral>,
    clock: Arc<dyn Clock>,
    settings: ScanSettings,
    session: Option<Arc<ScanSession>>,
}

impl BleScanner {
    pub fn new(central: Arc<dyn BleCentral>, clock: Arc<dyn Clock>, settings: ScanSettings) -> Self {
        Self {
            central,
            clock,
            settings,
            session: None,
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn state(&self) -> ScannerState {
        match &self.session {
            Some(session) if !session.is_cancelled() => ScannerState::Scanning,
            _ => ScannerState::Idle,
        }
    }

    /// Begin scanning. A previous session, if any, is cancelled first.
    pub async fn start(&mut self) -> Result<AdvertisementStream, ScannerError> {
        self.stop();

        let events = self
            .central
            .start_scan(self.settings.clone())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Could not start scanner");
                ScannerError::StartFailed(e)
            })?;

        let session = Arc::new(ScanSession {
            central: self.central.clone(),
            cancelled: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        });
        self.session = Some(session.clone());
        tracing::info!(mode = ?self.settings.mode, "Started scanning");

        Ok(AdvertisementStream {
            session,
            events,
            clock: self.clock.clone(),
            finished: false,
        })
    }

    /// Cancel the current scan. Safe to call at any time.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel();
        }
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

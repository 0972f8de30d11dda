//! Background captures with cooperative cancellation.
//!
//! A [`CaptureTask`] owns the [`SumpDevice`] for the duration of one capture,
//! so a device handle never has two captures in flight. Progress and sample
//! words are pushed to sinks that must not block; the channel sinks drop
//! events when the receiver falls behind.

use crate::capture_config::CaptureConfiguration;
use crate::serial_link::Transport;
use crate::sump_device::{CaptureOutcome, SumpDevice, SumpError};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub trait ProgressSink {
    /// Readout progress in percent, 0-100.
    fn on_progress(&self, percent: u8);
}

pub trait SampleSink {
    fn on_sample(&self, word: u32);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _percent: u8) {}
}

impl SampleSink for NullSink {
    fn on_sample(&self, _word: u32) {}
}

impl ProgressSink for Sender<u8> {
    fn on_progress(&self, percent: u8) {
        let _ = self.try_send(percent);
    }
}

impl SampleSink for Sender<u32> {
    fn on_sample(&self, word: u32) {
        let _ = self.try_send(word);
    }
}

/// Requests cancellation of a running capture from any thread.
///
/// Cancelling sets the shared flag first and then force-closes the transport
/// so a read blocked on the trigger returns.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl CancelToken {
    pub(crate) fn new(flag: Arc<AtomicBool>, transport: Arc<dyn Transport>) -> Self {
        Self { flag, transport }
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            log::info!("Cancelling capture");
            self.transport.close();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clears a previous cancellation before the next capture.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Where and how to capture.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub port: String,
    pub baud: u32,
    pub config: CaptureConfiguration,
}

impl CaptureRequest {
    pub fn new(port: impl Into<String>, baud: u32, config: CaptureConfiguration) -> Self {
        Self {
            port: port.into(),
            baud,
            config,
        }
    }
}

type TaskResult = (SumpDevice, Result<CaptureOutcome, SumpError>);

/// One capture running on its own thread.
pub struct CaptureTask {
    cancel: CancelToken,
    handle: JoinHandle<TaskResult>,
}

impl CaptureTask {
    /// Moves `device` onto a new thread and starts capturing. Any earlier
    /// cancellation of the device is cleared.
    pub fn spawn<P, S>(
        device: SumpDevice,
        request: CaptureRequest,
        progress: P,
        samples: S,
    ) -> Result<Self, SumpError>
    where
        P: ProgressSink + Send + 'static,
        S: SampleSink + Send + 'static,
    {
        let cancel = device.cancel_token();
        cancel.reset();

        let mut device = device;
        let handle = thread::Builder::new()
            .name(format!("sump-capture {}", request.port))
            .spawn(move || {
                let result = device.capture(
                    &request.port,
                    request.baud,
                    &request.config,
                    &progress,
                    &samples,
                );
                match &result {
                    Ok(outcome) if outcome.is_cancelled() => log::info!("Capture cancelled"),
                    Ok(_) => log::info!("Capture completed"),
                    Err(e) => log::warn!("Capture failed: {}", e),
                }
                (device, result)
            })
            .map_err(SumpError::TaskSpawn)?;

        Ok(Self { cancel, handle })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the capture and hands the device back for reuse. A panic on
    /// the capture thread is resumed on the caller.
    pub fn join(self) -> TaskResult {
        match self.handle.join() {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Like [`Self::join`], but returns the task unchanged while the capture
    /// is still running.
    pub fn try_join(self) -> Result<TaskResult, Self> {
        if self.is_finished() {
            Ok(self.join())
        } else {
            Err(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_channel_sinks_drop_when_full() {
        let (tx, rx) = bounded::<u8>(2);
        tx.on_progress(10);
        tx.on_progress(20);
        tx.on_progress(30);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![10, 20]);
    }

    #[test]
    fn test_channel_sinks_ignore_disconnected_receiver() {
        let (tx, rx) = bounded::<u32>(1);
        drop(rx);
        tx.on_sample(0xdead_beef);
    }

    #[test]
    fn test_cancel_token_resets() {
        let device = SumpDevice::serial();
        let token = device.cancel_token();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!token.is_cancelled());
    }
}

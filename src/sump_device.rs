use crate::acquisition::{CancelToken, ProgressSink, SampleSink};
use crate::capture::{decode_capture, CapturedTrace};
use crate::capture_config::{AcquisitionGeometry, CaptureConfiguration, ConfigError, TriggerStage};
use crate::metadata::DeviceMetadata;
use crate::protocol::{
    encode_long_command, encode_short_command, read_device_id, read_metadata_record,
    read_sample_word, trigger_opcode, DeviceId, MetadataRecord, ProtocolError, ReadInterrupted,
    CMD_ID, CMD_METADATA, CMD_RESET, CMD_RUN, RESET_REPEAT, SET_DIVIDER, SET_FLAGS, SET_SIZE,
    SET_TRIGGER_CONFIG, SET_TRIGGER_MASK, SET_TRIGGER_VALUE,
};
use crate::serial_link::{LinkError, SerialTransport, SumpLink, Transport};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Attempts at reading a known device id before giving up.
pub const DETECT_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SumpError {
    #[error("Transport error: {0}")]
    Transport(#[from] LinkError),

    #[error("Sample readout failed: {0}")]
    Readout(#[from] ReadInterrupted),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No SUMP device found on {port}")]
    DeviceNotFound { port: String },

    #[error("Device on {port} is obsolete (SLA0). Please upgrade the firmware")]
    ObsoleteDevice { port: String },

    #[error("Session is not attached to a device")]
    NotAttached,

    #[error("Invalid capture configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start capture thread: {0}")]
    TaskSpawn(io::Error),
}

impl From<io::Error> for SumpError {
    fn from(e: io::Error) -> Self {
        Self::Transport(LinkError::Io(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Detached,
    Attaching,
    Detecting,
    Configuring,
    Running,
    Draining,
}

/// How a capture ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Completed(CapturedTrace),
    /// Stopped on request. Carries the zero-padded partial trace if the
    /// readout had already started.
    Cancelled(Option<CapturedTrace>),
}

impl CaptureOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn trace(&self) -> Option<&CapturedTrace> {
        match self {
            Self::Completed(trace) => Some(trace),
            Self::Cancelled(trace) => trace.as_ref(),
        }
    }

    pub fn into_trace(self) -> Option<CapturedTrace> {
        match self {
            Self::Completed(trace) => Some(trace),
            Self::Cancelled(trace) => trace,
        }
    }
}

/// Raw buffer as filled by [`SumpDevice::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readout {
    pub buffer: Vec<u32>,
    pub cancelled: bool,
}

/// Session with one SUMP device.
///
/// Lifecycle calls are not reentrant: one thread drives the session while
/// others may only use its [`CancelToken`].
pub struct SumpDevice {
    transport: Arc<dyn Transport>,
    link: Option<Box<dyn SumpLink>>,
    port: String,
    state: SessionState,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for SumpDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SumpDevice")
            .field("port", &self.port)
            .field("state", &self.state)
            .field("attached", &self.link.is_some())
            .finish_non_exhaustive()
    }
}

fn progress_percent(index: usize, len: usize) -> u8 {
    (100 - (100 * index as u64) / len.max(1) as u64) as u8
}

impl SumpDevice {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            link: None,
            port: String::new(),
            state: SessionState::Detached,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Session over a local serial port.
    pub fn serial() -> Self {
        Self::new(Arc::new(SerialTransport::new()))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(Arc::clone(&self.cancel), Arc::clone(&self.transport))
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn transition(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("Session {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn link(&mut self) -> Result<&mut (dyn SumpLink + 'static), SumpError> {
        self.link.as_deref_mut().ok_or(SumpError::NotAttached)
    }

    fn send_command(&mut self, opcode: u8) -> Result<(), SumpError> {
        log::trace!("Sending short command: 0x{:02x} ({:08b})", opcode, opcode);
        let link = self.link()?;
        link.write_all(&encode_short_command(opcode))?;
        link.flush()?;
        Ok(())
    }

    fn send_long_command(&mut self, opcode: u8, data: u32) -> Result<(), SumpError> {
        log::debug!(
            "Sending long command: 0x{:02x} ({:08b}) with data 0x{:08x} ({:b})",
            opcode,
            opcode,
            data,
            data
        );
        let link = self.link()?;
        link.write_all(&encode_long_command(opcode, data))?;
        link.flush()?;
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), SumpError> {
        self.link()?.clear_input()?;
        Ok(())
    }

    /// Opens the link. Any previous link is detached first.
    #[tracing::instrument(skip(self))]
    pub fn attach(&mut self, port: &str, baud: u32) -> Result<(), SumpError> {
        self.detach();
        self.transition(SessionState::Attaching);

        log::info!("Attaching to {} @ {}bps ...", port, baud);
        match self.transport.open(port, baud) {
            Ok(link) => {
                self.link = Some(link);
                self.port = port.to_string();
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to open/use {}! Possible reason: {}", port, e);
                self.transition(SessionState::Detached);
                Err(e.into())
            }
        }
    }

    /// Resets the device and checks that it speaks SLA1.
    #[tracing::instrument(skip(self), fields(port = %self.port))]
    pub fn detect(&mut self) -> Result<(), SumpError> {
        self.link()?;
        self.transition(SessionState::Detecting);

        for attempt in 1..=DETECT_ATTEMPTS {
            self.flush_input()?;
            for _ in 0..RESET_REPEAT {
                self.send_command(CMD_RESET)?;
            }
            self.send_command(CMD_ID)?;

            let id = match read_device_id(self.link()?) {
                Ok(id) => id,
                Err(e) => {
                    log::info!("No device id on attempt {}: {}", attempt, e);
                    continue;
                }
            };

            match DeviceId::classify(id) {
                DeviceId::Supported => {
                    log::info!("Found Sump Logic Analyzer/LogicSniffer (0x{:08x})", id);
                    return Ok(());
                }
                DeviceId::Obsolete => {
                    log::info!("Found (unsupported!) Sump Logic Analyzer (0x{:08x})", id);
                    return Err(SumpError::ObsoleteDevice {
                        port: self.port.clone(),
                    });
                }
                DeviceId::Unknown(id) => {
                    log::info!("Found unknown device: 0x{:08x} (attempt {})", id, attempt);
                }
            }
        }

        Err(SumpError::DeviceNotFound {
            port: self.port.clone(),
        })
    }

    /// Reads the metadata records the device offers. Stops early, keeping
    /// what was read, if the stream breaks off.
    #[tracing::instrument(skip(self), fields(port = %self.port))]
    pub fn query_metadata(&mut self) -> Result<DeviceMetadata, SumpError> {
        self.flush_input()?;
        self.send_command(CMD_METADATA)?;

        let mut metadata = DeviceMetadata::new();
        let link = self.link()?;
        loop {
            match read_metadata_record(&mut *link) {
                Ok(MetadataRecord::Entry(key, value)) => metadata.insert(key, value),
                Ok(MetadataRecord::Skipped { .. }) => {}
                Ok(MetadataRecord::End) => break,
                Err(e) if e.is_recoverable() => {
                    log::info!("Skipping malformed metadata record: {}", e);
                }
                Err(e) => {
                    log::info!("Metadata readout ended early: {}", e);
                    break;
                }
            }
        }

        log::debug!("Metadata = \n{}", metadata);
        Ok(metadata)
    }

    /// Writes triggers, divider, size and flags. Returns the geometry the
    /// device was configured with.
    #[tracing::instrument(skip_all, fields(port = %self.port))]
    pub fn configure(
        &mut self,
        config: &CaptureConfiguration,
        metadata: &DeviceMetadata,
    ) -> Result<AcquisitionGeometry, SumpError> {
        self.link()?;
        self.transition(SessionState::Configuring);

        let geometry = AcquisitionGeometry::new(config, metadata);
        let stop_counter = geometry.effective_stop_counter(config);

        if config.trigger_enabled() {
            for (stage, trigger) in config.trigger_stages().iter().enumerate() {
                self.send_long_command(trigger_opcode(SET_TRIGGER_MASK, stage), trigger.mask)?;
                self.send_long_command(trigger_opcode(SET_TRIGGER_VALUE, stage), trigger.value)?;
                self.send_long_command(trigger_opcode(SET_TRIGGER_CONFIG, stage), trigger.config)?;
            }
        } else {
            let trigger = TriggerStage::capture_immediately();
            self.send_long_command(SET_TRIGGER_MASK, trigger.mask)?;
            self.send_long_command(SET_TRIGGER_VALUE, trigger.value)?;
            self.send_long_command(SET_TRIGGER_CONFIG, trigger.config)?;
        }

        let flags = config.flags();
        log::debug!("Flags: 0b{:b}", flags);

        self.send_long_command(SET_DIVIDER, config.divider())?;
        self.send_long_command(SET_SIZE, geometry.size_word(stop_counter))?;
        self.send_long_command(SET_FLAGS, flags)?;

        Ok(geometry)
    }

    /// Arms the device and reads the samples back.
    ///
    /// The wait for the first word is unbounded since it only arrives once
    /// the trigger fired. Words arrive most recent first and are stored from
    /// the end of the buffer towards index 0.
    #[tracing::instrument(skip_all, fields(port = %self.port, depth = geometry.samples()))]
    pub fn run(
        &mut self,
        config: &CaptureConfiguration,
        geometry: &AcquisitionGeometry,
        progress: &dyn ProgressSink,
        samples: &dyn SampleSink,
    ) -> Result<Readout, SumpError> {
        self.link()?;
        self.transition(SessionState::Running);

        let len = geometry.samples();
        let mut buffer = vec![0u32; len];
        if len == 0 {
            log::warn!("Nothing to capture, sample depth is zero");
            return Ok(Readout {
                buffer,
                cancelled: false,
            });
        }

        self.send_command(CMD_RUN)?;

        let groups = config.groups();
        let group_count = geometry.group_count;
        let cancel = Arc::clone(&self.cancel);
        let link = self.link()?;

        let last = len - 1;
        loop {
            if cancel.load(Ordering::SeqCst) {
                log::info!("Capture cancelled while waiting for trigger");
                return Ok(Readout {
                    buffer,
                    cancelled: true,
                });
            }
            match read_sample_word(&mut *link, groups, group_count, &cancel) {
                Ok(word) => {
                    buffer[last] = word;
                    progress.on_progress(progress_percent(last, len));
                    samples.on_sample(word);
                    break;
                }
                // trigger has not fired yet
                Err(ReadInterrupted::TimedOut) => {}
                Err(e) if cancel.load(Ordering::SeqCst) => {
                    log::debug!("Readout interrupted by cancellation: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut cancelled = false;
        for index in (0..last).rev() {
            if cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            match read_sample_word(&mut *link, groups, group_count, &cancel) {
                Ok(word) => {
                    buffer[index] = word;
                    progress.on_progress(progress_percent(index, len));
                    samples.on_sample(word);
                }
                Err(e) if cancel.load(Ordering::SeqCst) => {
                    log::debug!("Readout interrupted by cancellation: {}", e);
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    progress.on_progress(100);
                    return Err(e.into());
                }
            }
        }
        progress.on_progress(100);

        if cancelled {
            log::info!("Capture cancelled during readout");
        }
        Ok(Readout { buffer, cancelled })
    }

    /// Resets the device and closes the link. Safe to call at any time;
    /// failures are only logged.
    pub fn detach(&mut self) {
        let Some(mut link) = self.link.take() else {
            self.transition(SessionState::Detached);
            return;
        };
        self.transition(SessionState::Draining);

        let reset = encode_short_command(CMD_RESET);
        let sent = (0..RESET_REPEAT)
            .try_for_each(|_| link.write_all(&reset))
            .and_then(|()| link.flush());
        if let Err(e) = sent {
            log::warn!("Detaching failed! {}", e);
        }
        if let Err(e) = link.shutdown() {
            log::debug!("Closing link failed! {}", e);
        }
        drop(link);
        self.transport.close();

        log::info!("Detached from {}", self.port);
        self.transition(SessionState::Detached);
    }

    fn acquire(
        &mut self,
        config: &CaptureConfiguration,
        progress: &dyn ProgressSink,
        samples: &dyn SampleSink,
    ) -> Result<CaptureOutcome, SumpError> {
        self.detect()?;

        let metadata = self.query_metadata()?;
        if self.cancel_requested() {
            return Ok(CaptureOutcome::Cancelled(None));
        }

        let geometry = self.configure(config, &metadata)?;
        let readout = self.run(config, &geometry, progress, samples)?;

        let trace = decode_capture(readout.buffer, config, &geometry);
        Ok(if readout.cancelled {
            CaptureOutcome::Cancelled(Some(trace))
        } else {
            CaptureOutcome::Completed(trace)
        })
    }

    /// Runs a whole capture: attach, detect, metadata, configure, run, decode.
    /// The device is detached exactly once on every path.
    ///
    /// A cancellation requested through [`Self::cancel_token`] stays in effect
    /// until [`CancelToken::reset`]; while it does, this returns
    /// `Cancelled(None)` without opening the port.
    #[tracing::instrument(skip(self, config, progress, samples))]
    pub fn capture(
        &mut self,
        port: &str,
        baud: u32,
        config: &CaptureConfiguration,
        progress: &dyn ProgressSink,
        samples: &dyn SampleSink,
    ) -> Result<CaptureOutcome, SumpError> {
        if self.cancel_requested() {
            log::info!("Capture on {} cancelled before it started", port);
            return Ok(CaptureOutcome::Cancelled(None));
        }

        log::info!("Starting capture ...");
        self.attach(port, baud)?;

        let result = match self.acquire(config, progress, samples) {
            Err(e) if self.cancel_requested() => {
                log::info!("Capture cancelled: {}", e);
                Ok(CaptureOutcome::Cancelled(None))
            }
            other => other,
        };

        self.detach();
        result
    }
}

impl Drop for SumpDevice {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(99, 100), 1);
        assert_eq!(progress_percent(50, 100), 50);
        assert_eq!(progress_percent(0, 100), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }

    #[test]
    fn test_outcome_accessors() {
        let cancelled = CaptureOutcome::Cancelled(None);
        assert!(cancelled.is_cancelled());
        assert!(cancelled.trace().is_none());
        assert!(cancelled.into_trace().is_none());
    }

    #[test]
    fn test_new_session_is_detached() {
        let mut device = SumpDevice::serial();
        assert_eq!(device.state(), SessionState::Detached);
        assert!(!device.is_attached());
        assert!(matches!(device.query_metadata(), Err(SumpError::NotAttached)));
        assert!(matches!(device.detect(), Err(SumpError::NotAttached)));
        device.detach();
        assert_eq!(device.state(), SessionState::Detached);
    }
}

//! # SUMP RS
//!
//! A Rust library for driving SUMP-compatible logic analyzers (Open Bench Logic
//! Sniffer and friends) over a serial link.
//!
//! The library speaks the SUMP binary protocol: it detects the device, reads its
//! metadata, writes the trigger and sampling configuration, reads the captured
//! samples back and decodes them into a trace with timestamps, trigger position
//! and sample rate.
//!
//! ## Features
//!
//! - **Handshake**: device reset and SLA1 identification with retries
//! - **Metadata**: typed access to device name, probe count, memory depth, ...
//! - **Configuration**: builder for clock, divider, depth, channel groups,
//!   demultiplexing, noise filter, RLE and up to four trigger stages
//! - **Cancellable captures**: background capture task with progress and
//!   per-sample sinks, cancellable from any thread
//! - **Decoding**: run-length expansion and trigger position correction
//! - **DataFrame output**: traces convert to a `polars` DataFrame
//!
//! ## Examples
//!
//! ### Single Capture
//!
//! ```rust,no_run
//! use sump_rs::{CaptureConfiguration, NullSink, SumpDevice};
//!
//! let config = CaptureConfiguration::builder()
//!     .sample_rate(1_000_000)
//!     .sample_depth(8192)
//!     .build()?;
//!
//! let mut device = SumpDevice::serial();
//! let outcome = device.capture("/dev/ttyACM0", 115_200, &config, &NullSink, &NullSink)?;
//! if let Some(trace) = outcome.trace() {
//!     println!("Captured {} samples", trace.len());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Trigger Stages
//!
//! ```rust
//! use sump_rs::{BitState, CaptureConfiguration, TriggerStage};
//!
//! let trigger = TriggerStage::start_capturing_when()
//!     .channel(0, BitState::High)
//!     .channel(1, BitState::Low)
//!     .starts_capture();
//!
//! let config = CaptureConfiguration::builder()
//!     .trigger_stage(0, trigger)
//!     .ratio(0.25)
//!     .build()
//!     .unwrap();
//! assert!(config.trigger_enabled());
//! ```
//!
//! ### Background Capture
//!
//! ```rust,no_run
//! use sump_rs::{CaptureConfiguration, CaptureRequest, CaptureTask, SumpDevice};
//!
//! let config = CaptureConfiguration::builder().build()?;
//! let (progress_tx, progress_rx) = crossbeam_channel::bounded::<u8>(64);
//! let (sample_tx, _sample_rx) = crossbeam_channel::bounded::<u32>(1024);
//!
//! let task = CaptureTask::spawn(
//!     SumpDevice::serial(),
//!     CaptureRequest::new("/dev/ttyACM0", 115_200, config),
//!     progress_tx,
//!     sample_tx,
//! )?;
//!
//! for percent in progress_rx.iter().take_while(|p| *p < 100) {
//!     println!("{}%", percent);
//! }
//! let (_device, outcome) = task.join();
//! println!("cancelled: {}", outcome?.is_cancelled());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition;
pub mod capture;
pub mod capture_config;
pub mod metadata;
pub mod protocol;
pub mod serial_link;
pub mod sump_device;

// Re-export the main types for convenience
pub use acquisition::{
    CancelToken, CaptureRequest, CaptureTask, NullSink, ProgressSink, SampleSink,
};

pub use capture::{decode_capture, expand_rle, CapturedTrace};

pub use capture_config::{
    AcquisitionGeometry, BitState, CaptureConfiguration, CaptureConfigurationBuilder,
    ClockSource, ConfigError, TriggerStage, TriggerStageBuilder,
};

pub use metadata::{DeviceMetadata, MetadataKey, MetadataValue};

pub use protocol::{ProtocolError, ReadInterrupted};

pub use serial_link::{LinkError, SerialTransport, SumpLink, Transport};

pub use sump_device::{CaptureOutcome, Readout, SessionState, SumpDevice, SumpError};

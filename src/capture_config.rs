use crate::metadata::DeviceMetadata;
use crate::protocol::{MAX_GROUPS, TRIGGER_STAGES};

/// Base clock of a SUMP device, in Hz.
pub const CLOCK: u32 = 100_000_000;

/// Trigger config bit that starts the capture once the stage matches.
pub const TRIGGER_CAPTURE: u32 = 0x0800_0000;
const TRIGGER_SERIAL: u32 = 0x0400_0000;

pub const FLAG_DEMUX: u32 = 0x0000_0001;
pub const FLAG_FILTER: u32 = 0x0000_0002;
pub const FLAG_EXTERNAL: u32 = 0x0000_0040;
pub const FLAG_INVERTED: u32 = 0x0000_0080;
pub const FLAG_RLE: u32 = 0x0000_0100;
pub const FLAG_NUMBER_SCHEME: u32 = 0x0000_0200;
pub const FLAG_TEST_MODE: u32 = 0x0000_0400;
const GROUP_DISABLE_MASK: u32 = 0x0000_003c;

/// Largest value the divider register holds.
pub const MAX_DIVIDER: u32 = 0x00ff_ffff;

const CHANNELS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Pre/post trigger ratio {0} is outside 0.0..=1.0")]
    RatioOutOfRange(f64),

    #[error("Sample depth must be at least one channel group wide")]
    SampleDepthTooSmall,

    #[error("Divider {0} does not fit in 24 bits")]
    DividerOutOfRange(u32),

    #[error("At least one channel group must be enabled")]
    NoGroupEnabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    #[default]
    Internal,
    ExternalRising,
    ExternalFalling,
}

impl ClockSource {
    pub fn is_internal(&self) -> bool {
        *self == Self::Internal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitState {
    High,
    Low,
    DontCare,
}

/// One mask/value/config comparator of the device trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerStage {
    pub mask: u32,
    pub value: u32,
    pub config: u32,
}

impl TriggerStage {
    pub fn new(mask: u32, value: u32, config: u32) -> Self {
        Self {
            mask,
            value,
            config,
        }
    }

    /// Stage written when triggering is disabled: matches anything and starts
    /// the capture right away.
    pub fn capture_immediately() -> Self {
        Self::new(0, 0, TRIGGER_CAPTURE)
    }

    pub fn start_capturing_when() -> TriggerStageBuilder {
        TriggerStageBuilder::new()
    }

    pub fn delay(&self) -> u16 {
        (self.config & 0xffff) as u16
    }

    pub fn level(&self) -> u8 {
        ((self.config >> 16) & 0x3) as u8
    }

    pub fn starts_capture(&self) -> bool {
        self.config & TRIGGER_CAPTURE != 0
    }
}

#[derive(Debug)]
pub struct TriggerStageBuilder {
    channel_states: [BitState; CHANNELS],
    delay: u16,
    level: u8,
    serial_channel: Option<u8>,
}

impl TriggerStageBuilder {
    pub fn new() -> Self {
        Self {
            channel_states: [BitState::DontCare; CHANNELS],
            delay: 0,
            level: 0,
            serial_channel: None,
        }
    }

    pub fn channel(mut self, channel: usize, state: BitState) -> Self {
        match self.channel_states.get_mut(channel) {
            Some(slot) => *slot = state,
            None => log::warn!("Ignoring trigger condition on channel {}", channel),
        }
        self
    }

    /// Samples to wait after the match before the stage fires.
    pub fn delay(mut self, delay: u16) -> Self {
        self.delay = delay;
        self
    }

    /// Trigger level at which this stage becomes armed (0-3).
    pub fn level(mut self, level: u8) -> Self {
        self.level = level & 0x3;
        self
    }

    /// Match serially on a single channel instead of in parallel.
    pub fn serial(mut self, channel: u8) -> Self {
        self.serial_channel = Some(channel & 0x1f);
        self
    }

    fn build(self, start: bool) -> TriggerStage {
        let mut mask = 0u32;
        let mut value = 0u32;
        for (i, state) in self.channel_states.iter().enumerate() {
            if *state != BitState::DontCare {
                mask |= 1 << i;
            }
            if *state == BitState::High {
                value |= 1 << i;
            }
        }

        let mut config = u32::from(self.delay) | (u32::from(self.level) << 16);
        if let Some(channel) = self.serial_channel {
            config |= TRIGGER_SERIAL | (u32::from(channel) << 20);
        }
        if start {
            config |= TRIGGER_CAPTURE;
        }
        TriggerStage::new(mask, value, config)
    }

    /// Stage that starts the capture when it fires.
    pub fn starts_capture(self) -> TriggerStage {
        self.build(true)
    }

    /// Stage that only raises the trigger level when it fires.
    pub fn arms_next_level(self) -> TriggerStage {
        self.build(false)
    }
}

impl Default for TriggerStageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the device needs to know about one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfiguration {
    clock_source: ClockSource,
    divider: u32,
    sample_depth: u32,
    ratio: f64,
    groups: [bool; MAX_GROUPS],
    demultiplex: bool,
    noise_filter: bool,
    rle: bool,
    alternate_numbering: bool,
    test_mode: bool,
    trigger_enabled: bool,
    trigger_stages: [TriggerStage; TRIGGER_STAGES],
}

impl CaptureConfiguration {
    pub fn builder() -> CaptureConfigurationBuilder {
        CaptureConfigurationBuilder::new()
    }

    pub fn clock_source(&self) -> ClockSource {
        self.clock_source
    }

    pub fn divider(&self) -> u32 {
        self.divider
    }

    pub fn sample_depth(&self) -> u32 {
        self.sample_depth
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn groups(&self) -> [bool; MAX_GROUPS] {
        self.groups
    }

    pub fn is_group_enabled(&self, group: usize) -> bool {
        self.groups.get(group).copied().unwrap_or(false)
    }

    pub fn demultiplex(&self) -> bool {
        self.demultiplex
    }

    pub fn noise_filter(&self) -> bool {
        self.noise_filter
    }

    pub fn rle(&self) -> bool {
        self.rle
    }

    pub fn alternate_numbering(&self) -> bool {
        self.alternate_numbering
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn trigger_enabled(&self) -> bool {
        self.trigger_enabled
    }

    pub fn trigger_stages(&self) -> &[TriggerStage; TRIGGER_STAGES] {
        &self.trigger_stages
    }

    /// Demultiplexing only works off the internal clock.
    pub fn demux_active(&self) -> bool {
        self.demultiplex && self.clock_source.is_internal()
    }

    /// Bitmask of the channels belonging to enabled groups.
    pub fn enabled_channels(&self) -> u32 {
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, enabled)| **enabled)
            .fold(0u32, |mask, (group, _)| mask | (0xff << (8 * group)))
    }

    /// The value written with SET_FLAGS.
    pub fn flags(&self) -> u32 {
        let mut flags = 0u32;
        if !self.clock_source.is_internal() {
            flags |= FLAG_EXTERNAL;
            if self.clock_source == ClockSource::ExternalFalling {
                flags |= FLAG_INVERTED;
            }
        }

        let enabled_groups = self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, enabled)| **enabled)
            .fold(0u32, |bits, (group, _)| bits | (1 << group));
        flags |= !(enabled_groups << 2) & GROUP_DISABLE_MASK;

        if self.demux_active() {
            flags |= FLAG_DEMUX;
            flags &= !FLAG_FILTER;
        } else if self.noise_filter {
            flags |= FLAG_FILTER;
            flags &= !FLAG_DEMUX;
        }

        if self.rle {
            flags |= FLAG_RLE;
        }
        if self.alternate_numbering {
            flags |= FLAG_NUMBER_SCHEME;
        }
        if self.test_mode {
            flags |= FLAG_TEST_MODE;
        }
        flags
    }

    /// Sample rate in Hz, known only for the internal clock.
    pub fn sample_rate(&self) -> Option<u32> {
        if !self.clock_source.is_internal() {
            return None;
        }
        let rate = CLOCK / (self.divider + 1);
        Some(if self.demultiplex { 2 * rate } else { rate })
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfigurationBuilder {
    config: CaptureConfiguration,
}

impl CaptureConfigurationBuilder {
    pub fn new() -> Self {
        Self {
            config: CaptureConfiguration {
                clock_source: ClockSource::Internal,
                divider: 0,
                sample_depth: 4096,
                ratio: 0.5,
                groups: [true; MAX_GROUPS],
                demultiplex: false,
                noise_filter: false,
                rle: false,
                alternate_numbering: false,
                test_mode: false,
                trigger_enabled: false,
                trigger_stages: [TriggerStage::default(); TRIGGER_STAGES],
            },
        }
    }

    pub fn clock_source(mut self, clock_source: ClockSource) -> Self {
        self.config.clock_source = clock_source;
        self
    }

    pub fn divider(mut self, divider: u32) -> Self {
        self.config.divider = divider;
        self
    }

    /// Picks the divider that gets closest to `rate` Hz from the internal clock.
    pub fn sample_rate(mut self, rate: u32) -> Self {
        let rate = rate.max(1);
        self.config.divider = (CLOCK / rate).saturating_sub(1);
        self
    }

    pub fn sample_depth(mut self, sample_depth: u32) -> Self {
        self.config.sample_depth = sample_depth;
        self
    }

    /// Fraction of the samples taken before the trigger fires.
    pub fn ratio(mut self, ratio: f64) -> Self {
        self.config.ratio = ratio;
        self
    }

    pub fn group(mut self, group: usize, enabled: bool) -> Self {
        match self.config.groups.get_mut(group) {
            Some(slot) => *slot = enabled,
            None => log::warn!("Ignoring unknown channel group {}", group),
        }
        self
    }

    pub fn demultiplex(mut self, enabled: bool) -> Self {
        self.config.demultiplex = enabled;
        self
    }

    pub fn noise_filter(mut self, enabled: bool) -> Self {
        self.config.noise_filter = enabled;
        self
    }

    pub fn rle(mut self, enabled: bool) -> Self {
        self.config.rle = enabled;
        self
    }

    pub fn alternate_numbering(mut self, enabled: bool) -> Self {
        self.config.alternate_numbering = enabled;
        self
    }

    pub fn test_mode(mut self, enabled: bool) -> Self {
        self.config.test_mode = enabled;
        self
    }

    /// Sets one trigger stage and enables triggering.
    pub fn trigger_stage(mut self, stage: usize, trigger: TriggerStage) -> Self {
        match self.config.trigger_stages.get_mut(stage) {
            Some(slot) => {
                *slot = trigger;
                self.config.trigger_enabled = true;
            }
            None => log::warn!("Ignoring unknown trigger stage {}", stage),
        }
        self
    }

    pub fn trigger_enabled(mut self, enabled: bool) -> Self {
        self.config.trigger_enabled = enabled;
        self
    }

    pub fn build(self) -> Result<CaptureConfiguration, ConfigError> {
        let config = self.config;
        if !(0.0..=1.0).contains(&config.ratio) {
            return Err(ConfigError::RatioOutOfRange(config.ratio));
        }
        if config.sample_depth < 8 {
            return Err(ConfigError::SampleDepthTooSmall);
        }
        if config.divider > MAX_DIVIDER {
            return Err(ConfigError::DividerOutOfRange(config.divider));
        }
        if !config.groups.iter().any(|enabled| *enabled) {
            return Err(ConfigError::NoGroupEnabled);
        }
        Ok(config)
    }
}

impl Default for CaptureConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters and sizes of one acquisition, after the device limits are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionGeometry {
    /// Samples the device reads out in total.
    pub read_counter: u32,
    /// Samples taken after the trigger fires.
    pub stop_counter: u32,
    pub channels: u32,
    pub group_count: usize,
    pub demux: bool,
}

impl AcquisitionGeometry {
    pub fn new(config: &CaptureConfiguration, metadata: &DeviceMetadata) -> Self {
        let device_size = metadata.sample_memory_depth_or(config.sample_depth());
        let demux = config.demux_active();

        // demux merges group pairs: 16 channels, 8-sample alignment
        let (channels, align_mask) = if demux {
            (metadata.probe_count_or(16), 0x000f_fff8)
        } else {
            (metadata.probe_count_or(32), 0x000f_fffc)
        };

        let read_counter = device_size & align_mask;
        let stop_counter = ((f64::from(read_counter) * config.ratio()) as u32) & align_mask;

        Self {
            read_counter,
            stop_counter,
            channels,
            group_count: channels.div_ceil(8) as usize,
            demux,
        }
    }

    pub fn samples(&self) -> usize {
        self.read_counter as usize
    }

    /// With triggering off the whole memory is post-trigger.
    pub fn effective_stop_counter(&self, config: &CaptureConfiguration) -> u32 {
        if config.trigger_enabled() {
            self.stop_counter
        } else {
            self.read_counter
        }
    }

    /// The value written with SET_SIZE.
    pub fn size_word(&self, effective_stop_counter: u32) -> u32 {
        let stop = effective_stop_counter;
        let read = self.read_counter;
        if self.demux {
            ((stop.wrapping_sub(8) & 0x7fff8) << 13) | ((read & 0x7fff8) >> 3).wrapping_sub(1)
        } else {
            ((stop.wrapping_sub(4) & 0x3fffc) << 14) | ((read & 0x3fffc) >> 2).wrapping_sub(1)
        }
    }
}

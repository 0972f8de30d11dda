//! Turns the raw sample buffer of a finished acquisition into a trace.

use crate::capture_config::{AcquisitionGeometry, CaptureConfiguration};
use polars::prelude::*;

/// Top bit of a sample word marks a run-length count in RLE mode.
pub const RLE_COUNT_FLAG: u32 = 0x8000_0000;
const RLE_COUNT_MASK: u32 = 0x7fff_ffff;

const TIMESTAMP_COLUMN_NAME: &str = "timestamp";
const VALUE_COLUMN_NAME: &str = "value";
const TIME_COLUMN_NAME: &str = "time";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedTrace {
    values: Vec<u32>,
    timestamps: Vec<u64>,
    trigger_position: Option<usize>,
    sample_rate: Option<u32>,
    channels: u32,
    enabled_channels: u32,
    absolute_length: u64,
}

impl CapturedTrace {
    pub fn values(&self) -> &[u32] {
        &self.values
    }

    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps
    }

    /// `(value, timestamp)` pairs in capture order.
    pub fn samples(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.values
            .iter()
            .copied()
            .zip(self.timestamps.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Index into [`Self::values`] of the sample at which the trigger fired.
    pub fn trigger_position(&self) -> Option<usize> {
        self.trigger_position
    }

    /// Sample rate in Hz, unknown for an external clock.
    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn enabled_channels(&self) -> u32 {
        self.enabled_channels
    }

    /// Elapsed sample ticks covered by the trace. Differs from [`Self::len`]
    /// when run-length encoding collapsed repeated values.
    pub fn absolute_length(&self) -> u64 {
        self.absolute_length
    }

    /// Columns `timestamp`, `value`, `time` (seconds, only with a known
    /// sample rate) and one boolean `ch_N` per enabled channel.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let mut columns = vec![
            Column::new(TIMESTAMP_COLUMN_NAME.into(), self.timestamps.as_slice()),
            Column::new(VALUE_COLUMN_NAME.into(), self.values.as_slice()),
        ];

        for channel in 0..self.channels.min(32) {
            if (self.enabled_channels >> channel) & 1 == 0 {
                continue;
            }
            let bits: Vec<bool> = self
                .values
                .iter()
                .map(|value| (value >> channel) & 1 == 1)
                .collect();
            columns.push(Column::new(format!("ch_{}", channel).into(), bits));
        }

        let df = DataFrame::new(columns)?;
        match self.sample_rate {
            Some(rate) => df
                .lazy()
                .with_column(
                    (col(TIMESTAMP_COLUMN_NAME).cast(DataType::Float64)
                        * lit(1.0 / f64::from(rate)))
                    .alias(TIME_COLUMN_NAME),
                )
                .collect(),
            None => Ok(df),
        }
    }
}

/// Output of [`expand_rle`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RleExpansion {
    pub values: Vec<u32>,
    pub timestamps: Vec<u64>,
    /// Output position when the raw index first reached `stop_counter - 2`.
    pub trigger_mark: Option<usize>,
    pub absolute_length: u64,
}

/// Expands a run-length encoded buffer.
///
/// Level words get the running time as timestamp; count words add their low
/// 31 bits to it. A count directly following another count, including one at
/// the start of the buffer, is skipped.
pub fn expand_rle(buffer: &[u32], stop_counter: u32) -> RleExpansion {
    let mut expansion = RleExpansion::default();
    let trigger_index = i64::from(stop_counter) - 2;

    let mut previous = buffer.first().copied().unwrap_or(0);
    let mut time = 0u64;
    for (i, &word) in buffer.iter().enumerate() {
        if word & RLE_COUNT_FLAG != 0 {
            if previous & RLE_COUNT_FLAG != 0 {
                log::info!(
                    "Duplicate RLE count seen of {} vs {}!",
                    word & RLE_COUNT_MASK,
                    previous & RLE_COUNT_MASK
                );
                previous = word;
                continue;
            }
            let count = word & RLE_COUNT_MASK;
            log::trace!("RLE count seen of {} times 0x{:08x}", count, previous);
            time += u64::from(count);
            previous = word;
        } else {
            if i as i64 >= trigger_index && expansion.trigger_mark.is_none() {
                expansion.trigger_mark = Some(expansion.values.len());
            }
            expansion.values.push(word);
            expansion.timestamps.push(time);
            time += 1;
            previous = word;
        }
    }

    expansion.absolute_length = time;
    expansion
}

/// Trigger position of an unencoded capture. The offsets account for the
/// device's pipeline latency and are hardware-measured.
fn unencoded_trigger_position(
    config: &CaptureConfiguration,
    geometry: &AcquisitionGeometry,
    len: usize,
) -> Option<usize> {
    let divider_correction = i64::from(4 / (config.divider() + 1));
    let demux_correction = if config.demultiplex() { 5 } else { 0 };
    let position = i64::from(geometry.read_counter)
        - i64::from(geometry.stop_counter)
        - 3
        - divider_correction
        - demux_correction;

    usize::try_from(position).ok().filter(|&p| p < len)
}

/// Decodes a raw buffer, index 0 being the earliest sample.
pub fn decode_capture(
    buffer: Vec<u32>,
    config: &CaptureConfiguration,
    geometry: &AcquisitionGeometry,
) -> CapturedTrace {
    #[cfg(feature = "cpu-profiling")]
    let _zone = tracy_client::Client::running()
        .map(|client| client.span(tracy_client::span_location!("decode_capture"), 0));

    let sample_rate = config.sample_rate();

    let (values, timestamps, trigger_position, absolute_length) = if config.rle() {
        log::debug!("Decoding run length encoded data, sample count: {}", buffer.len());
        let expansion = expand_rle(&buffer, geometry.stop_counter);
        let trigger_position = if config.trigger_enabled() {
            expansion.trigger_mark.and_then(|mark| mark.checked_sub(1))
        } else {
            None
        };
        (
            expansion.values,
            expansion.timestamps,
            trigger_position,
            expansion.absolute_length,
        )
    } else {
        log::debug!("Decoding unencoded data, sample count: {}", buffer.len());
        let len = buffer.len();
        let trigger_position = if config.trigger_enabled() {
            unencoded_trigger_position(config, geometry, len)
        } else {
            None
        };
        (buffer, (0..len as u64).collect(), trigger_position, len as u64)
    };

    CapturedTrace {
        values,
        timestamps,
        trigger_position,
        sample_rate,
        channels: geometry.channels,
        enabled_channels: config.enabled_channels(),
        absolute_length,
    }
}

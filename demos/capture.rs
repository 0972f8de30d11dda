// Command line capture example
//
// Captures once from a SUMP device and prints the first rows of the trace as a
// table with one column per enabled channel.

use clap::Parser;
use sump_rs::{
    BitState, CaptureConfiguration, CaptureOutcome, ClockSource, NullSink, SumpDevice,
    TriggerStage,
};

#[derive(Parser)]
#[command(name = "capture")]
#[command(version = "1.0")]
#[command(about = "Capture samples from a SUMP compatible logic analyzer")]
struct Args {
    /// Serial port of the device
    port: String,

    /// Baud rate of the serial link
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    rate: u32,

    /// Number of samples to capture
    #[arg(short, long, default_value_t = 4096)]
    depth: u32,

    /// Fraction of samples before the trigger
    #[arg(long, default_value_t = 0.5)]
    ratio: f64,

    /// Trigger when this channel goes high
    #[arg(short, long)]
    trigger_channel: Option<usize>,

    /// Clock the device from its external clock input (rising edge)
    #[arg(long)]
    external_clock: bool,

    /// Enable run length encoding
    #[arg(long)]
    rle: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,

    /// Print this many rows of the trace
    #[arg(long, default_value_t = 16)]
    rows: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let mut builder = CaptureConfiguration::builder()
        .sample_rate(args.rate)
        .sample_depth(args.depth)
        .ratio(args.ratio)
        .rle(args.rle);
    if args.external_clock {
        builder = builder.clock_source(ClockSource::ExternalRising);
    }
    if let Some(channel) = args.trigger_channel {
        let stage = TriggerStage::start_capturing_when()
            .channel(channel, BitState::High)
            .starts_capture();
        builder = builder.trigger_stage(0, stage);
    }
    let config = builder.build()?;

    println!("SUMP Capture");
    println!("============");
    println!("Port: {} @ {}bps", args.port, args.baud);
    println!("Divider: {} ({:?} Hz)", config.divider(), config.sample_rate());
    println!("Depth: {}\n", config.sample_depth());

    let mut device = SumpDevice::serial();
    let outcome = device.capture(&args.port, args.baud, &config, &NullSink, &NullSink)?;

    let trace = match outcome {
        CaptureOutcome::Completed(trace) => trace,
        CaptureOutcome::Cancelled(_) => {
            println!("Capture was cancelled");
            return Ok(());
        }
    };

    println!("Captured {} samples ({} ticks)", trace.len(), trace.absolute_length());
    match trace.trigger_position() {
        Some(position) => println!("Trigger at sample {}", position),
        None => println!("No trigger position"),
    }

    let df = trace.to_dataframe()?;
    println!("{}", df.head(Some(args.rows)));
    Ok(())
}

// Background capture with progress and cancellation
//
// Starts a triggered capture on a background thread, prints progress, and
// cancels it if the trigger has not fired within the given timeout.

use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::time::{Duration, Instant};
use sump_rs::{
    BitState, CaptureConfiguration, CaptureOutcome, CaptureRequest, CaptureTask, SumpDevice,
    TriggerStage,
};

#[derive(Parser)]
#[command(name = "cancel_capture")]
#[command(about = "Triggered capture that gives up after a timeout")]
struct Args {
    /// Serial port of the device
    port: String,

    /// Channel that has to go high to trigger
    #[arg(short, long, default_value_t = 0)]
    channel: usize,

    /// Seconds to wait for the trigger
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::init();

    let stage = TriggerStage::start_capturing_when()
        .channel(args.channel, BitState::High)
        .starts_capture();
    let config = CaptureConfiguration::builder()
        .sample_rate(10_000_000)
        .sample_depth(16 * 1024)
        .trigger_stage(0, stage)
        .build()?;

    let (progress_tx, progress_rx) = bounded::<u8>(128);
    let (sample_tx, _sample_rx) = bounded::<u32>(1);

    let task = CaptureTask::spawn(
        SumpDevice::serial(),
        CaptureRequest::new(args.port.clone(), 115_200, config),
        progress_tx,
        sample_tx,
    )?;

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let mut triggered = false;
    loop {
        match progress_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(percent) => {
                triggered = true;
                print!("\rReading samples: {:3}%", percent);
                if percent == 100 {
                    println!();
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !triggered && Instant::now() >= deadline {
                    println!("No trigger after {}s, cancelling", args.timeout);
                    task.cancel();
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let (_device, result) = task.join();
    match result? {
        CaptureOutcome::Completed(trace) => {
            println!("Captured {} samples, trigger at {:?}", trace.len(), trace.trigger_position());
        }
        CaptureOutcome::Cancelled(_) => println!("Capture cancelled"),
    }
    Ok(())
}

// Basic device detection and metadata example
//
// This example shows how to attach to a SUMP device, check that it speaks the
// supported protocol and print its metadata.

use sump_rs::SumpDevice;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (optional)
    env_logger::init();

    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyACM0".to_string());

    println!("SUMP Device Detection Example");
    println!("=============================\n");

    let mut device = SumpDevice::serial();

    println!("1. Attaching to {}...", port);
    device.attach(&port, 115_200)?;

    println!("2. Detecting device...");
    if let Err(e) = device.detect() {
        device.detach();
        return Err(e.into());
    }
    println!("   Found a SUMP compatible logic analyzer");

    println!("3. Reading metadata...");
    let metadata = device.query_metadata()?;
    print!("{}", metadata);

    if let Some(memory) = metadata.sample_memory() {
        println!("   Sample memory: {} bytes", memory);
    }
    if let Some(probes) = metadata.probe_count() {
        println!("   Probes: {}", probes);
    }

    device.detach();
    println!("\nDetached.");
    Ok(())
}

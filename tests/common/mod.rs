//! In-memory SUMP device answering the commands written to it.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sump_rs::protocol::{CMD_ID, CMD_METADATA, CMD_RUN};
use sump_rs::{LinkError, SumpLink, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open { port: String, baud: u32 },
    Command(u8),
    LongCommand(u8, u32),
    ClearInput,
    Shutdown,
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Answers to successive ID commands; nothing is sent once exhausted.
    pub ids: Vec<u32>,
    pub metadata: Vec<u8>,
    /// Bytes streamed after RUN, most recent sample first.
    pub samples: Vec<u8>,
    /// Sent after one read timeout once `samples` ran dry.
    pub samples_after_stall: Vec<u8>,
    /// Never answer RUN, as if the trigger does not fire.
    pub hold_samples: bool,
    /// After RUN, block reads on an empty stream until the link is closed.
    pub block_when_drained: bool,
    pub fail_open: bool,
}

#[derive(Debug)]
struct Shared {
    script: Script,
    next_id: usize,
    input: VecDeque<u8>,
    stalled: Vec<u8>,
    running: bool,
    events: Vec<Event>,
    closed: bool,
}

#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedTransport {
    pub fn new(script: Script) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                script,
                next_id: 0,
                input: VecDeque::new(),
                stalled: Vec::new(),
                running: false,
                events: Vec::new(),
                closed: false,
            })),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.lock().unwrap().events.clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn long_commands(&self) -> Vec<(u8, u32)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::LongCommand(opcode, data) => Some((opcode, data)),
                _ => None,
            })
            .collect()
    }

    /// Polls until `event` was recorded or `timeout` passed.
    pub fn wait_for(&self, event: &Event, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.count(event) > 0 {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SumpLink>, LinkError> {
        let mut shared = self.shared.lock().unwrap();
        if shared.script.fail_open {
            return Err(LinkError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no such port",
            )));
        }
        shared.closed = false;
        shared.running = false;
        shared.input.clear();
        shared.stalled.clear();
        shared.events.push(Event::Open {
            port: port.to_string(),
            baud,
        });
        Ok(Box::new(ScriptedLink {
            shared: Arc::clone(&self.shared),
            command: Vec::new(),
            shut: false,
        }))
    }

    fn close(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.closed = true;
        shared.events.push(Event::Close);
    }
}

struct ScriptedLink {
    shared: Arc<Mutex<Shared>>,
    command: Vec<u8>,
    shut: bool,
}

impl ScriptedLink {
    fn execute(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        let opcode = self.command[0];
        if self.command.len() == 5 {
            let data = u32::from_le_bytes([
                self.command[1],
                self.command[2],
                self.command[3],
                self.command[4],
            ]);
            shared.events.push(Event::LongCommand(opcode, data));
        } else {
            shared.events.push(Event::Command(opcode));
            match opcode {
                CMD_ID => {
                    let next = shared.next_id;
                    if let Some(id) = shared.script.ids.get(next).copied() {
                        shared.next_id += 1;
                        shared.input.extend(id.to_be_bytes());
                    }
                }
                CMD_METADATA => {
                    let metadata = shared.script.metadata.clone();
                    shared.input.extend(metadata);
                }
                CMD_RUN => {
                    shared.running = true;
                    if !shared.script.hold_samples {
                        let samples = shared.script.samples.clone();
                        shared.input.extend(samples);
                        shared.stalled = shared.script.samples_after_stall.clone();
                    }
                }
                _ => {}
            }
        }
        self.command.clear();
    }
}

impl Read for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut shared = self.shared.lock().unwrap();
                if self.shut || shared.closed {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
                }
                if !shared.input.is_empty() {
                    let n = buf.len().min(shared.input.len());
                    for (slot, byte) in buf.iter_mut().zip(shared.input.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
                if !shared.stalled.is_empty() {
                    let stalled = std::mem::take(&mut shared.stalled);
                    shared.input.extend(stalled);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "stalled"));
                }
                if !(shared.running && shared.script.block_when_drained) {
                    break;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(1));
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Write for ScriptedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.shut {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        for &byte in buf {
            self.command.push(byte);
            // opcodes with the top bit set carry four data bytes
            let expected = if self.command[0] & 0x80 != 0 { 5 } else { 1 };
            if self.command.len() == expected {
                self.execute();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SumpLink for ScriptedLink {
    fn clear_input(&mut self) -> io::Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.input.clear();
        shared.events.push(Event::ClearInput);
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.shut = true;
        self.shared.lock().unwrap().events.push(Event::Shutdown);
        Ok(())
    }
}

/// Metadata stream of a small device: name, 8 probes, 4096 samples of memory.
pub fn small_device_metadata() -> Vec<u8> {
    device_metadata(8)
}

/// Like [`small_device_metadata`] with a different probe count.
pub fn device_metadata(probes: u8) -> Vec<u8> {
    let mut raw = vec![0x01];
    raw.extend_from_slice(b"Test Sniffer");
    raw.push(0x00);
    raw.push(0x21);
    raw.extend(4096u32.to_be_bytes());
    raw.extend([0x40, probes]);
    raw.push(0x00);
    raw
}

//! Framed packet link over a serial port.
//!
//! The device emits one JSON object per packet with no framing beyond the
//! braces, so the reader is delimiter-based: scan to the next `{`, collect
//! through the following `}`. Payload encodings never contain nested braces;
//! frames that still manage to be malformed are skipped with a debug log.

use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::Result;
use crate::port::Port;
use crate::protocol::frame::Packet;

/// Upper bound on a sane frame; longer reads are dropped as line noise.
const MAX_FRAME_LEN: usize = 128;

/// Pause between polls while waiting for a frame.
const POLL_PAUSE: Duration = Duration::from_millis(1);

/// A packet-framed view of a serial port.
pub struct PacketLink<P: Port> {
    port: P,
}

impl<P: Port> PacketLink<P> {
    /// Wrap an open port.
    pub fn new(port: P) -> Self {
        Self { port }
    }

    /// Reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Send one packet. A closed port swallows the write; other write errors
    /// are logged and otherwise ignored, the response timeout deals with them.
    pub fn send(&mut self, pkt: &Packet) {
        if !self.port.is_open() {
            return;
        }
        let text = pkt.encode();
        if let Err(e) = self
            .port
            .write_all(text.as_bytes())
            .and_then(|()| self.port.flush())
        {
            debug!("write failed on {}: {e}", self.port.name());
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        let mut buf = [0u8; 1];
        loop {
            if !self.port.is_open() {
                return None;
            }
            return match self.port.read(&mut buf) {
                Ok(1) => Some(buf[0]),
                Ok(_) => None,
                Err(e) if e.kind() == ErrorKind::TimedOut => None,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read failed on {}: {e}", self.port.name());
                    None
                }
            };
        }
    }

    /// Read one raw JSON frame: consume bytes until a `{`, then through the
    /// matching `}`. Returns `None` on an empty read or a closed port.
    pub fn read_json(&mut self) -> Option<String> {
        loop {
            match self.read_byte()? {
                b'{' => break,
                _ => continue, // discard bytes between frames
            }
        }

        let mut text = String::from("{");
        loop {
            let byte = self.read_byte()?;
            text.push(char::from(byte));
            if byte == b'}' {
                return Some(text);
            }
            if text.len() > MAX_FRAME_LEN {
                debug!("oversized frame dropped: {} bytes", text.len());
                return None;
            }
        }
    }

    /// Retry `read_json` until a frame arrives or `timeout` elapses.
    pub fn wait_for_json(&mut self, timeout: Duration) -> Option<String> {
        let start = Instant::now();
        loop {
            if let Some(text) = self.read_json() {
                return Some(text);
            }
            if start.elapsed() > timeout {
                return None;
            }
            thread::sleep(POLL_PAUSE);
        }
    }

    /// Receive the next well-formed packet within `timeout`. Malformed frames
    /// are skipped and count against the same deadline.
    pub fn recv(&mut self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let text = self.wait_for_json(remaining)?;
            match Packet::decode(&text) {
                Ok(pkt) => return Some(pkt),
                Err(e) => {
                    debug!("frame parse error: {e}");
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
            }
        }
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }

    /// Reopen the underlying port under the same name.
    pub fn reopen(&mut self) -> Result<()> {
        self.port.reopen()
    }
}

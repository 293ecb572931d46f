//! Request/response facade to the camera-side detector board.
//!
//! The board speaks a byte-oriented serial protocol: an invoke command
//! triggers one inference, the reply is a JSON object interleaved with
//! log noise. Frames are recovered by brace-depth scanning so partial
//! reads and junk between frames are tolerated.

use crate::detection::Detection;
use crate::error::{Result, VisionError};
use serde_json::Value;
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Single-inference command understood by the detector firmware.
const INVOKE_COMMAND: &[u8] = b"AT+INVOKE=1,0,0\r";

/// Payload type tag carrying detection boxes.
const PAYLOAD_TYPE_BOXES: i64 = 1;

/// Byte transport under the vision client.
///
/// Production uses a serial port; tests replay canned transcripts.
pub trait SerialLink: Send {
    /// Write the full buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever is available into `buf`, returning the byte count.
    /// A zero return means nothing was available right now.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Drop any pending input.
    fn clear_input(&mut self) -> Result<()>;
}

/// Serial-port transport at the configured baud rate.
pub struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialPortLink {
    /// Open the detector's USB serial port.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(5))
            .open()
            .map_err(|e| VisionError::Serial(format!("{path}: {e}")))?;
        info!(path, baud_rate, "vision serial port open");
        Ok(Self { port })
    }
}

impl SerialLink for SerialPortLink {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        std::io::Write::write_all(&mut self.port, data)
            .map_err(|e| VisionError::Serial(format!("write: {e}")))
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(VisionError::Serial(format!("read: {e}"))),
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| VisionError::Serial(format!("clear: {e}")))
    }
}

/// Something that can run one detector inference.
pub trait VisionSource: Send {
    /// Trigger a single inference and collect the detections, blocking at
    /// most `timeout`.
    fn invoke_once(&mut self, timeout: Duration) -> Result<Vec<Detection>>;
}

/// Client serializing invoke requests over one serial link.
pub struct VisionClient {
    link: Box<dyn SerialLink>,
    frame: Vec<u8>,
    brace_depth: usize,
}

impl VisionClient {
    /// Wrap a transport.
    #[must_use]
    pub fn new(link: Box<dyn SerialLink>) -> Self {
        Self {
            link,
            frame: Vec::new(),
            brace_depth: 0,
        }
    }

    /// Open the default serial transport.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        Ok(Self::new(Box::new(SerialPortLink::open(path, baud_rate)?)))
    }

    fn extract_boxes(&mut self, chunk: &[u8]) -> Option<Vec<Detection>> {
        for byte in chunk {
            match byte {
                b'{' => {
                    if self.brace_depth == 0 {
                        self.frame.clear();
                    }
                    self.brace_depth += 1;
                    self.frame.push(*byte);
                }
                _ if self.brace_depth == 0 => {}
                b'}' => {
                    self.frame.push(*byte);
                    self.brace_depth -= 1;
                    if self.brace_depth == 0 {
                        if let Some(boxes) = parse_frame(&self.frame) {
                            self.frame.clear();
                            return Some(boxes);
                        }
                        self.frame.clear();
                    }
                }
                _ => self.frame.push(*byte),
            }
        }
        None
    }
}

fn parse_frame(frame: &[u8]) -> Option<Vec<Detection>> {
    let value: Value = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "discarding malformed vision frame");
            return None;
        }
    };
    if value.get("type").and_then(Value::as_i64) != Some(PAYLOAD_TYPE_BOXES) {
        return None;
    }
    let boxes = value
        .get("data")
        .and_then(|data| data.get("boxes"))
        .and_then(Value::as_array)?;
    let mut detections = Vec::with_capacity(boxes.len());
    for raw in boxes {
        match Detection::from_payload(raw) {
            Ok(det) => detections.push(det),
            Err(e) => debug!(error = %e, "skipping malformed box"),
        }
    }
    Some(detections)
}

impl VisionSource for VisionClient {
    fn invoke_once(&mut self, timeout: Duration) -> Result<Vec<Detection>> {
        let deadline = Instant::now() + timeout;
        self.frame.clear();
        self.brace_depth = 0;
        self.link.clear_input()?;
        if let Err(e) = self.link.write_all(INVOKE_COMMAND) {
            error!(error = %e, "vision invoke write failed");
            return Err(e);
        }

        let mut buf = [0u8; 512];
        while Instant::now() < deadline {
            let n = self.link.read_available(&mut buf)?;
            if n == 0 {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            if let Some(boxes) = self.extract_boxes(&buf[..n]) {
                return Ok(boxes);
            }
        }
        debug!(?timeout, "vision invoke timed out");
        Err(VisionError::Timeout(timeout))
    }
}

//! Serial transport abstraction.
//!
//! The engine treats a serial port as a raw duplex byte stream; framing,
//! line-splitting and pattern matching are the engine's responsibility.
//! [`LinkFactory`] is the seam: the real implementation opens hardware
//! ports through `tokio-serial` (behind the default `serial` feature), and
//! [`MockFleet`] simulates a whole modem fleet over in-memory duplex pipes
//! so the engine can be driven end-to-end without hardware.
//!
//! The mock lives in normal (non-test) code on purpose: the demo binary and
//! the integration tests both run against it.

use crate::error::{EngineError, EngineResult};
use crate::model::SlotId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A raw duplex byte stream. Both `tokio_serial::SerialStream` and the
/// in-memory mock pipe satisfy this.
pub trait RawLink: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawLink for T {}

/// Opens serial links by device path. Injected into every component that
/// touches a port.
pub trait LinkFactory: Send + Sync {
    fn open(&self, path: &str, baud: u32) -> EngineResult<Box<dyn RawLink>>;
}

// =============================================================================
// Line splitting
// =============================================================================

/// The read side of an opened link, split into a line channel.
///
/// A dedicated reader task owns the read half and yields complete trimmed
/// lines into an unbounded channel; the owning session consumes them from a
/// single dispatch loop. This preserves per-port ordering without sharing
/// mutable callback state across tasks.
pub struct LinkChannels {
    pub lines: mpsc::UnboundedReceiver<String>,
    pub writer: WriteHalf<Box<dyn RawLink>>,
    pub reader_task: JoinHandle<()>,
}

/// Split a link into a write half and a background line reader.
pub fn split_lines(link: Box<dyn RawLink>, path: &str) -> LinkChannels {
    let (read_half, writer) = tokio::io::split(link);
    let (tx, lines) = mpsc::unbounded_channel();
    let path = path.to_string();
    let reader_task = tokio::spawn(read_loop(read_half, tx, path));
    LinkChannels {
        lines,
        writer,
        reader_task,
    }
}

async fn read_loop(
    read_half: ReadHalf<Box<dyn RawLink>>,
    tx: mpsc::UnboundedSender<String>,
    path: String,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(port = %path, "serial link closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if trimmed.is_empty() {
                    continue;
                }
                trace!(port = %path, line = %trimmed, "rx");
                if tx.send(trimmed.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(port = %path, error = %e, "serial read failed");
                break;
            }
        }
    }
}

/// Write one command line, CRLF-terminated.
pub async fn write_command<W>(writer: &mut W, path: &str, command: &str) -> EngineResult<()>
where
    W: AsyncWrite + Unpin,
{
    trace!(port = %path, command = %command, "tx");
    writer
        .write_all(command.as_bytes())
        .await
        .map_err(|e| EngineError::Transport {
            path: path.to_string(),
            message: e.to_string(),
        })?;
    writer
        .write_all(b"\r\n")
        .await
        .map_err(|e| EngineError::Transport {
            path: path.to_string(),
            message: e.to_string(),
        })?;
    writer.flush().await.map_err(|e| EngineError::Transport {
        path: path.to_string(),
        message: e.to_string(),
    })
}

// =============================================================================
// Real hardware factory
// =============================================================================

/// Hardware factory backed by `tokio-serial`.
#[cfg(feature = "serial")]
pub struct TokioSerialFactory;

#[cfg(feature = "serial")]
impl LinkFactory for TokioSerialFactory {
    fn open(&self, path: &str, baud: u32) -> EngineResult<Box<dyn RawLink>> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(path, baud)
            .timeout(Duration::from_secs(2))
            .open_native_async()
            .map_err(|e| EngineError::Transport {
                path: path.to_string(),
                message: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}

// =============================================================================
// Mock fleet
// =============================================================================

/// Append the NMEA checksum and framing to a sentence body,
/// e.g. `GPRMC,110324.00,...` becomes `$GPRMC,110324.00,...*6A`.
pub fn nmea_sentence(body: &str) -> String {
    let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${body}*{checksum:02X}")
}

/// Behavior of one simulated modem slot.
#[derive(Clone, Debug)]
pub struct MockModemProfile {
    pub model: String,
    pub revision: String,
    pub imei: String,
    pub imsi: String,
    pub sim_state: String,
    /// Numeric PLMN returned by `AT+COPS?`.
    pub registered_plmn: String,
    pub answers_calls: bool,
    /// Full `+QENG` response lines, cycled on each serving-cell query.
    pub serving_responses: Vec<String>,
    /// Complete NMEA sentences (with checksum), cycled on the NMEA port
    /// while GPS is enabled. Empty means the candidate never reports a fix.
    pub nmea_sentences: Vec<String>,
    pub nmea_period: Duration,
}

impl MockModemProfile {
    /// A registered, call-capable modem with no GPS coverage.
    pub fn basic(index: usize, plmn: &str) -> Self {
        Self {
            model: "EC25".to_string(),
            revision: "EC25EFAR06A01M4G".to_string(),
            imei: format!("8689810300010{index:02}"),
            imsi: format!("{plmn}00000000{index:02}"),
            sim_state: "READY".to_string(),
            registered_plmn: plmn.to_string(),
            answers_calls: true,
            serving_responses: vec![
                "+QENG: \"servingcell\",\"NOCONN\",\"GSM\",432,11,2F3A,0C81,33,77,-71".to_string(),
            ],
            nmea_sentences: Vec::new(),
            nmea_period: Duration::from_millis(40),
        }
    }

    /// Attach a cycling GPS track to this modem's NMEA port.
    pub fn with_gps_track(mut self, sentences: Vec<String>) -> Self {
        self.nmea_sentences = sentences;
        self
    }
}

struct MockModemState {
    profile: MockModemProfile,
    call_active: AtomicBool,
    gps_enabled: AtomicBool,
    serving_index: AtomicUsize,
    nmea_index: AtomicUsize,
}

/// An in-memory fleet of simulated modems addressed by device path.
///
/// `open` resolves the slot and port kind from the device index (`4k+1` is
/// the NMEA port, `4k+2` the data port), then spawns a device task on the
/// far end of an in-memory duplex pipe.
pub struct MockFleet {
    device_prefix: String,
    slots: HashMap<usize, Arc<MockModemState>>,
}

impl MockFleet {
    pub fn new(device_prefix: impl Into<String>) -> Self {
        Self {
            device_prefix: device_prefix.into(),
            slots: HashMap::new(),
        }
    }

    pub fn add_slot(&mut self, slot: SlotId, profile: MockModemProfile) {
        self.slots.insert(
            slot.0,
            Arc::new(MockModemState {
                profile,
                call_active: AtomicBool::new(false),
                gps_enabled: AtomicBool::new(false),
                serving_index: AtomicUsize::new(0),
                nmea_index: AtomicUsize::new(0),
            }),
        );
    }
}

impl LinkFactory for MockFleet {
    fn open(&self, path: &str, _baud: u32) -> EngineResult<Box<dyn RawLink>> {
        let index: usize = path
            .strip_prefix(&self.device_prefix)
            .and_then(|suffix| suffix.parse().ok())
            .ok_or_else(|| EngineError::Transport {
                path: path.to_string(),
                message: "unknown device path".to_string(),
            })?;

        let slot = SlotId::from_port_index(index);
        let state = self
            .slots
            .get(&slot.0)
            .cloned()
            .ok_or_else(|| EngineError::Transport {
                path: path.to_string(),
                message: format!("no modem behind {slot}"),
            })?;

        let (host, device) = tokio::io::duplex(4096);
        match index % 4 {
            1 => {
                tokio::spawn(run_nmea_port(device, state));
            }
            2 => {
                tokio::spawn(run_data_port(device, state));
            }
            _ => {
                return Err(EngineError::Transport {
                    path: path.to_string(),
                    message: "not an AT or NMEA port".to_string(),
                })
            }
        }
        Ok(Box::new(host))
    }
}

async fn run_data_port(pipe: tokio::io::DuplexStream, state: Arc<MockModemState>) {
    let (read_half, mut write_half) = tokio::io::split(pipe);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        let response = respond(&state, command);
        if write_half.write_all(response.as_bytes()).await.is_err() {
            break;
        }
        let _ = write_half.flush().await;
    }
}

/// Build the full echoed response for one AT command.
fn respond(state: &MockModemState, command: &str) -> String {
    let profile = &state.profile;
    let body: String = match command {
        "ATI" => format!(
            "Quectel\r\n{}\r\nRevision: {}\r\n\r\nOK",
            profile.model, profile.revision
        ),
        "AT+CGSN" => format!("{}\r\n\r\nOK", profile.imei),
        "AT+CIMI" => format!("{}\r\n\r\nOK", profile.imsi),
        "AT+CPIN?" => format!("+CPIN: {}\r\n\r\nOK", profile.sim_state),
        "AT+COPS?" => format!("+COPS: 0,2,\"{}\",7\r\n\r\nOK", profile.registered_plmn),
        "AT+CLCC" => {
            if state.call_active.load(Ordering::SeqCst) {
                "+CLCC: 1,0,0,0,0,\"\",129\r\n\r\nOK".to_string()
            } else {
                "OK".to_string()
            }
        }
        "ATH" => {
            state.call_active.store(false, Ordering::SeqCst);
            "OK".to_string()
        }
        "AT+QGPS=1" => {
            state.gps_enabled.store(true, Ordering::SeqCst);
            "OK".to_string()
        }
        "AT+QGPSEND" => {
            state.gps_enabled.store(false, Ordering::SeqCst);
            "OK".to_string()
        }
        "AT+QENG=\"servingcell\"" => {
            let responses = &profile.serving_responses;
            if responses.is_empty() {
                "OK".to_string()
            } else {
                let index = state.serving_index.fetch_add(1, Ordering::SeqCst);
                format!("{}\r\n\r\nOK", responses[index % responses.len()])
            }
        }
        other if other.starts_with("ATD") => {
            if profile.answers_calls {
                state.call_active.store(true, Ordering::SeqCst);
            }
            "OK".to_string()
        }
        "ATE1" | "AT+CMGD=1,4" | "AT+CFUN=1" | "AT+CGACT=0,1" | "AT+COPS=0" => "OK".to_string(),
        other if other.starts_with("AT+QCFG=\"nwscanmode\"") => "OK".to_string(),
        _ => "ERROR".to_string(),
    };
    // Command echo first, the way a modem with ATE1 answers.
    format!("{command}\r\n{body}\r\n")
}

async fn run_nmea_port(pipe: tokio::io::DuplexStream, state: Arc<MockModemState>) {
    let (_read_half, mut write_half) = tokio::io::split(pipe);
    loop {
        tokio::time::sleep(state.profile.nmea_period).await;
        if !state.gps_enabled.load(Ordering::SeqCst) {
            continue;
        }
        let sentences = &state.profile.nmea_sentences;
        if sentences.is_empty() {
            continue;
        }
        let index = state.nmea_index.fetch_add(1, Ordering::SeqCst);
        let sentence = format!("{}\r\n", sentences[index % sentences.len()]);
        if write_half.write_all(sentence.as_bytes()).await.is_err() {
            break;
        }
        let _ = write_half.flush().await;
    }
}

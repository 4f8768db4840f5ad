//! Core data model for one drive-test run.
//!
//! Everything persisted or published by the engine is defined here:
//!
//! - [`SlotId`]: a modem slot and its derived serial port indices.
//! - [`ModemFacts`]: identity and role bookkeeping for one physical modem.
//! - [`GpsFix`]: one deduplicated location row, keyed by the device clock.
//! - [`MeasurementSample`]: one polled radio measurement, optionally
//!   referencing the nearest-in-time GPS fix.
//! - [`Inspection`]: the root aggregate for one run; owns every other row.
//!
//! Radio parameters on samples stay untyped strings: "no
//! coverage" rows exist and carry the [`NO_COVERAGE_PLACEHOLDER`] marker in
//! every technology field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Marker value stored in every technology field of a no-coverage sample.
pub const NO_COVERAGE_PLACEHOLDER: &str = "-";

/// Width of the nearest-fix correlation window on each side of a sample's
/// creation time.
pub const FIX_WINDOW_SECS: i64 = 2;

// =============================================================================
// Ports and slots
// =============================================================================

/// One modem slot. Each physical modem enumerates as a fixed interface of
/// four serial devices; the slot index addresses the whole interface and the
/// diagnostic/data and NMEA ports are derived from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl SlotId {
    /// Serial device index of the AT command/data port for this slot.
    pub fn data_port_index(self) -> usize {
        self.0 * 4 + 2
    }

    /// Serial device index of the paired NMEA port for this slot.
    pub fn nmea_port_index(self) -> usize {
        self.0 * 4 + 1
    }

    /// Filesystem path of the data port, e.g. `/dev/ttyUSB6` for slot 1.
    pub fn data_path(self, device_prefix: &str) -> String {
        format!("{}{}", device_prefix, self.data_port_index())
    }

    /// Filesystem path of the NMEA port.
    pub fn nmea_path(self, device_prefix: &str) -> String {
        format!("{}{}", device_prefix, self.nmea_port_index())
    }

    /// Recover the owning slot from any serial device index within its
    /// interface of four.
    pub fn from_port_index(index: usize) -> SlotId {
        SlotId(index / 4)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

// =============================================================================
// Technologies, roles, call status
// =============================================================================

/// Radio access technology polled by a measurement loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Technology {
    Gsm,
    Wcdma,
    Lte,
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Technology::Gsm => write!(f, "GSM"),
            Technology::Wcdma => write!(f, "WCDMA"),
            Technology::Lte => write!(f, "LTE"),
        }
    }
}

/// The measurement duty assigned to one modem by the scenario dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    GsmIdle,
    WcdmaIdle,
    LteIdle,
    GsmLongCall,
    WcdmaLongCall,
    FtpThroughput,
}

impl Role {
    /// Fixed priority order used by the dispatcher after the GSM-idle slot
    /// is placed. Re-running assignment with the same inputs must produce
    /// the same mapping, so this order is part of the contract.
    pub const PRIORITY: [Role; 6] = [
        Role::GsmIdle,
        Role::WcdmaIdle,
        Role::LteIdle,
        Role::GsmLongCall,
        Role::WcdmaLongCall,
        Role::FtpThroughput,
    ];

    /// Technology polled by this role, if it drives a measurement loop.
    pub fn technology(self) -> Option<Technology> {
        match self {
            Role::GsmIdle | Role::GsmLongCall => Some(Technology::Gsm),
            Role::WcdmaIdle | Role::WcdmaLongCall => Some(Technology::Wcdma),
            Role::LteIdle => Some(Technology::Lte),
            Role::FtpThroughput => None,
        }
    }

    pub fn is_long_call(self) -> bool {
        matches!(self, Role::GsmLongCall | Role::WcdmaLongCall)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::GsmIdle => "gsm-idle",
            Role::WcdmaIdle => "wcdma-idle",
            Role::LteIdle => "lte-idle",
            Role::GsmLongCall => "gsm-long-call",
            Role::WcdmaLongCall => "wcdma-long-call",
            Role::FtpThroughput => "ftp-throughput",
        };
        write!(f, "{name}")
    }
}

/// Call state stamped onto long-call samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    Idle,
    Dedicated,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Idle => write!(f, "idle"),
            CallStatus::Dedicated => write!(f, "dedicated"),
        }
    }
}

// =============================================================================
// Persisted entities
// =============================================================================

/// Identity and capability facts for one physical modem.
///
/// Created/updated by device discovery (one row per unique IMEI per
/// inspection), updated thereafter by the measurement loops (role, lock
/// mode) and the GPS arbiter (GPS-active flag).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModemFacts {
    pub slot: SlotId,
    pub imei: String,
    pub model: Option<String>,
    pub revision: Option<String>,
    pub imsi: Option<String>,
    pub sim_state: Option<String>,
    pub lock_mode: Option<String>,
    pub role: Option<Role>,
    pub call_capable: bool,
    pub gps_active: bool,
}

impl ModemFacts {
    pub fn new(slot: SlotId, imei: impl Into<String>) -> Self {
        Self {
            slot,
            imei: imei.into(),
            model: None,
            revision: None,
            imsi: None,
            sim_state: None,
            lock_mode: None,
            role: None,
            call_capable: false,
            gps_active: false,
        }
    }

    /// Field-wise merge of a later discovery pass into an existing row.
    /// `Some` fields win; `None` never clears a previously captured value.
    /// This is what makes discovery retries safe for modems that answer
    /// late.
    pub fn merge_from(&mut self, newer: &ModemFacts) {
        self.slot = newer.slot;
        if newer.model.is_some() {
            self.model = newer.model.clone();
        }
        if newer.revision.is_some() {
            self.revision = newer.revision.clone();
        }
        if newer.imsi.is_some() {
            self.imsi = newer.imsi.clone();
        }
        if newer.sim_state.is_some() {
            self.sim_state = newer.sim_state.clone();
        }
        if newer.lock_mode.is_some() {
            self.lock_mode = newer.lock_mode.clone();
        }
        if newer.role.is_some() {
            self.role = newer.role;
        }
        self.call_capable |= newer.call_capable;
        self.gps_active |= newer.gps_active;
    }
}

/// One GPS fix. The device clock string is the natural dedup key; the
/// receive timestamp is what samples correlate against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    /// Device-clock key, `ddmmyy hhmmss.ss` as reported in the sentence.
    pub device_time: String,
    /// Wall-clock arrival time, used for nearest-fix correlation.
    pub received_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed_knots: Option<f64>,
}

impl GpsFix {
    /// True when only the arrival timestamp differs; the upsert skips the
    /// write in that case.
    pub fn same_values(&self, other: &GpsFix) -> bool {
        self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.altitude == other.altitude
            && self.speed_knots == other.speed_knots
    }
}

/// One polled radio measurement row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeasurementSample {
    pub id: Uuid,
    pub inspection: Uuid,
    pub technology: Technology,
    pub operator: String,
    pub role: Role,
    /// Technology-specific parameters, kept as raw captured strings.
    pub fields: BTreeMap<String, String>,
    /// Device-time key of the nearest fix within the window, if any.
    pub fix_ref: Option<String>,
    /// Present on long-call rows only.
    pub call_status: Option<CallStatus>,
    pub created_at: DateTime<Utc>,
}

impl MeasurementSample {
    /// A placeholder row recorded when the modem reports no serving cell,
    /// preserving the measurement cadence for later analysis.
    pub fn no_coverage(
        inspection: Uuid,
        technology: Technology,
        operator: impl Into<String>,
        role: Role,
        field_names: &[String],
        created_at: DateTime<Utc>,
    ) -> Self {
        let fields = field_names
            .iter()
            .map(|name| (name.clone(), NO_COVERAGE_PLACEHOLDER.to_string()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            inspection,
            technology,
            operator: operator.into(),
            role,
            fields,
            fix_ref: None,
            call_status: None,
            created_at,
        }
    }

    pub fn is_no_coverage(&self) -> bool {
        !self.fields.is_empty()
            && self
                .fields
                .values()
                .all(|value| value == NO_COVERAGE_PLACEHOLDER)
    }
}

/// Root aggregate for one drive-test run. Immutable after creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Inspection {
    pub id: Uuid,
    pub kind: String,
    pub code: String,
    pub expert: String,
    pub created_at: DateTime<Utc>,
}

impl Inspection {
    pub fn new(kind: impl Into<String>, code: impl Into<String>, expert: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            code: code.into(),
            expert: expert.into(),
            created_at: Utc::now(),
        }
    }
}

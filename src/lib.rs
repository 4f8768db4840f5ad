//! # Drive-Test Engine Library
//!
//! Core library of the `drivetest` application: orchestration of a fleet of
//! cellular test modems on serial lines, from port discovery through GPS
//! arbitration to continuous radio measurement collection.
//!
//! ## Crate Structure
//!
//! - **`barrier`**: Progress barriers that gate initialization on every
//!   port reaching 100 % readiness.
//! - **`config`**: TOML + environment configuration via `figment`. See
//!   `config::Settings`.
//! - **`context`**: The per-session shared state (`SessionContext`):
//!   recording gate, timer registry and shutdown signal.
//! - **`discovery`**: The per-port bring-up battery that identifies and
//!   prepares every modem in the fleet.
//! - **`error`**: The central `EngineError` enum.
//! - **`gps`**: NMEA parsing, GPS candidate arbitration and fix
//!   persistence.
//! - **`lifecycle`**: The `EngineController` state machine driving
//!   init/start/pause/resume/stop.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`matcher`**: Named, ordered response-pattern sets over AT output.
//! - **`measurement`**: The generic per-technology measurement loop and
//!   its GSM/WCDMA/LTE descriptors.
//! - **`model`**: Persisted entities: slots, modems, fixes, samples,
//!   inspections.
//! - **`publish`**: Fire-and-forget event broadcasting to external viewers.
//! - **`scenario`**: Role assignment across the two operator groups.
//! - **`session`**: The per-port AT command session and its command flags.
//! - **`store`**: The persistence seam (`Store`) and the in-memory
//!   reference implementation.
//! - **`transport`**: The serial seam (`LinkFactory`), line splitting, the
//!   real `tokio-serial` factory and the in-memory mock fleet.

pub mod barrier;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod gps;
pub mod lifecycle;
pub mod logging;
pub mod matcher;
pub mod measurement;
pub mod model;
pub mod publish;
pub mod scenario;
pub mod session;
pub mod store;
pub mod transport;

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! # gsmctl
//!
//! SMS/USSD gateway server for GSM modems: an authenticated HTTP API in
//! front of a serial AT-command engine.
//!
//! The engine handles the messy half of the job — port discovery, the
//! half-duplex AT request/response protocol, text-mode SMS, USSD encoding
//! negotiation, and the health/reconnect loop — and keeps working through
//! flaky USB modems, ambiguous vendor replies, and carriers that answer in
//! three different text encodings.
//!
//! ## API surface
//!
//! | Method | Path                     | Auth | Description                         |
//! |--------|--------------------------|------|-------------------------------------|
//! | GET    | `/api/health`            | No   | Liveness probe + modem summary      |
//! | GET    | `/api/modem`             | Yes  | Full modem status                   |
//! | POST   | `/api/modem/reconnect`   | Yes  | Rediscover and reconnect            |
//! | POST   | `/api/sms`               | Yes  | Send a text message                 |
//! | GET    | `/api/sms/inbox`         | Yes  | Read SIM storage (`?delete=true`)   |
//! | GET    | `/api/sms/recent`        | Yes  | Recent inbound messages (poller)    |
//! | POST   | `/api/ussd`              | Yes  | Execute a USSD exchange             |
//! | POST   | `/api/ussd/reply`        | Yes  | Continue an active USSD session     |
//! | DELETE | `/api/ussd`              | Yes  | Cancel the active USSD session      |
//! | GET    | `/api/ussd/support`      | Yes  | Whether CUSD is advertised          |
//! | GET    | `/api/ports`             | Yes  | Enumerate serial devices            |
//! | GET    | `/api/ports/diagnostics` | Yes  | Probe sweep, one row per device     |
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, clap CLI, router setup, background loops
//! config.rs     — TOML + env-var configuration
//! auth.rs       — Bearer token middleware, constant-time comparison
//! error.rs      — ModemError taxonomy
//! textcodec.rs  — hex payload decoding (UTF-8 → Latin-1 → UTF-16BE)
//! patterns.rs   — every wire response shape, in one table
//! probe.rs      — single-port AT/ATI handshake probe
//! discover.rs   — port enumeration, ranking, winner + full probe report
//! session.rs    — AtSession: the send/expect and send/collect primitives
//! modem.rs      — lifecycle (connect/init/PIN), I/O thread, Modem handle
//! sms.rs        — prompt-wait send, CMGL parse, delete-after-read
//! ussd.rs       — encoding negotiation, reply shapes, payload decoding
//! alert.rs      — webhook failure notifier (fire-and-forget)
//! state.rs      — AppState, inbound ring buffer, counters
//! routes/       — thin HTTP handlers over the Modem handle
//! ```

pub mod alert;
pub mod auth;
pub mod config;
pub mod discover;
pub mod error;
pub mod modem;
pub mod patterns;
pub mod probe;
pub mod routes;
pub mod session;
pub mod sms;
pub mod state;
pub mod textcodec;
pub mod ussd;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::ModemError;
pub use modem::Modem;
pub use state::AppState;

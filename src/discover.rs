//! Serial port discovery and ranking.
//!
//! One pass enumerates every serial device the OS knows about, ranks the
//! candidates (configured preferred ports first, then devices whose USB
//! description smells like a modem), and probes them in order until one
//! answers. The full per-port probe record is always returned alongside the
//! winner — it is the diagnostic artifact operators export when nothing
//! works.
//!
//! "No modem found" is an expected outcome here, not an error; callers
//! decide whether to alert.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ModemConfig;
use crate::probe::{self, ProbeResult, SerialEndpoint};

/// Substrings (case-insensitive) that mark a USB description as modem-like.
const MODEM_KEYWORDS: &[&str] = &[
    "modem", "gsm", "wwan", "qualcomm", "huawei", "zte", "simcom", "quectel", "wavecom",
];

/// Delay between repeat probes of the same port.
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(1000);

/// One enumerated serial device.
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    pub path: String,
    pub description: String,
}

/// Everything one discovery pass learned.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    /// First functional endpoint, if any.
    pub winner: Option<SerialEndpoint>,
    /// Every probe performed, in the order performed.
    pub probes: Vec<ProbeResult>,
}

/// Enumerate serial devices visible to the OS.
pub fn list_ports() -> Vec<PortInfo> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| PortInfo {
                path: p.port_name,
                description: describe(&p.port_type),
            })
            .collect(),
        Err(e) => {
            warn!("serial enumeration failed: {e}");
            Vec::new()
        }
    }
}

fn describe(port_type: &serialport::SerialPortType) -> String {
    match port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            let product = usb.product.as_deref().unwrap_or("");
            let manufacturer = usb.manufacturer.as_deref().unwrap_or("");
            let text = format!("{manufacturer} {product}").trim().to_string();
            if text.is_empty() {
                format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
            } else {
                text
            }
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI serial".to_string(),
        serialport::SerialPortType::Unknown => String::new(),
    }
}

/// Find a working modem.
///
/// Non-exhaustive mode stops at the first functional port; exhaustive mode
/// probes every enumerated device regardless (the diagnostics export). The
/// winner is always a port the prober classified functional.
pub fn discover(cfg: &ModemConfig, exhaustive: bool) -> DiscoveryReport {
    let ports = list_ports();
    info!(
        "scanning {} serial port(s) for a GSM modem ({} preferred)",
        ports.len(),
        cfg.preferred_ports.len()
    );

    let candidates = rank_candidates(&ports, &cfg.preferred_ports, exhaustive);
    let mut probes = Vec::with_capacity(candidates.len());
    let mut winner = None;

    for candidate in candidates {
        let endpoint = cfg.endpoint(&candidate.path);
        let mut result = probe_with_retries(&endpoint, cfg.probe_attempts);
        result.description = candidate.description.clone();

        let functional = result.is_functional();
        probes.push(result);

        if functional && winner.is_none() {
            info!("modem found on {} ({})", candidate.path, candidate.description);
            winner = Some(endpoint);
            if !exhaustive {
                break;
            }
        }
    }

    if winner.is_none() {
        warn!("no GSM modem found across {} probed port(s)", probes.len());
    }

    DiscoveryReport { winner, probes }
}

/// Order candidates: preferred ports first (in configured order, when
/// present on the system), then keyword-matched descriptions in enumeration
/// order. Exhaustive mode appends everything else too.
fn rank_candidates(ports: &[PortInfo], preferred: &[String], exhaustive: bool) -> Vec<PortInfo> {
    let mut ranked: Vec<PortInfo> = Vec::with_capacity(ports.len());

    for want in preferred {
        if let Some(found) = ports.iter().find(|p| &p.path == want) {
            ranked.push(found.clone());
        }
    }

    for port in ports {
        if ranked.iter().any(|r| r.path == port.path) {
            continue;
        }
        if exhaustive || matches_keywords(&port.description) {
            ranked.push(port.clone());
        }
    }

    ranked
}

fn matches_keywords(description: &str) -> bool {
    let lowered = description.to_lowercase();
    MODEM_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Probe one endpoint up to `attempts` times with a short delay between.
/// Modems fresh off enumeration sometimes swallow the first handshake.
fn probe_with_retries(endpoint: &SerialEndpoint, attempts: u32) -> ProbeResult {
    let attempts = attempts.max(1);
    let mut result = probe::probe(endpoint);
    for attempt in 2..=attempts {
        if result.is_functional() {
            break;
        }
        debug!(
            "retrying {} (attempt {attempt}/{attempts}): {:?}",
            endpoint.path, result.status
        );
        std::thread::sleep(RETRY_DELAY);
        result = probe::probe(endpoint);
    }
    result
}

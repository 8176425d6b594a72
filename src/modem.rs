//! Modem lifecycle: connect, initialize, and own the serial session.
//!
//! One dedicated `std::thread` owns the connected modem for its entire
//! lifetime. Callers hold a cloneable [`Modem`] handle and send whole logical
//! operations through an `mpsc` channel, getting results back over `oneshot`
//! — no mutex, no shared handle. An SMS send's prompt → payload → confirm
//! sequence or a USSD encoding negotiation runs start to finish before the
//! next request is picked up, so response bytes can never be misattributed
//! between callers.
//!
//! The same serialization covers reconnection: a reconnect request tears the
//! link down and rediscovers on the I/O thread, where no other operation can
//! be in flight.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::alert::Alerter;
use crate::config::ModemConfig;
use crate::discover;
use crate::error::ModemError;
use crate::patterns;
use crate::probe::{self, ProbeResult, ProbeStatus, SerialEndpoint};
use crate::session::AtSession;
use crate::sms::{self, InboundMessage, SmsReceipt};
use crate::ussd::{self, UssdExchange};

/// Settle time after opening the port before the first handshake.
const OPEN_SETTLE: Duration = Duration::from_secs(1);
/// Connect-time `AT` handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Periodic health-check `AT` handshake — short so a dead modem is cheap.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
/// SIM PIN status query and submission.
const PIN_TIMEOUT: Duration = Duration::from_secs(5);
/// How many times to submit the configured PIN before giving up. The SIM
/// blocks itself after three wrong entries, so stay well under.
const PIN_ATTEMPTS: u32 = 2;

/// New-message notification variants, tried in order until one is accepted.
/// Total failure is tolerated — the inbox poller does not depend on
/// unsolicited notifications.
const CNMI_CANDIDATES: &[&str] = &[
    "AT+CNMI=2,1,0,0,0",
    "AT+CNMI=1,1,0,0,0",
    "AT+CNMI=2,0,0,0,0",
    "AT+CNMI=0,0,0,0,0",
];

/// Snapshot of what the engine knows about the connected modem.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModemStatus {
    pub connected: bool,
    /// Serial device path of the live link.
    pub port: Option<String>,
    /// Registered operator name (`AT+COPS?`).
    pub operator: Option<String>,
    /// Signal quality as a percentage, 0 when the modem reports unknown.
    pub signal_percent: Option<u8>,
    /// SMS service-center address in use.
    pub smsc: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub imei: Option<String>,
}

/// The connected link: session plus cached status. Lives on the I/O thread.
struct ModemLink {
    session: AtSession,
    endpoint: SerialEndpoint,
    status: ModemStatus,
}

impl std::fmt::Debug for ModemLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModemLink")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status)
            .finish()
    }
}

impl ModemLink {
    /// Open the endpoint and run the full initialization sequence.
    fn connect(cfg: &ModemConfig, endpoint: SerialEndpoint) -> Result<Self, ModemError> {
        let session = AtSession::open(&endpoint)?;
        std::thread::sleep(OPEN_SETTLE);
        Self::initialize(session, cfg, endpoint)
    }

    /// Handshake, mandatory init, optional init, PIN check, identity and
    /// SMSC queries. Split from [`ModemLink::connect`] so tests can drive it
    /// over a scripted transport.
    fn initialize(
        mut session: AtSession,
        cfg: &ModemConfig,
        endpoint: SerialEndpoint,
    ) -> Result<Self, ModemError> {
        let timeout = cfg.command_timeout();

        if !session.send_expect("AT", HANDSHAKE_TIMEOUT) {
            return Err(ModemError::HandshakeTimeout(endpoint.path.clone()));
        }

        // Mandatory: no echo (response parsing relies on it), text-mode SMS.
        for command in ["ATE0", "AT+CMGF=1"] {
            if !session.send_expect(command, timeout) {
                return Err(ModemError::InitFailed(format!("{command} rejected")));
            }
        }

        // Optional: verbose error codes, GSM character set, SIM storage.
        for command in ["AT+CMEE=1", "AT+CSCS=\"GSM\"", "AT+CPMS=\"SM\",\"SM\",\"SM\""] {
            if !session.send_expect(command, timeout) {
                debug!("optional init {command} not accepted, continuing");
            }
        }
        let accepted = CNMI_CANDIDATES
            .iter()
            .find(|candidate| session.send_expect(candidate, timeout));
        match accepted {
            Some(candidate) => debug!("message notifications via {candidate}"),
            None => warn!("no CNMI variant accepted; relying on inbox polling only"),
        }

        verify_pin(&mut session, cfg.sim_pin.as_deref())?;

        let mut status = ModemStatus {
            connected: true,
            port: Some(endpoint.path.clone()),
            ..ModemStatus::default()
        };
        read_identity(&mut session, timeout, &mut status);
        status.smsc = resolve_smsc(&mut session, cfg, timeout);

        let mut link = Self {
            session,
            endpoint,
            status,
        };
        link.refresh_signal(timeout);

        info!(
            "modem connected on {} ({} {}, operator {:?}, signal {:?}%)",
            link.endpoint.path,
            link.status.manufacturer.as_deref().unwrap_or("?"),
            link.status.model.as_deref().unwrap_or("?"),
            link.status.operator,
            link.status.signal_percent,
        );
        Ok(link)
    }

    /// Re-query signal quality and operator. Best effort — stale values are
    /// kept when the modem doesn't answer.
    fn refresh_signal(&mut self, timeout: Duration) {
        let csq = self.session.send_collect("AT+CSQ", timeout);
        if let Some(percent) = parse_signal_percent(&csq) {
            self.status.signal_percent = Some(percent);
        }
        let cops = self.session.send_collect("AT+COPS?", timeout);
        if let Some(caps) = patterns::COPS_OPERATOR.captures(&cops) {
            self.status.operator = Some(caps[1].to_string());
        }
    }

    /// Short-timeout liveness handshake.
    fn health_check(&mut self) -> bool {
        self.session.send_expect("AT", HEALTH_TIMEOUT)
    }
}

/// Check SIM PIN state and submit the configured PIN, at most
/// [`PIN_ATTEMPTS`] times.
fn verify_pin(session: &mut AtSession, pin: Option<&str>) -> Result<(), ModemError> {
    for attempt in 0..=PIN_ATTEMPTS {
        let reply = session.send_collect("AT+CPIN?", PIN_TIMEOUT);
        if reply.contains("READY") {
            if attempt > 0 {
                info!("SIM unlocked after PIN submission");
            }
            return Ok(());
        }
        if reply.contains("SIM PIN") {
            let Some(pin) = pin else {
                return Err(ModemError::InitFailed(
                    "SIM requires a PIN but none is configured".to_string(),
                ));
            };
            if attempt >= PIN_ATTEMPTS {
                break;
            }
            info!("SIM requests PIN, submitting (attempt {})", attempt + 1);
            session.send_expect(&format!("AT+CPIN=\"{pin}\""), PIN_TIMEOUT);
            // The SIM takes a moment to settle after a PIN submission.
            std::thread::sleep(Duration::from_millis(500));
            continue;
        }
        return Err(ModemError::InitFailed(format!(
            "unexpected SIM state: {}",
            reply.trim()
        )));
    }
    Err(ModemError::InitFailed(format!(
        "SIM still locked after {PIN_ATTEMPTS} PIN attempt(s)"
    )))
}

/// Best-effort manufacturer/model/firmware/IMEI queries. Failures here are
/// logged by omission — the fields stay `None`.
fn read_identity(session: &mut AtSession, timeout: Duration, status: &mut ModemStatus) {
    status.manufacturer = query_info(session, "AT+CGMI", timeout);
    status.model = query_info(session, "AT+CGMM", timeout);
    status.firmware = query_info(session, "AT+CGMR", timeout);
    status.imei = query_info(session, "AT+CGSN", timeout);
}

fn query_info(session: &mut AtSession, command: &str, timeout: Duration) -> Option<String> {
    parse_info_line(&session.send_collect(command, timeout))
}

/// Set the configured SMSC, or read the SIM's. Either path is best effort.
fn resolve_smsc(
    session: &mut AtSession,
    cfg: &ModemConfig,
    timeout: Duration,
) -> Option<String> {
    if let Some(smsc) = &cfg.smsc {
        if !session.send_expect(&format!("AT+CSCA=\"{smsc}\""), timeout) {
            warn!("modem did not accept configured SMSC {smsc}");
        }
        return Some(smsc.clone());
    }
    let reply = session.send_collect("AT+CSCA?", timeout);
    patterns::CSCA_ADDR
        .captures(&reply)
        .map(|caps| caps[1].to_string())
}

/// First substantive line of an information response (the modem answers
/// `AT+CGMM` with e.g. `EC25` on its own line, then `OK`).
fn parse_info_line(raw: &str) -> Option<String> {
    raw.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && *line != "OK" && !line.contains("ERROR"))
        .map(ToString::to_string)
}

/// `+CSQ: <rssi>,<ber>` → percentage. The RSSI index runs 0–31; 99 means
/// the modem can't tell, reported as 0 so operators see "no signal".
fn parse_signal_percent(raw: &str) -> Option<u8> {
    let rssi: u32 = patterns::CSQ_RSSI.captures(raw)?.get(1)?.as_str().parse().ok()?;
    if rssi == 99 {
        return Some(0);
    }
    Some((rssi.min(31) * 100 / 31) as u8)
}

/// One queued logical operation.
enum Request {
    Status {
        reply: oneshot::Sender<ModemStatus>,
    },
    SendSms {
        to: String,
        body: String,
        reply: oneshot::Sender<Result<SmsReceipt, ModemError>>,
    },
    ReadInbox {
        delete: bool,
        reply: oneshot::Sender<Result<Vec<InboundMessage>, ModemError>>,
    },
    ExecuteUssd {
        code: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<UssdExchange, ModemError>>,
    },
    ContinueUssd {
        text: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<UssdExchange, ModemError>>,
    },
    CancelUssd {
        reply: oneshot::Sender<Result<bool, ModemError>>,
    },
    UssdSupported {
        reply: oneshot::Sender<Result<bool, ModemError>>,
    },
    HealthCheck {
        reply: oneshot::Sender<bool>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<ModemStatus, ModemError>>,
    },
    Diagnostics {
        reply: oneshot::Sender<Vec<ProbeResult>>,
    },
}

/// Cloneable handle to the modem I/O thread. All methods queue one logical
/// operation and await its result; the thread executes them one at a time.
#[derive(Clone)]
pub struct Modem {
    tx: mpsc::Sender<Request>,
}

impl Modem {
    /// Spawn the I/O thread and attempt the initial connect (discovery when
    /// no fixed port is configured). A failed initial connect leaves the
    /// handle in the not-connected state; the health loop retries.
    pub fn spawn(cfg: ModemConfig, alerter: Alerter) -> Self {
        let (tx, rx) = mpsc::channel::<Request>(32);
        std::thread::Builder::new()
            .name("modem-io".to_string())
            .spawn(move || {
                let link = match establish(&cfg, &alerter) {
                    Ok(link) => Some(link),
                    Err(e) => {
                        warn!("initial modem connect failed: {e}");
                        None
                    }
                };
                worker(&cfg, &alerter, rx, link);
            })
            .expect("spawn modem I/O thread");
        Self { tx }
    }

    /// Spawn the worker around an already-initialized link, skipping
    /// discovery. Lets tests drive the full request path over a scripted
    /// transport.
    #[cfg(test)]
    pub(crate) fn spawn_for_tests(cfg: ModemConfig, link: ModemLink) -> Self {
        let (tx, rx) = mpsc::channel::<Request>(32);
        std::thread::Builder::new()
            .name("modem-io-test".to_string())
            .spawn(move || worker(&cfg, &Alerter::disabled(), rx, Some(link)))
            .expect("spawn modem I/O thread");
        Self { tx }
    }

    pub async fn status(&self) -> ModemStatus {
        self.request(|reply| Request::Status { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn send_sms(&self, to: &str, body: &str) -> Result<SmsReceipt, ModemError> {
        self.request(|reply| Request::SendSms {
            to: to.to_string(),
            body: body.to_string(),
            reply,
        })
        .await
        .unwrap_or(Err(ModemError::NotConnected))
    }

    pub async fn read_inbox(&self, delete: bool) -> Result<Vec<InboundMessage>, ModemError> {
        self.request(|reply| Request::ReadInbox { delete, reply })
            .await
            .unwrap_or(Err(ModemError::NotConnected))
    }

    pub async fn execute_ussd(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<UssdExchange, ModemError> {
        self.request(|reply| Request::ExecuteUssd {
            code: code.to_string(),
            timeout,
            reply,
        })
        .await
        .unwrap_or(Err(ModemError::NotConnected))
    }

    /// Reply within an active USSD session (the menu choice after an
    /// exchange whose status was "further action expected").
    pub async fn continue_ussd(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<UssdExchange, ModemError> {
        self.request(|reply| Request::ContinueUssd {
            text: text.to_string(),
            timeout,
            reply,
        })
        .await
        .unwrap_or(Err(ModemError::NotConnected))
    }

    pub async fn cancel_ussd(&self) -> Result<bool, ModemError> {
        self.request(|reply| Request::CancelUssd { reply })
            .await
            .unwrap_or(Err(ModemError::NotConnected))
    }

    pub async fn ussd_supported(&self) -> Result<bool, ModemError> {
        self.request(|reply| Request::UssdSupported { reply })
            .await
            .unwrap_or(Err(ModemError::NotConnected))
    }

    /// Liveness handshake. `false` when the modem is silent or no link is up.
    pub async fn health_check(&self) -> bool {
        self.request(|reply| Request::HealthCheck { reply })
            .await
            .unwrap_or(false)
    }

    /// Tear down the current link, rediscover, and connect again. The new
    /// endpoint may differ from the old one — USB re-enumeration moves
    /// device paths around.
    pub async fn reconnect(&self) -> Result<ModemStatus, ModemError> {
        self.request(|reply| Request::Reconnect { reply })
            .await
            .unwrap_or(Err(ModemError::NotConnected))
    }

    /// Probe every enumerated port and report the results. The live link's
    /// port is health-checked in place rather than reopened.
    pub async fn diagnostics(&self) -> Vec<ProbeResult> {
        self.request(|reply| Request::Diagnostics { reply })
            .await
            .unwrap_or_default()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(build(reply_tx)).await.is_err() {
            warn!("modem I/O thread gone");
            return None;
        }
        reply_rx.await.ok()
    }
}

/// Find and connect a modem: the fixed port when configured, discovery
/// otherwise. Exhaustion of every candidate fires the alert side-channel
/// with the per-port probe detail.
fn establish(cfg: &ModemConfig, alerter: &Alerter) -> Result<ModemLink, ModemError> {
    if let Some(path) = cfg.fixed_port() {
        return ModemLink::connect(cfg, cfg.endpoint(path)).map_err(|e| {
            alerter.notify(format!("modem connect failed on fixed port {path}: {e}"));
            e
        });
    }

    let report = discover::discover(cfg, false);
    let Some(endpoint) = report.winner else {
        alerter.notify(format!(
            "no GSM modem found; probed: {}",
            summarize_probes(&report.probes)
        ));
        return Err(ModemError::DeviceNotFound);
    };

    ModemLink::connect(cfg, endpoint).map_err(|e| {
        alerter.notify(format!("modem found but connect failed: {e}"));
        e
    })
}

fn summarize_probes(probes: &[ProbeResult]) -> String {
    if probes.is_empty() {
        return "no serial ports enumerated".to_string();
    }
    probes
        .iter()
        .map(|p| {
            let detail = p.error.as_deref().unwrap_or("");
            format!("{} {:?} {detail}", p.endpoint.path, p.status)
                .trim_end()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// The I/O thread: one request at a time, in arrival order.
fn worker(
    cfg: &ModemConfig,
    alerter: &Alerter,
    mut rx: mpsc::Receiver<Request>,
    mut link: Option<ModemLink>,
) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Status { reply } => {
                let status = match link.as_mut() {
                    Some(link) => {
                        link.refresh_signal(cfg.command_timeout());
                        link.status.clone()
                    }
                    None => ModemStatus::default(),
                };
                let _ = reply.send(status);
            }
            Request::SendSms { to, body, reply } => {
                let result = match link.as_mut() {
                    Some(link) => sms::send(&mut link.session, &cfg.country_prefix, &to, &body),
                    None => Err(ModemError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Request::ReadInbox { delete, reply } => {
                let result = match link.as_mut() {
                    Some(link) => Ok(sms::read_all(&mut link.session, delete)),
                    None => Err(ModemError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Request::ExecuteUssd {
                code,
                timeout,
                reply,
            } => {
                let result = match link.as_mut() {
                    Some(link) => ussd::execute(&mut link.session, &code, timeout),
                    None => Err(ModemError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Request::ContinueUssd {
                text,
                timeout,
                reply,
            } => {
                let result = match link.as_mut() {
                    Some(link) => ussd::continue_session(&mut link.session, &text, timeout),
                    None => Err(ModemError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Request::CancelUssd { reply } => {
                let result = match link.as_mut() {
                    Some(link) => Ok(ussd::cancel(&mut link.session)),
                    None => Err(ModemError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Request::UssdSupported { reply } => {
                let result = match link.as_mut() {
                    Some(link) => Ok(ussd::supported(&mut link.session)),
                    None => Err(ModemError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Request::HealthCheck { reply } => {
                let alive = link.as_mut().is_some_and(ModemLink::health_check);
                let _ = reply.send(alive);
            }
            Request::Reconnect { reply } => {
                // Dropping the link closes the old handle before rediscovery.
                if let Some(old) = link.take() {
                    info!("closing modem link on {} for reconnect", old.endpoint.path);
                }
                let result = establish(cfg, alerter);
                let status = match result {
                    Ok(new_link) => {
                        let status = new_link.status.clone();
                        link = Some(new_link);
                        Ok(status)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(status);
            }
            Request::Diagnostics { reply } => {
                let _ = reply.send(run_diagnostics(cfg, link.as_mut()));
            }
        }
    }
    debug!("modem I/O thread exiting");
}

/// Probe every enumerated port. The port held by the live link can't be
/// reopened, so it is exercised through the existing session instead.
fn run_diagnostics(cfg: &ModemConfig, mut link: Option<&mut ModemLink>) -> Vec<ProbeResult> {
    discover::list_ports()
        .into_iter()
        .map(|port| {
            let mut result = match link.as_deref_mut() {
                Some(live) if live.endpoint.path == port.path => {
                    let alive = live.health_check();
                    ProbeResult {
                        endpoint: live.endpoint.clone(),
                        description: String::new(),
                        status: if alive {
                            ProbeStatus::Functional
                        } else {
                            ProbeStatus::NoAtResponse
                        },
                        at_reply: if alive {
                            "OK (live session)".to_string()
                        } else {
                            String::new()
                        },
                        ati_reply: String::new(),
                        error: None,
                    }
                }
                _ => probe::probe(&cfg.endpoint(&port.path)),
            };
            result.description = port.description;
            result
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::ScriptedTransport;

    fn test_cfg() -> ModemConfig {
        ModemConfig {
            command_timeout_secs: 1,
            ..ModemConfig::default()
        }
    }

    fn endpoint() -> SerialEndpoint {
        SerialEndpoint::new("/dev/ttyTEST0", 115_200, Duration::from_millis(100))
    }

    /// The full happy-path init script, in the exact order the sequence
    /// issues commands.
    fn full_init_script() -> Vec<(&'static str, &'static str)> {
        vec![
            ("AT", "\r\nOK\r\n"),
            ("ATE0", "\r\nOK\r\n"),
            ("AT+CMGF=1", "\r\nOK\r\n"),
            ("AT+CMEE=1", "\r\nOK\r\n"),
            ("AT+CSCS=\"GSM\"", "\r\nOK\r\n"),
            ("AT+CPMS", "\r\n+CPMS: 2,30,2,30,2,30\r\nOK\r\n"),
            ("AT+CNMI=2,1,0,0,0", "\r\nOK\r\n"),
            ("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n"),
            ("AT+CGMI", "\r\nQuectel\r\n\r\nOK\r\n"),
            ("AT+CGMM", "\r\nEC25\r\n\r\nOK\r\n"),
            ("AT+CGMR", "\r\nEC25AFFAR07A14M4G\r\n\r\nOK\r\n"),
            ("AT+CGSN", "\r\n866758042011223\r\n\r\nOK\r\n"),
            ("AT+CSCA?", "\r\n+CSCA: \"+25884080020\",145\r\nOK\r\n"),
            ("AT+CSQ", "\r\n+CSQ: 17,99\r\nOK\r\n"),
            ("AT+COPS?", "\r\n+COPS: 0,0,\"Vodacom MZ\",7\r\nOK\r\n"),
        ]
    }

    fn init_link(script: Vec<(&str, &str)>) -> Result<ModemLink, ModemError> {
        let session = AtSession::new(Box::new(ScriptedTransport::new(script)));
        ModemLink::initialize(session, &test_cfg(), endpoint())
    }

    #[test]
    fn test_initialize_full_sequence() {
        let link = init_link(full_init_script()).unwrap();
        let status = &link.status;
        assert!(status.connected);
        assert_eq!(status.port.as_deref(), Some("/dev/ttyTEST0"));
        assert_eq!(status.manufacturer.as_deref(), Some("Quectel"));
        assert_eq!(status.model.as_deref(), Some("EC25"));
        assert_eq!(status.imei.as_deref(), Some("866758042011223"));
        assert_eq!(status.smsc.as_deref(), Some("+25884080020"));
        assert_eq!(status.operator.as_deref(), Some("Vodacom MZ"));
        // RSSI 17 of 31
        assert_eq!(status.signal_percent, Some(54));
    }

    #[test]
    fn test_initialize_fails_without_handshake() {
        let session = AtSession::new(Box::new(ScriptedTransport::silent()));
        let err = ModemLink::initialize(session, &test_cfg(), endpoint()).unwrap_err();
        assert!(matches!(err, ModemError::HandshakeTimeout(_)));
    }

    #[test]
    fn test_initialize_fails_on_mandatory_command() {
        let script = vec![
            ("AT", "\r\nOK\r\n"),
            ("ATE0", "\r\nOK\r\n"),
            ("AT+CMGF=1", "\r\nERROR\r\n"),
        ];
        let err = init_link(script).unwrap_err();
        assert!(matches!(err, ModemError::InitFailed(_)));
    }

    #[test]
    fn test_initialize_tolerates_optional_failures_and_cnmi_fallback() {
        let mut script = vec![
            ("AT", "\r\nOK\r\n"),
            ("ATE0", "\r\nOK\r\n"),
            ("AT+CMGF=1", "\r\nOK\r\n"),
            ("AT+CMEE=1", "\r\nERROR\r\n"),
            ("AT+CSCS=\"GSM\"", "\r\nERROR\r\n"),
            ("AT+CPMS", "\r\nERROR\r\n"),
            // First two notification variants rejected, third accepted.
            ("AT+CNMI=2,1,0,0,0", "\r\nERROR\r\n"),
            ("AT+CNMI=1,1,0,0,0", "\r\nERROR\r\n"),
            ("AT+CNMI=2,0,0,0,0", "\r\nOK\r\n"),
            ("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n"),
        ];
        // Identity/SMSC/signal queries all error; connect still succeeds.
        script.extend([
            ("AT+CGMI", "\r\nERROR\r\n"),
            ("AT+CGMM", "\r\nERROR\r\n"),
            ("AT+CGMR", "\r\nERROR\r\n"),
            ("AT+CGSN", "\r\nERROR\r\n"),
            ("AT+CSCA?", "\r\nERROR\r\n"),
            ("AT+CSQ", "\r\nERROR\r\n"),
            ("AT+COPS?", "\r\nERROR\r\n"),
        ]);
        let link = init_link(script).unwrap();
        assert!(link.status.connected);
        assert!(link.status.manufacturer.is_none());
        assert!(link.status.smsc.is_none());
    }

    #[test]
    fn test_pin_submitted_and_accepted() {
        let script = vec![
            ("AT+CPIN?", "\r\n+CPIN: SIM PIN\r\n\r\nOK\r\n"),
            ("AT+CPIN=\"1234\"", "\r\nOK\r\n"),
            ("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n"),
        ];
        let mut session = AtSession::new(Box::new(ScriptedTransport::new(script)));
        verify_pin(&mut session, Some("1234")).unwrap();
    }

    #[test]
    fn test_pin_required_but_not_configured() {
        let script = vec![("AT+CPIN?", "\r\n+CPIN: SIM PIN\r\n\r\nOK\r\n")];
        let mut session = AtSession::new(Box::new(ScriptedTransport::new(script)));
        let err = verify_pin(&mut session, None).unwrap_err();
        assert!(matches!(err, ModemError::InitFailed(_)));
    }

    #[test]
    fn test_pin_retry_is_bounded() {
        // The SIM never unlocks; the PIN must be submitted exactly twice.
        let script = vec![
            ("AT+CPIN?", "\r\n+CPIN: SIM PIN\r\n\r\nOK\r\n"),
            ("AT+CPIN=\"0000\"", "\r\nOK\r\n"),
            ("AT+CPIN?", "\r\n+CPIN: SIM PIN\r\n\r\nOK\r\n"),
            ("AT+CPIN=\"0000\"", "\r\nOK\r\n"),
            ("AT+CPIN?", "\r\n+CPIN: SIM PIN\r\n\r\nOK\r\n"),
        ];
        let io = ScriptedTransport::new(script);
        let writes = io.writes.clone();
        let mut session = AtSession::new(Box::new(io));
        let err = verify_pin(&mut session, Some("0000")).unwrap_err();
        assert!(matches!(err, ModemError::InitFailed(_)));
        let submissions = writes
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.contains("AT+CPIN=\"0000\""))
            .count();
        assert_eq!(submissions, PIN_ATTEMPTS as usize);
    }

    #[test]
    fn test_unexpected_sim_state_fails() {
        let script = vec![("AT+CPIN?", "\r\n+CPIN: SIM PUK\r\n\r\nOK\r\n")];
        let mut session = AtSession::new(Box::new(ScriptedTransport::new(script)));
        let err = verify_pin(&mut session, Some("1234")).unwrap_err();
        assert!(matches!(err, ModemError::InitFailed(_)));
    }

    #[test]
    fn test_parse_signal_percent() {
        assert_eq!(parse_signal_percent("+CSQ: 31,99\r\nOK"), Some(100));
        assert_eq!(parse_signal_percent("+CSQ: 17,99\r\nOK"), Some(54));
        assert_eq!(parse_signal_percent("+CSQ: 0,0\r\nOK"), Some(0));
        // 99 = not detectable
        assert_eq!(parse_signal_percent("+CSQ: 99,99\r\nOK"), Some(0));
        assert_eq!(parse_signal_percent("ERROR"), None);
    }

    #[test]
    fn test_parse_info_line() {
        assert_eq!(
            parse_info_line("\r\nEC25\r\n\r\nOK").as_deref(),
            Some("EC25")
        );
        assert_eq!(parse_info_line("OK"), None);
        assert_eq!(parse_info_line("+CME ERROR: 14"), None);
        assert_eq!(parse_info_line(""), None);
    }

    #[tokio::test]
    async fn test_concurrent_operations_never_interleave() {
        // Two sends racing through the handle: the worker must run each
        // prompt → payload → confirm sequence to completion before starting
        // the other, which the scripted FIFO enforces — out-of-order writes
        // would find a non-matching front entry and time out.
        let script = vec![
            ("AT+CMGS", "\r\n> "),
            ("first", "\r\n+CMGS: 1\r\n\r\nOK\r\n"),
            ("AT+CMGS", "\r\n> "),
            ("second", "\r\n+CMGS: 2\r\n\r\nOK\r\n"),
        ];
        let io = ScriptedTransport::new(script);
        let writes = io.writes.clone();
        let link = ModemLink {
            session: AtSession::new(Box::new(io)),
            endpoint: endpoint(),
            status: ModemStatus {
                connected: true,
                ..ModemStatus::default()
            },
        };
        let modem = Modem::spawn_for_tests(test_cfg(), link);

        let (a, b) = tokio::join!(
            modem.send_sms("+258841112233", "first"),
            modem.send_sms("+258841112233", "second"),
        );
        let ids = [a.unwrap().message_id, b.unwrap().message_id];
        assert!(ids.contains(&"1".to_string()) && ids.contains(&"2".to_string()));

        // The first operation's body write must precede the second
        // operation's command write.
        let writes = writes.lock().unwrap();
        let first_body = writes.iter().position(|w| w.contains("first")).unwrap();
        let second_cmd = writes
            .iter()
            .enumerate()
            .filter(|(_, w)| w.contains("AT+CMGS"))
            .map(|(i, _)| i)
            .nth(1)
            .unwrap();
        assert!(first_body < second_cmd);
    }

    #[tokio::test]
    async fn test_operations_without_link_report_not_connected() {
        let cfg = ModemConfig {
            // A fixed port that cannot exist keeps establish from scanning
            // whatever serial devices the build host has.
            port: "/dev/ttyNONEXISTENT99".to_string(),
            command_timeout_secs: 1,
            ..ModemConfig::default()
        };
        let modem = Modem::spawn(cfg, Alerter::disabled());
        assert!(!modem.health_check().await);
        let err = modem.send_sms("+258841112233", "x").await.unwrap_err();
        assert!(matches!(err, ModemError::NotConnected));
        let status = modem.status().await;
        assert!(!status.connected);
    }
}

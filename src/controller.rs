/// Proxy lifecycle: wiring, heartbeat timer and reboot watchdog.
///
/// [`ProxyController`] owns every runtime component and is driven from a
/// single event loop. Callers feed it [`ProxyEvent`]s in arrival order and
/// call [`ProxyController::poll`] at least by [`ProxyController::next_deadline`].
/// Time is monotonic uptime supplied by the caller, so the controller never
/// reads a clock itself.
use core::time::Duration;

use serde::Deserialize;

use crate::board;
use crate::codec::{DecodedFrame, PayloadCodec};
use crate::comm::{BroadcastTransport, Radio, RelayError, SendStats, Uplink};
use crate::config::ProxyConfig;
use crate::listener::{AdvertisementListener, ListenerStats, Outcome};
use crate::mac::MacAddress;
use crate::protocol::{self, Heartbeat, Record, WireFrame};
use crate::scanner::{Advertisement, SensorDecoder};

/// Input to the event loop
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    Advertisement(Advertisement),
    /// Frame received from another proxy
    Frame { src: MacAddress, data: WireFrame },
    /// Host command: pause or resume relaying
    SetScanning(bool),
}

impl ProxyEvent {
    /// Copy a received frame into an event. Returns `None` if it cannot be a
    /// valid frame.
    pub fn frame(src: &MacAddress, data: &[u8]) -> Option<Self> {
        let data = WireFrame::from_slice(data).ok()?;
        Some(ProxyEvent::Frame { src: *src, data })
    }
}

/// Console command line, e.g. `{"cmd":"stop"}`
#[derive(Deserialize)]
struct RawCommand {
    cmd: heapless::String<16>,
}

/// Parse one NDJSON console line into an event. Unknown commands and
/// malformed lines yield `None`.
pub fn parse_command(line: &[u8]) -> Option<ProxyEvent> {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    let (raw, _) = serde_json_core::from_slice::<RawCommand>(&line[..end]).ok()?;
    match raw.cmd.as_str() {
        "start" => Some(ProxyEvent::SetScanning(true)),
        "stop" => Some(ProxyEvent::SetScanning(false)),
        _ => None,
    }
}

/// What the caller must do after [`ProxyController::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    /// Watchdog expired: restart the device
    Reboot,
}

/// Repeating timer. A zero interval leaves it disarmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalTimer {
    interval: Duration,
    deadline: Option<Duration>,
}

impl IntervalTimer {
    pub fn arm(interval: Duration, now: Duration) -> Self {
        Self {
            interval,
            deadline: (!interval.is_zero()).then(|| now + interval),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Returns true once per elapsed deadline. Missed periods are collapsed
    /// into one tick.
    pub fn fire(&mut self, now: Duration) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                let next = deadline + self.interval;
                self.deadline = Some(if next <= now { now + self.interval } else { next });
                true
            }
            _ => false,
        }
    }
}

/// One-shot restart deadline. Once expired it stays expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchdog {
    interval: Duration,
    deadline: Option<Duration>,
}

impl Watchdog {
    pub fn arm(interval: Duration, now: Duration) -> Self {
        Self {
            interval,
            deadline: (!interval.is_zero()).then(|| now + interval),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn expired(&self, now: Duration) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Push the deadline to `now + interval`. No effect when disarmed.
    pub fn feed(&mut self, now: Duration) {
        if self.deadline.is_some() {
            self.deadline = Some(now + self.interval);
        }
    }
}

pub struct ProxyController<'c, R, D> {
    config: &'c ProxyConfig,
    local_mac: MacAddress,
    started_at: Duration,
    listener: AdvertisementListener<'c, D>,
    uplink: Uplink<R>,
    notify: IntervalTimer,
    watchdog: Watchdog,
    heartbeats_sent: u32,
    frames_received: u32,
    frames_rejected: u32,
    queue_drops: u32,
}

impl<'c, R: Radio, D: SensorDecoder> ProxyController<'c, R, D> {
    /// Wire up the proxy and arm both timers.
    ///
    /// A failed peer registration is logged and the proxy keeps running;
    /// every send then reports `PeerUnknown`.
    pub fn start(
        config: &'c ProxyConfig,
        radio: R,
        decoder: D,
        local_mac: MacAddress,
        boot_salt: u64,
        now: Duration,
    ) -> Self {
        log::info!(
            "espnow-ble-proxy v{} on {} as '{}' ({})",
            protocol::VERSION,
            board::BOARD_NAME,
            config.hostname,
            local_mac
        );

        let mut transport = BroadcastTransport::new(radio);
        if !transport.register_peer(config.broadcast_address) {
            log::warn!("Running without a registered peer; frames will be dropped");
        }
        let codec = PayloadCodec::new(&config.security_key, boot_salt);
        let uplink = Uplink::new(codec, transport, config.broadcast_address);

        let notify = IntervalTimer::arm(config.notify_interval, now);
        let watchdog = Watchdog::arm(config.reboot_interval, now);
        match notify.deadline() {
            Some(_) => log::info!("Heartbeat every {}s", config.notify_interval.as_secs()),
            None => log::info!("Heartbeat disabled"),
        }
        match watchdog.deadline() {
            Some(_) => log::info!(
                "Reboot watchdog {}s{}",
                config.reboot_interval.as_secs(),
                if config.reset_reboot_on_heartbeat {
                    ", reset by heartbeat"
                } else {
                    ""
                }
            ),
            None => log::info!("Reboot watchdog disabled"),
        }

        Self {
            config,
            local_mac,
            started_at: now,
            listener: AdvertisementListener::new(config, decoder),
            uplink,
            notify,
            watchdog,
            heartbeats_sent: 0,
            frames_received: 0,
            frames_rejected: 0,
            queue_drops: 0,
        }
    }

    pub fn handle(&mut self, event: ProxyEvent, now: Duration) {
        match event {
            ProxyEvent::Advertisement(adv) => {
                self.on_advertisement(&adv, now);
            }
            ProxyEvent::Frame { src, data } => {
                self.on_frame(&src, &data);
            }
            ProxyEvent::SetScanning(enabled) => {
                self.set_scanning(enabled);
                log::info!(
                    "Scanning {} by host command",
                    if enabled { "started" } else { "stopped" }
                );
            }
        }
    }

    pub fn on_advertisement(&mut self, adv: &Advertisement, now: Duration) -> Outcome {
        self.listener.on_advertisement(adv, now, &mut self.uplink)
    }

    /// Open a frame from another proxy. Invalid frames are logged and dropped.
    pub fn on_frame(&mut self, src: &MacAddress, data: &[u8]) -> Option<DecodedFrame> {
        match self.uplink.codec_mut().decode(data) {
            Ok(frame) => {
                self.frames_received = self.frames_received.saturating_add(1);
                match &frame.record {
                    Record::Sensor(r) => log::info!(
                        "[{}] {} seq={} {} temp={:?} hum={:?} bat={:?}",
                        frame.hostname,
                        src,
                        frame.sequence,
                        r.name,
                        r.measurement.temperature.map(|t| t.0),
                        r.measurement.humidity.map(|h| h.0),
                        r.measurement.battery.map(|b| b.0),
                    ),
                    Record::Heartbeat(hb) => log::info!(
                        "[{}] {} seq={} heartbeat uptime={}s dropped={}",
                        frame.hostname,
                        src,
                        frame.sequence,
                        hb.uptime_secs,
                        hb.dropped
                    ),
                }
                Some(frame)
            }
            Err(e) => {
                self.frames_rejected = self.frames_rejected.saturating_add(1);
                log::debug!("Dropped frame from {}: {}", src, e);
                None
            }
        }
    }

    /// Service due timers.
    pub fn poll(&mut self, now: Duration) -> Tick {
        if self.notify.fire(now) {
            self.send_heartbeat(now);
        }

        if self.watchdog.expired(now) {
            log::warn!(
                "Reboot watchdog expired after {}s uptime",
                now.saturating_sub(self.started_at).as_secs()
            );
            return Tick::Reboot;
        }
        Tick::Idle
    }

    fn send_heartbeat(&mut self, now: Duration) {
        let uptime = now.saturating_sub(self.started_at).as_secs();
        let heartbeat = Heartbeat {
            mac: self.local_mac,
            uptime_secs: u32::try_from(uptime).unwrap_or(u32::MAX),
            dropped: self.uplink.stats().dropped().saturating_add(self.queue_drops),
        };

        match self.uplink.send(&self.config.hostname, &Record::Heartbeat(heartbeat)) {
            Ok(sequence) => {
                self.heartbeats_sent = self.heartbeats_sent.saturating_add(1);
                log::debug!("Heartbeat {} sent (uptime {}s)", sequence, uptime);
                if self.config.reset_reboot_on_heartbeat {
                    self.watchdog.feed(now);
                }
            }
            Err(RelayError::Send(result)) => {
                log::warn!("Heartbeat dropped: {}", result.as_str());
            }
            Err(RelayError::Encode(e)) => {
                log::error!("Heartbeat not encoded: {}", e);
            }
        }
    }

    /// Earliest time `poll` has work to do
    pub fn next_deadline(&self) -> Option<Duration> {
        match (self.notify.deadline(), self.watchdog.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn set_scanning(&mut self, enabled: bool) {
        self.listener.set_enabled(enabled);
    }

    pub fn is_scanning(&self) -> bool {
        self.listener.is_enabled()
    }

    /// Record the running total of events the caller could not queue. It is
    /// added to the `dropped` count carried by heartbeats.
    pub fn record_queue_drops(&mut self, total: u32) {
        self.queue_drops = total;
    }

    /// Install the radio receive callback. The callback runs in driver
    /// context; it should only queue a [`ProxyEvent`].
    pub fn on_receive<F>(&mut self, callback: F) -> bool
    where
        F: FnMut(&MacAddress, &[u8]) + Send + 'static,
    {
        self.uplink.transport_mut().on_receive(callback)
    }

    pub fn listener_stats(&self) -> &ListenerStats {
        self.listener.stats()
    }

    pub fn send_stats(&self) -> &SendStats {
        self.uplink.stats()
    }

    pub fn heartbeats_sent(&self) -> u32 {
        self.heartbeats_sent
    }

    pub fn frames_received(&self) -> u32 {
        self.frames_received
    }

    pub fn frames_rejected(&self) -> u32 {
        self.frames_rejected
    }
}

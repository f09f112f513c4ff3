//! espnow-ble-proxy: ESP-IDF std firmware
//!
//! Thread-based implementation using FreeRTOS threads and std::sync::mpsc
//! channels. BLE scanning runs on NimBLE via esp32-nimble; frames go out
//! through the ESP-IDF ESP-NOW driver. The main thread owns the
//! `ProxyController` and is the only writer of its state.

mod radio;

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

use espnow_ble_proxy::config::ProxyConfig;
use espnow_ble_proxy::controller::{self, ProxyController, ProxyEvent, Tick};
use espnow_ble_proxy::mac::MacAddress;
use espnow_ble_proxy::scanner::{AddressKind, Advertisement, ServiceDataDecoder};
use espnow_ble_proxy::{board, protocol};

use esp_idf_svc::espnow::EspNow;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::hal::task::block_on;
use esp_idf_svc::sys::esp_random;
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};

use esp32_nimble::{BLEAddressType, BLEDevice, BLEScan};

use radio::EspNowRadio;

/// Boot-time configuration, embedded at build time
const CONFIG_JSON: &[u8] = include_bytes!("../proxy.json");

/// Pending events between the scan/receive callbacks and the proxy loop
const EVENT_QUEUE_DEPTH: usize = 16;

/// Upper bound on one `recv_timeout` when no timer is armed
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Time for log output to drain before restarting
const REBOOT_SETTLE: Duration = Duration::from_millis(500);

/// Poll period of the scan thread while scanning is paused
const PAUSED_WAIT: Duration = Duration::from_millis(500);

// ── Shared state (atomics for lock-free cross-thread access) ────────

/// Mirrors `ProxyController::is_scanning`; read by the BLE scan thread
static SCANNING: AtomicBool = AtomicBool::new(true);

/// Events lost because the proxy queue was full
static QUEUE_DROPS: AtomicU32 = AtomicU32::new(0);

/// Queue an event from a callback thread, counting it if the queue is full.
fn enqueue(tx: &SyncSender<ProxyEvent>, event: ProxyEvent) {
    if tx.try_send(event).is_err() {
        QUEUE_DROPS.fetch_add(1, Ordering::Relaxed);
    }
}

fn main() -> anyhow::Result<()> {
    // Bind the ESP-IDF logger to the `log` facade
    esp_idf_svc::log::EspLogger::initialize_default();

    let boot = Instant::now();
    log::info!(
        "espnow-ble-proxy v{} starting on {} (std)",
        protocol::VERSION,
        board::BOARD_NAME
    );

    // ── Configuration ────────────────────────────────────────────────

    let config = ProxyConfig::from_json(CONFIG_JSON)
        .map_err(|e| anyhow::anyhow!("invalid proxy configuration: {e}"))?;
    log::info!(
        "Config loaded: {} allowed, {} blocked, {} renamed",
        config.mac_rules.allowed.len(),
        config.mac_rules.disallowed.len(),
        config.mac_rules.renamed.len(),
    );

    // ── Peripherals ──────────────────────────────────────────────────

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // ESP-NOW needs the WiFi driver started in station mode
    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?,
        sys_loop,
    )?;
    wifi.set_configuration(&esp_idf_svc::wifi::Configuration::Client(Default::default()))?;
    wifi.start()?;
    let local_mac = MacAddress(wifi.wifi().sta_netif().get_mac()?);

    let espnow = EspNow::take()?;
    log::info!("ESP-NOW initialized on {}", local_mac);

    // ── Proxy ────────────────────────────────────────────────────────

    let boot_salt = unsafe { (u64::from(esp_random()) << 32) | u64::from(esp_random()) };
    let mut proxy = ProxyController::start(
        &config,
        EspNowRadio::new(espnow),
        ServiceDataDecoder,
        local_mac,
        boot_salt,
        boot.elapsed(),
    );

    let (event_tx, event_rx) = mpsc::sync_channel::<ProxyEvent>(EVENT_QUEUE_DEPTH);

    let frame_tx = event_tx.clone();
    proxy.on_receive(move |src: &MacAddress, data: &[u8]| {
        if let Some(event) = ProxyEvent::frame(src, data) {
            enqueue(&frame_tx, event);
        }
    });

    // ── Console thread ───────────────────────────────────────────────

    let console_tx = event_tx.clone();
    thread::Builder::new()
        .name("console".into())
        .stack_size(4096)
        .spawn(move || {
            console_thread(console_tx);
        })?;

    // ── BLE scan thread ──────────────────────────────────────────────

    thread::Builder::new()
        .name("blescan".into())
        .stack_size(4096)
        .spawn(move || {
            ble_scan_thread(event_tx);
        })?;
    log::info!("BLE scan thread spawned");

    // ── Event loop ───────────────────────────────────────────────────

    loop {
        let now = boot.elapsed();
        let wait = proxy
            .next_deadline()
            .map_or(IDLE_WAIT, |deadline| deadline.saturating_sub(now).min(IDLE_WAIT));

        match event_rx.recv_timeout(wait) {
            Ok(event) => {
                proxy.handle(event, boot.elapsed());
                SCANNING.store(proxy.is_scanning(), Ordering::Relaxed);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("proxy event channel disconnected");
            }
        }

        proxy.record_queue_drops(QUEUE_DROPS.load(Ordering::Relaxed));
        if proxy.poll(boot.elapsed()) == Tick::Reboot {
            let stats = proxy.send_stats();
            log::warn!(
                "Restarting: {} frames sent, {} dropped, {} heartbeats",
                stats.sent,
                stats.dropped(),
                proxy.heartbeats_sent()
            );
            thread::sleep(REBOOT_SETTLE);
            esp_idf_svc::hal::reset::restart();
        }
    }
}

// ── BLE scan thread ──────────────────────────────────────────────────

fn ble_scan_thread(event_tx: SyncSender<ProxyEvent>) {
    log::info!("BLE scan thread started");

    let ble_device = BLEDevice::take();
    let mut scan = BLEScan::new();
    scan.active_scan(true).interval(100).window(99);

    // Run scan in a loop with 5-second rounds
    loop {
        if !SCANNING.load(Ordering::Relaxed) {
            thread::sleep(PAUSED_WAIT);
            continue;
        }

        let _ = block_on(scan.start(ble_device, 5000, |device, data| {
            if !SCANNING.load(Ordering::Relaxed) {
                return Some(()); // Stop the round; the radio goes idle
            }

            let addr = device.addr();
            let address_kind = match addr.addr_type() {
                BLEAddressType::Public | BLEAddressType::PublicID => AddressKind::Public,
                _ => AddressKind::Random,
            };
            let adv = Advertisement::new(
                MacAddress(addr.as_be_bytes()),
                address_kind,
                device.rssi() as i8,
                data.payload(),
            );
            enqueue(&event_tx, ProxyEvent::Advertisement(adv));
            None::<()> // Continue scanning
        }));
    }
}

// ── Console thread ───────────────────────────────────────────────────

/// Reads NDJSON commands (`{"cmd":"stop"}`, `{"cmd":"start"}`) from the
/// serial console.
fn console_thread(event_tx: SyncSender<ProxyEvent>) {
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(n) if n > 0 => {
                if let Some(event) = controller::parse_command(line.as_bytes()) {
                    enqueue(&event_tx, event);
                }
            }
            // No console input yet
            _ => thread::sleep(Duration::from_millis(100)),
        }
    }
}

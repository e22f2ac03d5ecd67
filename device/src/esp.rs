use std::{
    io::{Read, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{NaiveDateTime, Utc};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::{
    i2c::{I2cConfig, I2cDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};

use clock_common::{
    apply_actions, handle_request, http::read_request, require_settings, CharDisplay, ClockConfig,
    ClockEngine, LoadedSettings, Outcome, Settings, SharedState, StartupError, SyncError,
    CONNECTING_MESSAGE, SETTINGS_KEY, SYNC_ERROR_MESSAGE,
};

use crate::lcd::{I2cLcd, PCF8574_ADDRESS};

const NVS_NAMESPACE: &str = "clock";
const NVS_BUFFER_BYTES: usize = 1024;
const I2C_BAUDRATE_HZ: u32 = 100_000;
const SNTP_POLL_MS: u64 = 100;
const SETTINGS_HTML: &str = include_str!("../web/settings.html");

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = ClockConfig::default();
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let Peripherals {
        modem, i2c0, pins, ..
    } = Peripherals::take()?;
    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(Hertz(I2C_BAUDRATE_HZ)),
    )?;
    let display = I2cLcd::new(i2c, PCF8574_ADDRESS, config.display_rows, config.display_cols)
        .context("failed to initialize LCD")?;

    let (settings, startup_error) = match load_startup_settings(&store) {
        Ok(settings) => (settings, None),
        Err(err) => (Settings::new("", ""), Some(err)),
    };

    info!(
        "NVS settings loaded: ssid=`{}`, summer=+{}h, winter=+{}h, alarm={}",
        settings.ssid, settings.summer_offset_hours, settings.winter_offset_hours, settings.alarm
    );

    let state = Arc::new(SharedState::new(settings.clone()));
    state.set_overlay(
        startup_error
            .as_ref()
            .map_or(CONNECTING_MESSAGE, StartupError::overlay),
    );
    spawn_display_loop(state.clone(), &config, display)?;

    if let Some(err) = startup_error {
        halt(&state, err);
    }

    let association_failed = || StartupError::NetworkAssociationFailure {
        ssid: settings.ssid.clone(),
    };
    let (wifi, ip) = match connect_wifi(modem, sys_loop, nvs_partition, &config, &settings) {
        Ok((wifi, Some(ip))) => (wifi, ip),
        Ok((_, None)) => halt(&state, association_failed()),
        Err(err) => {
            warn!("wifi startup failed: {err:#}");
            halt(&state, association_failed())
        }
    };
    state.set_ip(ip.to_string());
    state.clear_overlay();

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.http_port));
    let listener =
        TcpListener::bind(addr).with_context(|| format!("failed to bind settings server at {addr}"))?;
    info!("settings page on http://{ip}:{}", config.http_port);

    // Keep the driver alive for the program lifetime.
    let _wifi = wifi;
    serve(&listener, &state, &store, &config)
}

/// Loads settings from NVS, writing filled-in defaults back.
fn load_startup_settings(store: &NvsStore) -> Result<Settings, StartupError> {
    let location = format!("NVS key `{SETTINGS_KEY}`");
    let LoadedSettings {
        settings,
        defaults_applied,
    } = require_settings(store.load(), &location)?;

    if defaults_applied {
        info!("filled in missing settings defaults");
        if let Err(err) = store.save(&settings) {
            warn!("failed to write back settings defaults: {err:#}");
        }
    }
    Ok(settings)
}

/// Shows the diagnostic and parks the main thread; the display thread keeps running.
fn halt(state: &SharedState, err: StartupError) -> ! {
    error!("startup halted: {err}");
    state.set_overlay(err.overlay());
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &ClockConfig,
    settings: &Settings,
) -> anyhow::Result<(EspWifi<'static>, Option<Ipv4Addr>)> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    let ip = {
        let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
        let auth_method = if settings.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: settings
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: settings
                .password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        wifi.start()?;
        info!("wifi started, connecting to `{}`", settings.ssid);
        if let Err(err) = wifi.wifi_mut().connect() {
            warn!("wifi connect request failed: {err}");
        }

        poll_for_ip(&wifi, config)
    };

    Ok((esp_wifi, ip))
}

fn poll_for_ip(wifi: &BlockingWifi<&mut EspWifi<'static>>, config: &ClockConfig) -> Option<Ipv4Addr> {
    let attempts = config.wifi_connect_attempts.max(1);

    for attempt in 1..=attempts {
        match wifi.is_up() {
            Ok(true) => match wifi.wifi().sta_netif().get_ip_info() {
                Ok(info) => {
                    info!("wifi up on poll {attempt}, address {}", info.ip);
                    return Some(info.ip);
                }
                Err(err) => warn!("wifi up but no address yet: {err}"),
            },
            Ok(false) => info!("waiting for wifi ({attempt}/{attempts})"),
            Err(err) => warn!("wifi status poll failed: {err}"),
        }
        thread::sleep(Duration::from_millis(config.wifi_poll_interval_ms));
    }

    warn!("wifi not up after {attempts} polls");
    None
}

fn spawn_display_loop(
    state: Arc<SharedState>,
    config: &ClockConfig,
    mut display: I2cLcd<'static>,
) -> anyhow::Result<()> {
    let mut engine = ClockEngine::new(config, display.backlight_state());
    let mut clock = EspClock::new(config.ntp_timeout_ms);
    let tick = Duration::from_millis(config.tick_ms.max(1));

    thread::Builder::new()
        .name("display-loop".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            let now_secs = monotonic_secs();

            if state.ip().is_some() && engine.needs_time_sync(now_secs) {
                let synced = match clock.sync() {
                    Ok(()) => {
                        info!("time synchronized");
                        state.clear_overlay_if(SYNC_ERROR_MESSAGE);
                        true
                    }
                    Err(err) => {
                        warn!("time sync failed: {err:#}");
                        state.set_overlay(SYNC_ERROR_MESSAGE);
                        false
                    }
                };
                engine.record_time_sync(synced, now_secs);
            }

            let actions = engine.tick_shared(&state, clock.now_utc(), now_secs);
            apply_actions(&mut display, &actions);
            thread::sleep(tick);
        })
        .context("failed to spawn display loop thread")?;

    Ok(())
}

/// System clock disciplined by the IDF SNTP service.
struct EspClock {
    sntp: Option<EspSntp<'static>>,
    timeout_ms: u64,
}

impl EspClock {
    fn new(timeout_ms: u64) -> Self {
        Self {
            sntp: None,
            timeout_ms,
        }
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        if self.sntp.is_none() {
            self.sntp = Some(EspSntp::new_default().context("failed to start SNTP")?);
        }
        let Some(sntp) = self.sntp.as_ref() else {
            return Err(anyhow!("SNTP service unavailable"));
        };

        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);
        while sntp.get_sync_status() != SyncStatus::Completed {
            if Instant::now() >= deadline {
                return Err(SyncError::Timeout(self.timeout_ms).into());
            }
            thread::sleep(Duration::from_millis(SNTP_POLL_MS));
        }
        Ok(())
    }

    fn now_utc(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

fn serve(
    listener: &TcpListener,
    state: &SharedState,
    store: &NvsStore,
    config: &ClockConfig,
) -> anyhow::Result<()> {
    loop {
        let result = match listener.accept() {
            Ok((stream, peer)) => {
                info!("connection from {peer}");
                handle_connection(stream, state, store, config)
            }
            Err(err) => Err(anyhow::Error::new(err).context("accept failed")),
        };

        if let Err(err) = result {
            warn!("settings server error: {err:#}");
            thread::sleep(Duration::from_millis(config.socket_error_delay_ms));
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    state: &SharedState,
    store: &NvsStore,
    config: &ClockConfig,
) -> anyhow::Result<()> {
    let mut initial = vec![0_u8; config.initial_read_bytes.max(1)];
    let read = stream.read(&mut initial).context("read failed")?;
    if read == 0 {
        return Ok(());
    }
    initial.truncate(read);

    let request = read_request(&initial, &mut stream, config.body_read_chunk_bytes)
        .context("body read failed")?;
    info!("{} {}", request.method, request.path);

    let outcome = handle_request(&request, state, Some(SETTINGS_HTML));
    match &outcome {
        Outcome::Saved { settings, .. } => match store.save(settings) {
            Ok(()) => info!("settings saved for ssid `{}`", settings.ssid),
            Err(err) => warn!("failed to persist settings: {err:#}"),
        },
        Outcome::Rejected { error, .. } => warn!("settings form rejected: {error}"),
        Outcome::Page { .. } => {}
    }

    stream
        .write_all(&outcome.response().to_bytes())
        .context("write failed")?;
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

impl NvsStore {
    fn load(&self) -> anyhow::Result<Option<LoadedSettings>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("settings store lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];

        match nvs.get_str(SETTINGS_KEY, &mut buffer)? {
            Some(value) => Ok(Some(Settings::from_json(value.as_bytes())?)),
            None => Ok(None),
        }
    }

    fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("settings store lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = String::from_utf8(settings.to_json()?)?;
        nvs.set_str(SETTINGS_KEY, &payload)?;
        Ok(())
    }
}

fn monotonic_secs() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs()
}

use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{NaiveDateTime, TimeDelta, Utc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::Mutex,
    time::{Interval, MissedTickBehavior},
};
use tracing::{error, info, warn};

use clock_common::{
    apply_actions, handle_request, require_settings, sntp, CharDisplay, ClockConfig, ClockEngine,
    LoadedSettings, Outcome, PendingRequest, Settings, SharedState, StartupError, SyncError,
    TextGrid, CONNECTING_MESSAGE, SETTINGS_KEY, SYNC_ERROR_MESSAGE,
};

const DEFAULT_HTTP_PORT: u16 = 8080;
// Any routable address works; connecting a UDP socket sends nothing.
const ROUTE_PROBE_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 0, 2, 1), 9);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = host_config();
    let store = FileStore::from_env();

    let (settings, startup_error) = match load_startup_settings(&store).await {
        Ok(settings) => (settings, None),
        Err(err) => (Settings::new("", ""), Some(err)),
    };

    info!(
        "settings loaded: ssid=`{}`, summer=+{}h, winter=+{}h, alarm={}",
        settings.ssid, settings.summer_offset_hours, settings.winter_offset_hours, settings.alarm
    );

    let ssid = settings.ssid.clone();
    let state = Arc::new(SharedState::new(settings));
    state.set_overlay(
        startup_error
            .as_ref()
            .map_or(CONNECTING_MESSAGE, StartupError::overlay),
    );
    spawn_display_loop(
        state.clone(),
        &config,
        SntpClock::new(&config.ntp_server, config.ntp_timeout_ms),
    );

    if let Some(err) = startup_error {
        return halt(&state, err).await;
    }

    let Some(ip) = connect_network(&config, &ssid).await else {
        return halt(&state, StartupError::NetworkAssociationFailure { ssid }).await;
    };
    state.set_ip(ip.to_string());
    state.clear_overlay();

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind settings server at {addr}"))?;
    info!("settings page on http://{ip}:{}", config.http_port);

    serve(
        listener,
        ServerContext {
            state,
            store,
            config,
            template_path: template_path(),
        },
    )
    .await
}

fn host_config() -> ClockConfig {
    let defaults = ClockConfig::default();
    ClockConfig {
        http_port: std::env::var("CLOCK_HTTP_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_HTTP_PORT),
        ntp_server: std::env::var("CLOCK_NTP_SERVER").unwrap_or(defaults.ntp_server.clone()),
        ..defaults
    }
}

fn template_path() -> PathBuf {
    std::env::var("CLOCK_TEMPLATE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/web/settings.html")))
}

/// Loads settings, writing filled-in defaults back to the store.
async fn load_startup_settings(store: &FileStore) -> Result<Settings, StartupError> {
    let location = store.path().display().to_string();
    let LoadedSettings {
        settings,
        defaults_applied,
    } = require_settings(store.load().await, &location)?;

    if defaults_applied {
        info!("filled in missing settings defaults");
        if let Err(err) = store.save(&settings).await {
            warn!("failed to write back settings defaults: {err:#}");
        }
    }
    Ok(settings)
}

fn report_startup_failure(state: &SharedState, err: &StartupError) {
    error!("startup halted: {err}");
    state.set_overlay(err.overlay());
}

/// Shows the diagnostic and parks the main task; the display loop keeps running.
async fn halt(state: &SharedState, err: StartupError) -> anyhow::Result<()> {
    report_startup_failure(state, &err);
    std::future::pending().await
}

/// The host has no radio of its own: "joining" the network means finding
/// the local address of the default route.
async fn connect_network(config: &ClockConfig, ssid: &str) -> Option<Ipv4Addr> {
    info!("waiting for network (configured ssid `{ssid}`)");
    let attempts = config.wifi_connect_attempts.max(1);

    for attempt in 1..=attempts {
        match default_route_ipv4().await {
            Ok(ip) => {
                info!("network up on attempt {attempt}, address {ip}");
                return Some(ip);
            }
            Err(err) => warn!("network probe {attempt}/{attempts} failed: {err:#}"),
        }

        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(config.wifi_poll_interval_ms)).await;
        }
    }

    warn!("no network after {attempts} attempts");
    None
}

async fn default_route_ipv4() -> anyhow::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(ROUTE_PROBE_ADDR).await?;

    match socket.local_addr()? {
        SocketAddr::V4(local) if !local.ip().is_unspecified() => Ok(*local.ip()),
        other => Err(anyhow!("no IPv4 default route (local address {other})")),
    }
}

/// A tick stalled by time sync is not followed by a burst of catch-up ticks.
fn display_interval(tick: Duration) -> Interval {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn spawn_display_loop(state: Arc<SharedState>, config: &ClockConfig, mut clock: SntpClock) {
    let mut display = ConsoleLcd::new(config.display_rows, config.display_cols);
    let mut engine = ClockEngine::new(config, display.backlight_state());
    let tick = Duration::from_millis(config.tick_ms.max(1));

    tokio::spawn(async move {
        let mut interval = display_interval(tick);

        loop {
            interval.tick().await;
            let now_secs = monotonic_secs();

            if state.ip().is_some() && engine.needs_time_sync(now_secs) {
                let synced = match clock.sync().await {
                    Ok(()) => {
                        info!("time synchronized with `{}`", clock.server);
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
            if !actions.is_empty() {
                apply_actions(&mut display, &actions);
                display.flush();
            }
        }
    });
}

/// SNTP-corrected view of the system clock.
struct SntpClock {
    server: String,
    timeout_ms: u64,
    correction: TimeDelta,
}

impl SntpClock {
    fn new(server: &str, timeout_ms: u64) -> Self {
        Self {
            server: server.to_string(),
            timeout_ms,
            correction: TimeDelta::zero(),
        }
    }

    async fn sync(&mut self) -> anyhow::Result<()> {
        let unreachable = |err: std::io::Error| SyncError::Unreachable {
            server: self.server.clone(),
            reason: err.to_string(),
        };

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(unreachable)?;
        socket
            .connect((self.server.as_str(), sntp::NTP_PORT))
            .await
            .map_err(unreachable)?;
        socket
            .send(&sntp::request_packet())
            .await
            .map_err(unreachable)?;

        let mut reply = [0_u8; 2 * sntp::NTP_PACKET_SIZE];
        let len = tokio::time::timeout(
            Duration::from_millis(self.timeout_ms),
            socket.recv(&mut reply),
        )
        .await
        .map_err(|_| SyncError::Timeout(self.timeout_ms))?
        .map_err(unreachable)?;

        let server_time = sntp::parse_response(&reply[..len])?;
        self.correction = server_time.signed_duration_since(Utc::now().naive_utc());
        info!("clock correction {} ms", self.correction.num_milliseconds());
        Ok(())
    }

    fn now_utc(&self) -> NaiveDateTime {
        let now = Utc::now().naive_utc();
        now.checked_add_signed(self.correction).unwrap_or(now)
    }
}

/// Character grid that logs its content whenever it changes.
struct ConsoleLcd {
    grid: TextGrid,
    last_logged: Option<(Vec<String>, bool)>,
}

impl ConsoleLcd {
    fn new(rows: u8, cols: u8) -> Self {
        Self {
            grid: TextGrid::new(rows, cols),
            last_logged: None,
        }
    }

    fn flush(&mut self) {
        let snapshot = (self.grid.lines(), self.grid.backlight_state());
        if self.last_logged.as_ref() == Some(&snapshot) {
            return;
        }

        info!(backlight = snapshot.1, "lcd |{}|", snapshot.0.join("|"));
        self.last_logged = Some(snapshot);
    }
}

impl CharDisplay for ConsoleLcd {
    fn clear(&mut self) {
        self.grid.clear();
    }

    fn write(&mut self, text: &str, row: u8, col: u8) {
        self.grid.write(text, row, col);
    }

    fn backlight(&mut self, on: bool) {
        self.grid.backlight(on);
    }

    fn backlight_state(&self) -> bool {
        self.grid.backlight_state()
    }
}

#[derive(Clone)]
struct FileStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    fn from_env() -> Self {
        let data_dir = std::env::var("CLOCK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.clock"));
        Self::new(data_dir)
    }

    fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: Arc::new(data_dir.as_ref().join(SETTINGS_KEY)),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn path(&self) -> &Path {
        self.path.as_ref()
    }

    async fn load(&self) -> anyhow::Result<Option<LoadedSettings>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.path()).await {
            Ok(raw) => Settings::from_json(&raw)
                .map(Some)
                .with_context(|| format!("invalid settings in {}", self.path().display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(self.path(), settings.to_json()?).await?;
        Ok(())
    }
}

struct ServerContext {
    state: Arc<SharedState>,
    store: FileStore,
    config: ClockConfig,
    template_path: PathBuf,
}

/// Iterative accept loop: one connection at a time, never returns.
async fn serve(listener: TcpListener, ctx: ServerContext) -> anyhow::Result<()> {
    loop {
        let result = match listener.accept().await {
            Ok((stream, peer)) => {
                info!("connection from {peer}");
                handle_connection(stream, &ctx).await
            }
            Err(err) => Err(anyhow::Error::new(err).context("accept failed")),
        };

        if let Err(err) = result {
            warn!("settings server error: {err:#}");
            tokio::time::sleep(Duration::from_millis(ctx.config.socket_error_delay_ms)).await;
        }
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: &ServerContext) -> anyhow::Result<()> {
    let mut initial = vec![0_u8; ctx.config.initial_read_bytes.max(1)];
    let read = stream.read(&mut initial).await.context("read failed")?;
    if read == 0 {
        return Ok(());
    }
    initial.truncate(read);

    let mut pending = PendingRequest::parse(&initial);
    let mut chunk = vec![0_u8; ctx.config.body_read_chunk_bytes.max(1)];
    while pending.remaining() > 0 {
        let read = stream.read(&mut chunk).await.context("body read failed")?;
        if read == 0 {
            break;
        }
        pending.push_body(&chunk[..read]);
    }
    let request = pending.finish();
    info!("{} {}", request.method, request.path);

    let template = load_template(&ctx.template_path).await;
    let outcome = handle_request(&request, &ctx.state, template.as_deref());
    match &outcome {
        Outcome::Saved { settings, .. } => match ctx.store.save(settings).await {
            Ok(()) => info!("settings saved for ssid `{}`", settings.ssid),
            Err(err) => warn!("failed to persist settings: {err:#}"),
        },
        Outcome::Rejected { error, .. } => warn!("settings form rejected: {error}"),
        Outcome::Page { .. } => {}
    }

    stream
        .write_all(&outcome.response().to_bytes())
        .await
        .context("write failed")?;
    let _ = stream.shutdown().await;
    Ok(())
}

async fn load_template(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(template) => Some(template),
        Err(err) => {
            warn!("settings template {} unavailable: {err}", path.display());
            None
        }
    }
}

fn monotonic_secs() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs()
}

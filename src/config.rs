//! # Configuration Management
//!
//! Configuration is read from an optional `transit-config.toml` file and then
//! overridden key by key from the process environment, so a deployment can be
//! driven entirely by an env file handed over by the process manager.
//! Environment lookups are injected as a closure so tests never touch the
//! real process environment.

use chrono_tz::Tz;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE: &str = "transit-config.toml";

/// Number of stop columns on the transit screen
pub const STOP_SLOTS: usize = 3;

/// Letters used in the `STOP_CODE_*` / `STOP_NAME_*` variables, one per column
const STOP_LETTERS: [char; STOP_SLOTS] = ['A', 'B', 'C'];

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Day/night loop timing
    pub schedule: ScheduleConfig,
    /// Full/partial refresh policy
    pub refresh: RefreshConfig,
    /// Transit API access and the stops to show
    pub transit: TransitConfig,
    /// Pre-rendered picture frames
    pub frames: FramesConfig,
    /// SPI/GPIO wiring of the panel
    pub hardware: HardwareConfig,
    /// `env_logger` filter (e.g. "info", "debug", "transit_frame_lib=trace")
    pub log_level: String,
    /// Where the simulated panel writes its last frame (PBM), if anywhere
    pub snapshot_path: Option<PathBuf>,
    /// How the file part of this configuration was obtained
    #[serde(skip)]
    pub source: ConfigSource,
}

/// Outcome of reading the config file, reported once logging is up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    #[default]
    Defaults,
    File(PathBuf),
    Invalid { path: PathBuf, error: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// First hour (0-23) of the night window
    pub night_start_hour: u32,
    /// First hour (0-23) after the night window
    pub night_end_hour: u32,
    /// Panel-off wait between day cycles
    pub day_interval_secs: u64,
    /// Panel-off wait between night checks
    pub night_interval_secs: u64,
    /// Frames shown per day cycle before the transit screen
    pub images_per_cycle: u32,
    /// How long each frame stays up before the next piece of content
    pub frame_dwell_secs: f64,
    /// IANA name of the civil timezone for the clock and the feed
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Use partial refresh between forced full refreshes
    pub partial_enabled: bool,
    /// Force a full refresh every N presents (0 disables)
    pub full_every_n: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransitConfig {
    /// Base URL of the arrivals API (without the `/busarrival` path)
    pub base_url: String,
    /// API credential; no requests are made without one
    pub api_key: Option<String>,
    /// Header carrying the credential
    pub api_key_header: String,
    /// Hard per-request timeout
    pub timeout_secs: u64,
    /// Up to three stops, one per screen column
    pub stops: Vec<StopConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StopConfig {
    /// Column header
    pub name: String,
    /// Bus stop code; `None` leaves the column empty
    pub code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FramesConfig {
    /// Root image directory (holds `sleep.bmp` and `frames/`)
    pub images_dir: PathBuf,
    /// Frame set below `{images_dir}/frames/`
    pub sub_path: String,
    /// Glob-like pattern (`*`, `?`) or `{n}` template for frame names
    pub pattern: String,
    /// Zero padding for `{n}` templates
    pub zero_pad: usize,
    /// Explicit frame count for `{n}` templates (0 = unused)
    pub count: usize,
}

/// GPIO pins use BCM numbering
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub spi_device: String,
    pub spi_speed_hz: u32,
    pub gpio_chip: String,
    pub dc_pin: u32,
    pub rst_pin: u32,
    pub busy_pin: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            schedule: ScheduleConfig::default(),
            refresh: RefreshConfig::default(),
            transit: TransitConfig::default(),
            frames: FramesConfig::default(),
            hardware: HardwareConfig::default(),
            log_level: "info".to_string(),
            snapshot_path: None,
            source: ConfigSource::Defaults,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            night_start_hour: 0,
            night_end_hour: 8,
            day_interval_secs: 30,
            night_interval_secs: 1800,
            images_per_cycle: 2,
            frame_dwell_secs: 15.0,
            timezone: "Asia/Singapore".to_string(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            partial_enabled: true,
            full_every_n: 20,
        }
    }
}

impl Default for TransitConfig {
    fn default() -> Self {
        TransitConfig {
            base_url: String::new(),
            api_key: None,
            api_key_header: "x-api-key".to_string(),
            timeout_secs: 8,
            stops: STOP_LETTERS
                .iter()
                .map(|letter| StopConfig {
                    name: format!("Stop {letter}"),
                    code: None,
                })
                .collect(),
        }
    }
}

impl Default for FramesConfig {
    fn default() -> Self {
        FramesConfig {
            images_dir: PathBuf::from("images"),
            sub_path: "base".to_string(),
            pattern: "frame_*.bmp".to_string(),
            zero_pad: 2,
            count: 0,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        // Waveshare e-Paper HAT wiring
        HardwareConfig {
            spi_device: "/dev/spidev0.0".to_string(),
            spi_speed_hz: 4_000_000,
            gpio_chip: "/dev/gpiochip0".to_string(),
            dc_pin: 25,
            rst_pin: 17,
            busy_pin: 24,
        }
    }
}

impl ScheduleConfig {
    /// The configured civil timezone, or Singapore if the name is unknown
    pub fn civil_tz(&self) -> Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            warn!("Unknown timezone {:?}, using Asia/Singapore", self.timezone);
            chrono_tz::Asia::Singapore
        })
    }
}

impl FramesConfig {
    /// Directory scanned for frames
    pub fn frames_dir(&self) -> PathBuf {
        self.images_dir.join("frames").join(&self.sub_path)
    }

    /// The static image shown during the night window
    pub fn sleep_image(&self) -> PathBuf {
        self.images_dir.join("sleep.bmp")
    }
}

impl StopConfig {
    /// The stop code to fetch, if one is set and not blank
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

impl TransitConfig {
    /// True if at least one stop has a code to fetch
    pub fn has_stop_codes(&self) -> bool {
        self.stops.iter().any(|s| s.code().is_some())
    }
}

impl Config {
    /// Load configuration from the given file, then apply the process environment.
    /// Falls back to defaults if the file doesn't exist or is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let mut config = Self::from_file(path);
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Parse a config file, falling back to defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => Config {
                    source: ConfigSource::File(path.to_path_buf()),
                    ..config
                },
                Err(e) => Config {
                    source: ConfigSource::Invalid {
                        path: path.to_path_buf(),
                        error: e.to_string(),
                    },
                    ..Self::default()
                },
            },
            Err(_) => Self::default(),
        }
    }

    /// Log where the configuration came from and what it selects
    pub fn log_summary(&self) {
        match &self.source {
            ConfigSource::File(path) => info!("Loaded configuration from {}", path.display()),
            ConfigSource::Defaults => info!("No config file, using defaults and environment"),
            ConfigSource::Invalid { path, error } => {
                warn!("Invalid config file format in {}: {}", path.display(), error);
                warn!("Using default configuration");
            }
        }
        let s = &self.schedule;
        info!(
            "Night {:02}:00-{:02}:00 {}, day wait {}s, night wait {}s, {} frame(s) per cycle",
            s.night_start_hour,
            s.night_end_hour,
            s.timezone,
            s.day_interval_secs,
            s.night_interval_secs,
            s.images_per_cycle.max(1)
        );
        info!(
            "Partial refresh {}, full refresh every {} presents",
            if self.refresh.partial_enabled { "on" } else { "off" },
            self.refresh.full_every_n
        );
        for stop in &self.transit.stops {
            info!(
                "Stop column {:?}: {}",
                stop.name,
                stop.code.as_deref().unwrap_or("(none)")
            );
        }
    }

    /// Override fields from environment-style key/value pairs.
    ///
    /// Values that don't parse are reported and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let s = &mut self.schedule;
        set_parsed(&lookup, "SLEEP_START_H", &mut s.night_start_hour);
        set_parsed(&lookup, "SLEEP_END_H", &mut s.night_end_hour);
        set_parsed(&lookup, "LOOP_REFRESH_SECONDS", &mut s.day_interval_secs);
        set_parsed(&lookup, "NIGHT_LOOP_SECONDS", &mut s.night_interval_secs);
        set_parsed(&lookup, "IMAGES_PER_CYCLE", &mut s.images_per_cycle);
        set_parsed(&lookup, "IMAGE_REFRESH_SECONDS", &mut s.frame_dwell_secs);
        set_string(&lookup, "TIMEZONE", &mut s.timezone);

        if let Some(raw) = lookup("PARTIAL_ENABLE") {
            self.refresh.partial_enabled = parse_flag(&raw);
        }
        set_parsed(&lookup, "PARTIAL_FULL_EVERY_N", &mut self.refresh.full_every_n);

        let t = &mut self.transit;
        set_string(&lookup, "API_URL", &mut t.base_url);
        if let Some(key) = lookup("API_KEY").filter(|k| !k.is_empty()) {
            t.api_key = Some(key);
        }
        set_string(&lookup, "API_KEY_HEADER", &mut t.api_key_header);
        set_parsed(&lookup, "REQUEST_TIMEOUT_SECONDS", &mut t.timeout_secs);

        t.stops.resize_with(STOP_SLOTS, || StopConfig {
            name: "—".to_string(),
            code: None,
        });
        for (stop, letter) in t.stops.iter_mut().zip(STOP_LETTERS) {
            set_string(&lookup, &format!("STOP_NAME_{letter}"), &mut stop.name);
            if let Some(code) = lookup(&format!("STOP_CODE_{letter}")).filter(|c| !c.is_empty()) {
                stop.code = Some(code);
            }
        }

        let f = &mut self.frames;
        if let Some(dir) = lookup("IMAGES_DIR") {
            f.images_dir = PathBuf::from(dir);
        }
        set_string(&lookup, "FRAME_SUB_PATH", &mut f.sub_path);
        set_string(&lookup, "FRAME_PATTERN", &mut f.pattern);
        set_parsed(&lookup, "FRAME_ZPAD", &mut f.zero_pad);
        set_parsed(&lookup, "IMAGE_COUNT", &mut f.count);

        set_string(&lookup, "LOG_LEVEL", &mut self.log_level);
        self.log_level = self.log_level.to_lowercase();
        if let Some(path) = lookup("SNAPSHOT_PATH") {
            self.snapshot_path = Some(PathBuf::from(path));
        }
    }
}

/// `PARTIAL_ENABLE` semantics: only explicit "off" spellings disable
fn parse_flag(raw: &str) -> bool {
    !matches!(raw.trim(), "0" | "false" | "False")
}

fn set_string<F>(lookup: &F, key: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        *target = value;
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring {key}={raw:?}: not a valid value"),
        }
    }
}

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AircheckConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub probe: ProbeSection,
    pub proxy: ProxySection,
    pub limits: LimitsSection,
}

impl AircheckConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub captures_dir: String,
    pub profiles_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSection {
    pub timeout_seconds: u64,
    pub retry_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    pub enabled: bool,
    pub cooldown_seconds: u64,
    pub check_url: String,
    pub check_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_concurrent_sessions: u32,
    pub profile_ttl_hours: u64,
    pub sessions_retention_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    pub user_agents: UserAgentSection,
    pub viewport: ViewportSection,
    pub fingerprint: FingerprintSection,
    pub retry: RetrySection,
    pub challenge: ChallengeSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub tab_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagsSection {
    pub no_first_run: bool,
    pub disable_automation_controlled: bool,
    pub disable_blink_features: Vec<String>,
    pub autoplay_policy: String,
    pub lang: Option<String>,
    pub accept_language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentSection {
    pub pool: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewportSection {
    pub resolutions: Vec<[u32; 2]>,
    pub jitter_pixels: u32,
    pub device_scale_factor: [f32; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintSection {
    pub hide_webdriver: bool,
    pub enable_canvas_noise: bool,
    pub enable_webgl_mask: bool,
    pub canvas_noise_range: [i32; 2],
    pub webgl_vendor: Option<String>,
    pub webgl_renderer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub base_delay_seconds: u64,
    pub dwell_seconds: [u64; 2],
}

/// Selectors scanned by the block classifier in addition to its built-in
/// phrase list.
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeSection {
    pub frame_selectors: Vec<String>,
    pub marker_selectors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    pub encoder: EncoderSection,
    pub sampling: SamplingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSection {
    pub ffmpeg_path: String,
    pub display: String,
    pub audio_source: String,
    pub frame_rate: u32,
    pub time_limit_seconds: u64,
    pub grace_seconds: u64,
    pub stop_wait_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingSection {
    pub poll_interval_ms: u64,
    pub progress_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub aircheck: AircheckConfig,
    pub browser: BrowserConfig,
    pub recorder: RecorderConfig,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let aircheck = load_aircheck_config(dir.join("aircheck.toml"))?;
        let browser = load_browser_config(dir.join("browser.toml"))?;
        let recorder = load_recorder_config(dir.join("recorder.toml"))?;
        Ok(Self {
            aircheck,
            browser,
            recorder,
        })
    }
}

pub fn load_aircheck_config<P: AsRef<Path>>(path: P) -> Result<AircheckConfig> {
    load_toml(path)
}

pub fn load_browser_config<P: AsRef<Path>>(path: P) -> Result<BrowserConfig> {
    load_toml(path)
}

pub fn load_recorder_config<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use rand::{seq::SliceRandom, Rng};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BrowserConfig, ChallengeSection, RetrySection, ViewportSection};
use crate::proxy::ProxyEndpoint;

use super::error::{BrowserError, BrowserResult};
use super::fingerprint::FingerprintMasker;
use super::profile::{BrowserProfile, ProfileManager};

/// Source of browser sessions for the setup controller. The production
/// implementation is `BrowserLauncher`; tests substitute scripted stacks.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, proxy: Option<&ProxyEndpoint>)
        -> BrowserResult<Box<dyn AutomationSession>>;
    fn retry(&self) -> RetrySection;
    fn challenge(&self) -> ChallengeSection;
}

/// One live browser instance and the identity it presents.
#[async_trait]
pub trait AutomationSession: Send + Sync {
    fn user_agent(&self) -> &str;
    fn viewport_label(&self) -> String;
    /// Scratch directory to remove at teardown, when the session owns one.
    fn scratch_dir(&self) -> Option<PathBuf>;
    async fn open_page(&self) -> BrowserResult<Box<dyn SessionPage>>;
    async fn shutdown(&mut self) -> BrowserResult<()>;
}

/// A tab the capture pipeline can navigate and read.
#[async_trait]
pub trait SessionPage: Send + Sync {
    async fn goto(&self, url: &str) -> BrowserResult<()>;
    async fn title(&self) -> BrowserResult<String>;
    async fn body_text(&self) -> BrowserResult<String>;
    async fn has_element(&self, selector: &str) -> bool;
    async fn save_screenshot(&self, path: &Path) -> BrowserResult<()>;
}

#[derive(Debug, Clone)]
pub struct ViewportSpec {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl ViewportSpec {
    pub fn label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Builds stealthed Chromium instances: fresh profile, randomized viewport
/// and user agent, optional upstream proxy.
#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<BrowserConfig>,
    profiles: ProfileManager,
    fingerprint: Arc<FingerprintMasker>,
}

impl BrowserLauncher {
    pub fn new(config: BrowserConfig, profiles: ProfileManager) -> Self {
        let fingerprint = Arc::new(FingerprintMasker::new(config.fingerprint.clone()));
        Self {
            config: Arc::new(config),
            profiles,
            fingerprint,
        }
    }

    pub async fn launch(&self, proxy: Option<&ProxyEndpoint>) -> BrowserResult<BrowserAutomation> {
        self.profiles.cleanup_expired()?;
        let profile = self.profiles.allocate()?;
        let viewport = self.select_viewport();
        let user_agent = self.select_user_agent();
        let chromium_config =
            self.build_chromium_config(&profile, &viewport, &user_agent, proxy)?;
        info!(
            profile = %profile.id(),
            ua = %user_agent,
            width = viewport.width,
            height = viewport.height,
            proxied = proxy.is_some(),
            "launching chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        profile.touch().await?;

        Ok(BrowserAutomation {
            browser,
            profile,
            handler_task: Some(handler_task),
            config: Arc::clone(&self.config),
            viewport,
            user_agent,
            fingerprint: Arc::clone(&self.fingerprint),
        })
    }

    fn select_viewport(&self) -> ViewportSpec {
        let ViewportSection {
            resolutions,
            jitter_pixels,
            device_scale_factor,
        } = &self.config.viewport;

        let mut rng = rand::thread_rng();
        let base = resolutions.choose(&mut rng).cloned().unwrap_or([1366, 768]);
        let jitter = *jitter_pixels as i32;
        let width = (base[0] as i32 + rng.gen_range(-jitter..=jitter)).clamp(640, 2560) as u32;
        let height = (base[1] as i32 + rng.gen_range(-jitter..=jitter)).clamp(480, 1600) as u32;
        let scale = rng.gen_range(device_scale_factor[0]..=device_scale_factor[1]) as f64;
        ViewportSpec {
            width,
            height,
            device_scale_factor: scale,
        }
    }

    fn select_user_agent(&self) -> String {
        let mut rng = rand::thread_rng();
        self.config
            .user_agents
            .pool
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| {
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                 Chrome/120.0.0.0 Safari/537.36"
                    .to_string()
            })
    }

    fn build_chromium_config(
        &self,
        profile: &BrowserProfile,
        viewport: &ViewportSpec,
        user_agent: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .chrome_executable(&self.config.chromium.executable_path)
            .user_data_dir(profile.path())
            .viewport(ChromiumViewport {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: Some(viewport.device_scale_factor),
                emulating_mobile: false,
                is_landscape: viewport.width >= viewport.height,
                has_touch: false,
            });

        if !self.config.chromium.headless {
            builder = builder.with_head();
        }
        if !self.config.chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = self.config.chromium.tab_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec![
            format!("--user-agent={user_agent}"),
            format!("--window-size={},{}", viewport.width, viewport.height),
        ];

        if self.config.chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if !self.config.flags.autoplay_policy.is_empty() {
            args.push(format!(
                "--autoplay-policy={}",
                self.config.flags.autoplay_policy
            ));
        }
        if let Some(lang) = &self.config.flags.lang {
            args.push(format!("--lang={lang}"));
        }
        if let Some(proxy) = proxy {
            args.push(format!("--proxy-server={}", proxy.server_arg()));
        }
        for feature in &self.config.flags.disable_blink_features {
            args.push(format!("--disable-blink-features={feature}"));
        }
        if self.config.flags.no_first_run {
            args.push("--no-first-run".into());
        }
        if self.config.flags.disable_automation_controlled {
            args.push("--disable-features=AutomationControlled".into());
        }
        if let Some(accept) = &self.config.flags.accept_language {
            args.push(format!("--accept-lang={accept}"));
        }
        args.push("--disable-background-timer-throttling".into());
        args.push("--password-store=basic".into());

        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }
}

#[async_trait]
impl SessionLauncher for BrowserLauncher {
    async fn launch(
        &self,
        proxy: Option<&ProxyEndpoint>,
    ) -> BrowserResult<Box<dyn AutomationSession>> {
        let automation = BrowserLauncher::launch(self, proxy).await?;
        Ok(Box::new(automation))
    }

    fn retry(&self) -> RetrySection {
        self.config.retry.clone()
    }

    fn challenge(&self) -> ChallengeSection {
        self.config.challenge.clone()
    }
}

/// One running Chromium instance tied to a throwaway profile.
#[derive(Debug)]
pub struct BrowserAutomation {
    browser: Browser,
    profile: BrowserProfile,
    handler_task: Option<JoinHandle<()>>,
    config: Arc<BrowserConfig>,
    viewport: ViewportSpec,
    user_agent: String,
    fingerprint: Arc<FingerprintMasker>,
}

#[async_trait]
impl AutomationSession for BrowserAutomation {
    fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn viewport_label(&self) -> String {
        self.viewport.label()
    }

    fn scratch_dir(&self) -> Option<PathBuf> {
        Some(self.profile.path().to_path_buf())
    }

    async fn open_page(&self) -> BrowserResult<Box<dyn SessionPage>> {
        let params = CreateTargetParams::new("about:blank");
        let page = self.browser.new_page(params).await?;
        self.configure_page(&page).await?;
        Ok(Box::new(CapturePage { page }))
    }

    async fn shutdown(&mut self) -> BrowserResult<()> {
        info!(profile = %self.profile.id(), "shutting down chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        Ok(())
    }
}

impl BrowserAutomation {
    async fn configure_page(&self, page: &Page) -> BrowserResult<()> {
        page.enable_stealth_mode_with_agent(&self.user_agent)
            .await?;

        let mut params_builder =
            SetUserAgentOverrideParams::builder().user_agent(self.user_agent.clone());
        if let Some(accept) = &self.config.flags.accept_language {
            params_builder = params_builder.accept_language(accept.clone());
        }
        let params = params_builder.build().map_err(BrowserError::Configuration)?;
        page.set_user_agent(params).await?;

        if let Some(lang) = &self.config.flags.lang {
            let languages_script = format!(
                "Object.defineProperty(navigator, 'language', {{ get: () => '{lang}' }});\nObject.defineProperty(navigator, 'languages', {{ get: () => ['{lang}', 'en-US'] }});"
            );
            page.evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(languages_script)
                    .build()
                    .map_err(BrowserError::Configuration)?,
            )
            .await?;
        }

        self.fingerprint.apply(page).await?;
        Ok(())
    }
}

impl Drop for BrowserAutomation {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!(
                    profile = %self.profile.id(),
                    "browser automation dropped without explicit shutdown"
                );
            }
        }
    }
}

/// Navigated tab the capture pipeline reads from.
#[derive(Debug)]
pub struct CapturePage {
    page: Page,
}

#[async_trait]
impl SessionPage for CapturePage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn title(&self) -> BrowserResult<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn body_text(&self) -> BrowserResult<String> {
        self.page
            .evaluate("document.body ? document.body.innerText : ''")
            .await?
            .into_value::<String>()
            .map_err(|err| BrowserError::Unexpected(err.to_string()))
    }

    async fn has_element(&self, selector: &str) -> bool {
        self.page.find_element(selector).await.is_ok()
    }

    async fn save_screenshot(&self, path: &Path) -> BrowserResult<()> {
        let params = ScreenshotParams::builder().build();
        let bytes = self.page.screenshot(params).await?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

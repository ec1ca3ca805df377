//! Session flow state machine.
//!
//! Composes the retry scheduler, the callback bridge and the browser
//! primitives into the clearance and registration flows. Transitions are
//! an explicit `match` over [`SessionState`] driven by a loop; terminal
//! states are `Authenticated` and `Failed`.

use crate::error::{EngineError, Result};
use crate::mail::CodeMailbox;
use crate::retry::{run_bounded, run_once, RetryPolicy};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Seam between the flow machine and the remote browser capability.
/// `ChromeDriver` implements it; tests drive the machine with a script.
#[async_trait]
pub trait FlowDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn query_selector(&self, selector: &str) -> Result<bool>;
    async fn click_at_offset(&self, selector: &str, offset: (f64, f64)) -> Result<()>;
    async fn click(&self, selector: &str) -> Result<()>;
    async fn fill(&self, selector: &str, text: &str) -> Result<()>;
    async fn cookies(&self) -> Result<Vec<(String, String)>>;
    async fn language(&self) -> Result<Option<String>>;
    async fn screenshot_to_dir(&self, dir: &Path) -> Result<PathBuf>;
    async fn install_bridge(&self, event_names: &[String]) -> Result<()>;
    async fn await_event(&self, name: &str, wait: Duration) -> Result<serde_json::Value>;
}

#[async_trait]
impl FlowDriver for crate::browser::ChromeDriver {
    async fn navigate(&self, url: &str) -> Result<()> {
        crate::browser::ChromeDriver::navigate(self, url).await
    }
    async fn query_selector(&self, selector: &str) -> Result<bool> {
        crate::browser::ChromeDriver::query_selector(self, selector).await
    }
    async fn click_at_offset(&self, selector: &str, offset: (f64, f64)) -> Result<()> {
        crate::browser::ChromeDriver::click_at_offset(self, selector, offset).await
    }
    async fn click(&self, selector: &str) -> Result<()> {
        crate::browser::ChromeDriver::click(self, selector).await
    }
    async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        crate::browser::ChromeDriver::fill(self, selector, text).await
    }
    async fn cookies(&self) -> Result<Vec<(String, String)>> {
        crate::browser::ChromeDriver::cookies(self).await
    }
    async fn language(&self) -> Result<Option<String>> {
        crate::browser::ChromeDriver::language(self).await
    }
    async fn screenshot_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        crate::browser::ChromeDriver::screenshot_to_dir(self, dir).await
    }
    async fn install_bridge(&self, event_names: &[String]) -> Result<()> {
        crate::browser::ChromeDriver::install_bridge(self, event_names).await
    }
    async fn await_event(&self, name: &str, wait: Duration) -> Result<serde_json::Value> {
        crate::browser::ChromeDriver::await_event(self, name, wait).await
    }
}

/// States of one session. `Authenticated` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Start,
    Navigated,
    ChallengePresent,
    ChallengeCleared,
    CredentialsSubmitted,
    CodeAwaited,
    Authenticated,
    Failed,
}

/// Cookies harvested at the end of a flow, filtered to the
/// security-relevant names and kept in browser order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CookieSet(pub Vec<(String, String)>);

impl CookieSet {
    pub fn filtered(cookies: Vec<(String, String)>, allow: &[String]) -> Self {
        Self(
            cookies
                .into_iter()
                .filter(|(name, _)| allow.iter().any(|a| a == name))
                .collect(),
        )
    }

    /// Single `name=value; ` string, the shape callers paste into a
    /// Cookie header.
    pub fn header_string(&self) -> String {
        self.0
            .iter()
            .map(|(name, value)| format!("{}={}; ", name, value))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Domain-specific knobs: selectors, URLs and windows are configuration,
/// not structure.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Origin the flow navigates to first.
    pub target_url: String,
    /// Element that is present while the challenge interstitial shows.
    pub challenge_selector: String,
    /// Wrapper element of the challenge widget iframe.
    pub challenge_frame_selector: String,
    /// Click offset from the wrapper's top-left corner, aimed at the
    /// checkbox inside the cross-origin iframe.
    pub challenge_click_offset: (f64, f64),
    /// Bridge event fired by page instrumentation when the challenge
    /// widget reports completion; checked in addition to the indicator
    /// when set.
    pub completion_event: Option<String>,
    /// Registration flow selectors.
    pub email_input_selector: String,
    pub email_submit_selector: String,
    pub code_input_selector: String,
    pub code_submit_selector: String,
    /// Element that is present only while the login form still shows.
    pub login_indicator_selector: String,
    /// Cookie names worth harvesting.
    pub cookie_allowlist: Vec<String>,
    /// Window for the challenge indicator to disappear on its own.
    pub challenge_wait: RetryPolicy,
    /// Window for the click-through attempts.
    pub click_through: RetryPolicy,
    /// Window for each registration form step.
    pub form_step: RetryPolicy,
    /// Budget for a single non-repeatable action.
    pub single_action_timeout: Duration,
    /// Page-side wait for the completion event.
    pub event_wait: Duration,
    /// Pause between a click-through attempt and its re-check.
    pub settle_delay: Duration,
    /// Where diagnostic screenshots land.
    pub screenshot_dir: PathBuf,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            target_url: "https://you.com/".to_string(),
            challenge_selector: "#challenge-stage, #challenge-form".to_string(),
            challenge_frame_selector: "div.spacer > div".to_string(),
            challenge_click_offset: (22.0 + 12.0, 23.0 + 12.0),
            completion_event: None,
            email_input_selector: "input[name='email']".to_string(),
            email_submit_selector: "button[type='submit']".to_string(),
            code_input_selector: "input[name='code']".to_string(),
            code_submit_selector: "button[type='submit']".to_string(),
            login_indicator_selector: "form[data-login]".to_string(),
            cookie_allowlist: vec![
                "cf_clearance".to_string(),
                "_cfuvid".to_string(),
                "__cf_bm".to_string(),
            ],
            challenge_wait: RetryPolicy::new(Duration::from_secs(15), Duration::from_secs(3))
                .best_effort(),
            click_through: RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(10)),
            form_step: RetryPolicy::new(Duration::from_secs(20), Duration::from_secs(5)),
            single_action_timeout: Duration::from_secs(10),
            event_wait: Duration::from_secs(8),
            settle_delay: Duration::from_secs(2),
            screenshot_dir: PathBuf::from("tmp"),
        }
    }
}

/// Result of a completed clearance flow.
#[derive(Debug, Clone, Serialize)]
pub struct Clearance {
    pub cookies: CookieSet,
    pub lang: Option<String>,
}

/// Result of a completed registration flow.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub email: String,
    pub cookies: CookieSet,
}

/// Drives one session through a flow. Actions execute strictly
/// sequentially; every retry sleep and bridge await is a cancellation
/// point for the caller's outer deadline.
pub struct FlowMachine<'a, D: FlowDriver + ?Sized> {
    driver: &'a D,
    config: &'a FlowConfig,
    state: SessionState,
}

impl<'a, D: FlowDriver + ?Sized> FlowMachine<'a, D> {
    pub fn new(driver: &'a D, config: &'a FlowConfig) -> Self {
        Self {
            driver,
            config,
            state: SessionState::Start,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Clearance-only flow: navigate, outwait or click through the
    /// challenge, then harvest cookies and the negotiated language.
    pub async fn run_clearance(&mut self) -> Result<Clearance> {
        loop {
            self.state = match self.state {
                SessionState::Start => self.enter_target().await?,
                SessionState::Navigated => self.watch_challenge().await,
                SessionState::ChallengePresent => self.click_through().await?,
                SessionState::ChallengeCleared => {
                    let cookies = match self.harvest().await {
                        Ok(cookies) => cookies,
                        Err(e) => return Err(self.fail(e).await),
                    };
                    let lang = match self.driver.language().await {
                        Ok(lang) => lang,
                        Err(e) => {
                            log::debug!("language read failed: {}", e);
                            None
                        }
                    };
                    self.state = SessionState::Authenticated;
                    return Ok(Clearance { cookies, lang });
                }
                state => {
                    return Err(EngineError::FlowFatal(format!(
                        "clearance flow cannot continue from {:?}",
                        state
                    )))
                }
            };
        }
    }

    /// Registration flow: clearance first, then identifier submission,
    /// one-time-code confirmation and cookie harvesting.
    pub async fn run_registration(&mut self, mailbox: &dyn CodeMailbox) -> Result<Registration> {
        let mut email = String::new();
        loop {
            self.state = match self.state {
                SessionState::Start => self.enter_target().await?,
                SessionState::Navigated => self.watch_challenge().await,
                SessionState::ChallengePresent => self.click_through().await?,
                SessionState::ChallengeCleared => {
                    email = match mailbox.create_address().await {
                        Ok(address) => address,
                        Err(e) => return Err(self.fail(e).await),
                    };
                    self.submit_credentials(&email).await?
                }
                SessionState::CredentialsSubmitted => SessionState::CodeAwaited,
                SessionState::CodeAwaited => self.confirm_code(mailbox, &email).await?,
                SessionState::Authenticated => {
                    let cookies = match self.harvest().await {
                        Ok(cookies) => cookies,
                        Err(e) => return Err(self.fail(e).await),
                    };
                    return Ok(Registration { email, cookies });
                }
                SessionState::Failed => {
                    return Err(EngineError::FlowFatal(
                        "registration flow already failed".to_string(),
                    ))
                }
            };
        }
    }

    /// Start -> Navigated | Failed. Navigation errors are fatal: there is
    /// no page state worth retrying against.
    async fn enter_target(&mut self) -> Result<SessionState> {
        if let Err(e) = self.driver.navigate(&self.config.target_url).await {
            return Err(self.fail(e).await);
        }
        Ok(SessionState::Navigated)
    }

    /// Navigated -> ChallengeCleared | ChallengePresent. The indicator
    /// disappearing on its own (or never showing) clears the challenge
    /// without a click; the wait window is best-effort by construction.
    async fn watch_challenge(&self) -> SessionState {
        let driver = self.driver;
        let selector = self.config.challenge_selector.as_str();
        let _ = run_bounded(&self.config.challenge_wait, move || {
            ensure_absent(driver, selector)
        })
        .await;

        // The wait window is best-effort, so it returns Ok on expiry too;
        // a final indicator check decides which way the flow branches.
        match driver.query_selector(selector).await {
            Ok(false) => SessionState::ChallengeCleared,
            _ => SessionState::ChallengePresent,
        }
    }

    /// ChallengePresent -> ChallengeCleared | Failed. One attempt is a
    /// coordinate click into the widget iframe, a settle pause, an
    /// optional bridge-event wait, then an indicator re-check.
    async fn click_through(&mut self) -> Result<SessionState> {
        let driver = self.driver;
        let cfg = self.config;
        if let Some(event) = &cfg.completion_event {
            // Bridge state does not survive navigation, so install here,
            // after the challenge page is the current document.
            if let Err(e) = driver.install_bridge(std::slice::from_ref(event)).await {
                return Err(self.fail(e).await);
            }
        }

        let outcome = run_bounded(&cfg.click_through, move || async move {
            driver
                .click_at_offset(&cfg.challenge_frame_selector, cfg.challenge_click_offset)
                .await?;
            tokio::time::sleep(cfg.settle_delay).await;

            if let Some(event) = &cfg.completion_event {
                driver.await_event(event, cfg.event_wait).await?;
            }
            ensure_absent(driver, &cfg.challenge_selector).await
        })
        .await;

        match outcome {
            Ok(()) => Ok(SessionState::ChallengeCleared),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// ChallengeCleared -> CredentialsSubmitted.
    async fn submit_credentials(&mut self, email: &str) -> Result<SessionState> {
        let driver = self.driver;
        let cfg = self.config;
        let entered = run_bounded(&cfg.form_step, move || {
            driver.fill(&cfg.email_input_selector, email)
        })
        .await;
        if let Err(e) = entered {
            return Err(self.fail(e).await);
        }

        // Submitting twice could trigger rate limiting; one attempt only.
        let submitted = run_once(cfg.single_action_timeout, move || {
            driver.click(&cfg.email_submit_selector)
        })
        .await;
        match submitted {
            Ok(()) => Ok(SessionState::CredentialsSubmitted),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// CodeAwaited -> Authenticated | Failed.
    async fn confirm_code(
        &mut self,
        mailbox: &dyn CodeMailbox,
        email: &str,
    ) -> Result<SessionState> {
        let driver = self.driver;
        let cfg = self.config;
        let code = match mailbox.fetch_code(email).await {
            Ok(code) => code,
            Err(e) => return Err(self.fail(e).await),
        };

        let code_text = code.as_str();
        let entered = run_bounded(&cfg.form_step, move || {
            driver.fill(&cfg.code_input_selector, code_text)
        })
        .await;
        if let Err(e) = entered {
            return Err(self.fail(e).await);
        }

        let submitted = run_once(cfg.single_action_timeout, move || {
            driver.click(&cfg.code_submit_selector)
        })
        .await;
        if let Err(e) = submitted {
            return Err(self.fail(e).await);
        }

        // Logged in once the login form is gone.
        let confirmed = run_bounded(&cfg.form_step, move || {
            ensure_absent(driver, &cfg.login_indicator_selector)
        })
        .await;
        match confirmed {
            Ok(()) => Ok(SessionState::Authenticated),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn harvest(&self) -> Result<CookieSet> {
        let cookies = self.driver.cookies().await?;
        Ok(CookieSet::filtered(cookies, &self.config.cookie_allowlist))
    }

    /// Terminal failure: captures a diagnostic screenshot, then hands the
    /// terminating error back for the caller to surface.
    async fn fail(&mut self, error: EngineError) -> EngineError {
        self.state = SessionState::Failed;
        match self
            .driver
            .screenshot_to_dir(&self.config.screenshot_dir)
            .await
        {
            Ok(path) => log::warn!("flow failed, screenshot at {}", path.display()),
            Err(e) => log::error!("flow failed and screenshot capture also failed: {}", e),
        }
        error
    }
}

/// Succeeds when `selector` matches nothing; transient error otherwise,
/// so the check composes with the retry scheduler.
async fn ensure_absent<D: FlowDriver + ?Sized>(driver: &D, selector: &str) -> Result<()> {
    if driver.query_selector(selector).await? {
        Err(EngineError::Transient(format!(
            "element still visible: {}",
            selector
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookies() -> Vec<(String, String)> {
        vec![
            ("cf_clearance".to_string(), "abc".to_string()),
            ("session".to_string(), "secret".to_string()),
            ("__cf_bm".to_string(), "xyz".to_string()),
        ]
    }

    #[test]
    fn cookie_set_filters_by_allowlist() {
        let allow = vec!["cf_clearance".to_string(), "__cf_bm".to_string()];
        let set = CookieSet::filtered(cookies(), &allow);
        assert_eq!(set.0.len(), 2);
        assert!(set.0.iter().all(|(name, _)| name != "session"));
    }

    #[test]
    fn cookie_header_string_is_semicolon_delimited() {
        let allow = vec!["cf_clearance".to_string(), "__cf_bm".to_string()];
        let set = CookieSet::filtered(cookies(), &allow);
        assert_eq!(set.header_string(), "cf_clearance=abc; __cf_bm=xyz; ");
    }

    #[test]
    fn empty_allowlist_harvests_nothing() {
        let set = CookieSet::filtered(cookies(), &[]);
        assert!(set.is_empty());
        assert_eq!(set.header_string(), "");
    }
}

//! End-to-end state machine scenarios against a scripted driver.
//!
//! The mock driver plays back a fixed visibility schedule for the
//! challenge indicator and records every interaction, so the transitions
//! and their side effects (clicks, screenshots, harvested cookies) can
//! be asserted without a browser.

use async_trait::async_trait;
use clearway::error::{EngineError, Result};
use clearway::flow::{FlowConfig, FlowDriver, FlowMachine, SessionState};
use clearway::mail::CodeMailbox;
use clearway::retry::RetryPolicy;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

struct MockDriver {
    challenge_selector: String,
    /// The challenge indicator stays visible for this many queries, then
    /// disappears.
    visible_for: usize,
    fail_navigation: bool,
    fail_cookies: bool,
    fail_language: bool,
    challenge_queries: AtomicUsize,
    frame_clicks: AtomicUsize,
    bridge_installs: AtomicUsize,
    event_awaits: AtomicUsize,
    fills: Mutex<Vec<(String, String)>>,
    clicks: Mutex<Vec<String>>,
    cookies: Vec<(String, String)>,
    screenshot_dir: PathBuf,
}

impl MockDriver {
    fn new(config: &FlowConfig, visible_for: usize) -> Self {
        Self {
            challenge_selector: config.challenge_selector.clone(),
            visible_for,
            fail_navigation: false,
            fail_cookies: false,
            fail_language: false,
            challenge_queries: AtomicUsize::new(0),
            frame_clicks: AtomicUsize::new(0),
            bridge_installs: AtomicUsize::new(0),
            event_awaits: AtomicUsize::new(0),
            fills: Mutex::new(Vec::new()),
            clicks: Mutex::new(Vec::new()),
            cookies: vec![
                ("cf_clearance".to_string(), "clear-token".to_string()),
                ("__cf_bm".to_string(), "bm-token".to_string()),
                ("unrelated".to_string(), "noise".to_string()),
            ],
            screenshot_dir: config.screenshot_dir.clone(),
        }
    }

    fn screenshot_count(&self) -> usize {
        match std::fs::read_dir(&self.screenshot_dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl FlowDriver for MockDriver {
    async fn navigate(&self, _url: &str) -> Result<()> {
        if self.fail_navigation {
            Err(EngineError::Navigation("name not resolved".to_string()))
        } else {
            Ok(())
        }
    }

    async fn query_selector(&self, selector: &str) -> Result<bool> {
        if selector == self.challenge_selector {
            let n = self.challenge_queries.fetch_add(1, Ordering::SeqCst);
            Ok(n < self.visible_for)
        } else {
            // Login indicator and friends are already gone.
            Ok(false)
        }
    }

    async fn click_at_offset(&self, _selector: &str, _offset: (f64, f64)) -> Result<()> {
        self.frame_clicks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.clicks.lock().unwrap().push(selector.to_string());
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        self.fills
            .lock()
            .unwrap()
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<(String, String)>> {
        if self.fail_cookies {
            Err(EngineError::Transient("cookie read failed".to_string()))
        } else {
            Ok(self.cookies.clone())
        }
    }

    async fn language(&self) -> Result<Option<String>> {
        if self.fail_language {
            Err(EngineError::Transient("language read failed".to_string()))
        } else {
            Ok(Some("en-US".to_string()))
        }
    }

    async fn screenshot_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join(format!("screenshot-{}.png", uuid_like()));
        std::fs::write(&file, b"png")?;
        Ok(file)
    }

    async fn install_bridge(&self, _event_names: &[String]) -> Result<()> {
        self.bridge_installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn await_event(&self, _name: &str, _wait: Duration) -> Result<serde_json::Value> {
        self.event_awaits.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({"solved": true}))
    }
}

struct MockMailbox {
    fail_code_fetch: bool,
}

#[async_trait]
impl CodeMailbox for MockMailbox {
    async fn create_address(&self) -> Result<String> {
        Ok("tester@sharklasers.com".to_string())
    }

    async fn fetch_code(&self, _address: &str) -> Result<String> {
        if self.fail_code_fetch {
            Err(EngineError::Mailbox("code never arrived".to_string()))
        } else {
            Ok("493021".to_string())
        }
    }
}

fn uuid_like() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
}

/// Config with short windows and a unique screenshot directory.
fn test_config(label: &str) -> FlowConfig {
    FlowConfig {
        challenge_wait: RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(1))
            .best_effort(),
        click_through: RetryPolicy::new(Duration::from_secs(12), Duration::from_secs(5)),
        form_step: RetryPolicy::new(Duration::from_secs(4), Duration::from_secs(2)),
        single_action_timeout: Duration::from_secs(2),
        settle_delay: Duration::from_millis(200),
        screenshot_dir: std::env::temp_dir().join(format!("clearway-flow-{}-{}", label, uuid_like())),
        ..FlowConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn clearance_without_challenge_skips_click_through() {
    let config = test_config("absent");
    let driver = MockDriver::new(&config, 0);
    let mut machine = FlowMachine::new(&driver, &config);

    let clearance = machine.run_clearance().await.unwrap();

    assert_eq!(machine.state(), SessionState::Authenticated);
    assert_eq!(driver.frame_clicks.load(Ordering::SeqCst), 0);
    assert_eq!(driver.screenshot_count(), 0);
    assert_eq!(clearance.lang.as_deref(), Some("en-US"));
    // Only allowlisted names that were actually present.
    assert_eq!(
        clearance.cookies.header_string(),
        "cf_clearance=clear-token; __cf_bm=bm-token; "
    );

    std::fs::remove_dir_all(&config.screenshot_dir).ok();
}

#[tokio::test(start_paused = true)]
async fn clearance_clicks_through_on_second_attempt() {
    let config = test_config("second");
    // Visible for the watch query, the branch re-check and the first
    // click-through re-check; gone on the second click-through re-check.
    let driver = MockDriver::new(&config, 4);
    let mut machine = FlowMachine::new(&driver, &config);

    let clearance = machine.run_clearance().await.unwrap();

    assert_eq!(machine.state(), SessionState::Authenticated);
    assert_eq!(driver.frame_clicks.load(Ordering::SeqCst), 2);
    assert_eq!(driver.screenshot_count(), 0);
    assert!(!clearance.cookies.is_empty());

    std::fs::remove_dir_all(&config.screenshot_dir).ok();
}

#[tokio::test(start_paused = true)]
async fn exhausted_click_through_fails_with_one_screenshot() {
    let config = test_config("exhaust");
    let driver = MockDriver::new(&config, usize::MAX);
    let mut machine = FlowMachine::new(&driver, &config);

    let result = machine.run_clearance().await;

    assert!(matches!(result, Err(EngineError::Transient(_))));
    assert_eq!(machine.state(), SessionState::Failed);
    assert_eq!(driver.screenshot_count(), 1);
    assert!(driver.frame_clicks.load(Ordering::SeqCst) >= 2);

    std::fs::remove_dir_all(&config.screenshot_dir).ok();
}

#[tokio::test(start_paused = true)]
async fn click_through_waits_on_bridge_event_when_configured() {
    let mut config = test_config("bridge");
    config.completion_event = Some("challenge-complete".to_string());
    let driver = MockDriver::new(&config, 3);
    let mut machine = FlowMachine::new(&driver, &config);

    machine.run_clearance().await.unwrap();

    assert_eq!(driver.bridge_installs.load(Ordering::SeqCst), 1);
    assert!(driver.event_awaits.load(Ordering::SeqCst) >= 1);

    std::fs::remove_dir_all(&config.screenshot_dir).ok();
}

#[tokio::test(start_paused = true)]
async fn navigation_failure_is_terminal_with_screenshot() {
    let config = test_config("nav");
    let mut driver = MockDriver::new(&config, 0);
    driver.fail_navigation = true;
    let mut machine = FlowMachine::new(&driver, &config);

    let result = machine.run_clearance().await;

    assert!(matches!(result, Err(EngineError::Navigation(_))));
    assert_eq!(machine.state(), SessionState::Failed);
    assert_eq!(driver.screenshot_count(), 1);

    std::fs::remove_dir_all(&config.screenshot_dir).ok();
}

#[tokio::test(start_paused = true)]
async fn cookie_harvest_failure_is_terminal_with_screenshot() {
    let config = test_config("harvest");
    let mut driver = MockDriver::new(&config, 0);
    driver.fail_cookies = true;
    let mut machine = FlowMachine::new(&driver, &config);

    let result = machine.run_clearance().await;

    assert!(matches!(result, Err(EngineError::Transient(_))));
    assert_eq!(machine.state(), SessionState::Failed);
    assert_eq!(driver.screenshot_count(), 1);

    std::fs::remove_dir_all(&config.screenshot_dir).ok();
}

#[tokio::test(start_paused = true)]
async fn language_read_failure_does_not_fail_clearance() {
    let config = test_config("lang");
    let mut driver = MockDriver::new(&config, 0);
    driver.fail_language = true;
    let mut machine = FlowMachine::new(&driver, &config);

    let clearance = machine.run_clearance().await.unwrap();

    assert_eq!(machine.state(), SessionState::Authenticated);
    assert_eq!(clearance.lang, None);
    assert!(!clearance.cookies.is_empty());
    assert_eq!(driver.screenshot_count(), 0);

    std::fs::remove_dir_all(&config.screenshot_dir).ok();
}

#[tokio::test(start_paused = true)]
async fn registration_reaches_authenticated_and_harvests_cookies() {
    let config = test_config("register");
    let driver = MockDriver::new(&config, 0);
    let mailbox = MockMailbox {
        fail_code_fetch: false,
    };
    let mut machine = FlowMachine::new(&driver, &config);

    let registration = machine.run_registration(&mailbox).await.unwrap();

    assert_eq!(machine.state(), SessionState::Authenticated);
    assert_eq!(registration.email, "tester@sharklasers.com");
    assert!(registration
        .cookies
        .header_string()
        .contains("cf_clearance=clear-token"));

    let fills = driver.fills.lock().unwrap();
    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].1, "tester@sharklasers.com");
    assert_eq!(fills[1].1, "493021");

    let clicks = driver.clicks.lock().unwrap();
    assert_eq!(clicks.len(), 2, "one submit per form step, never retried");

    std::fs::remove_dir_all(&config.screenshot_dir).ok();
}

#[tokio::test(start_paused = true)]
async fn registration_fails_when_code_never_arrives() {
    let config = test_config("nocode");
    let driver = MockDriver::new(&config, 0);
    let mailbox = MockMailbox {
        fail_code_fetch: true,
    };
    let mut machine = FlowMachine::new(&driver, &config);

    let result = machine.run_registration(&mailbox).await;

    assert!(matches!(result, Err(EngineError::Mailbox(_))));
    assert_eq!(machine.state(), SessionState::Failed);
    assert_eq!(driver.screenshot_count(), 1);

    std::fs::remove_dir_all(&config.screenshot_dir).ok();
}

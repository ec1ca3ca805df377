use crate::browser::bridge;
use crate::config::{BrowserLaunchConfig, HeadlessMode};
use crate::error::{EngineError, Result};
use crate::extensions::ExtensionProvisioner;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Anti-fingerprinting script installed on every new document.
const STEALTH_JS: &str = include_str!("../js/stealth.js");

/// Forces shadow roots open so challenge widgets stay queryable.
const HOOK_JS: &str = include_str!("../js/hook.js");

/// One launched browser driving one session. The browser process is
/// exclusively owned by the session and torn down when it ends.
pub struct ChromeDriver {
    browser: Browser,
    page: Page,
    temp_dir: Option<PathBuf>,
}

impl ChromeDriver {
    /// Launch a browser per `config`, provisioning the configured
    /// extensions first and installing the stealth scripts so they run
    /// before any page script on every navigation.
    pub async fn launch(config: &BrowserLaunchConfig) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--ignore-certificate-errors")
            .arg(format!("--user-agent={}", config.user_agent))
            .arg(format!(
                "--window-size={},{}",
                config.window_size.0, config.window_size.1
            ));

        builder = match config.headless {
            HeadlessMode::New => builder.arg("--headless=new"),
            HeadlessMode::Enabled => builder,
            HeadlessMode::Disabled => builder.with_head(),
        };

        if config.disable_gpu {
            builder = builder.arg("--disable-gpu");
        }
        if config.no_sandbox {
            builder = builder.arg("--no-sandbox");
        }
        if let Some(proxy) = &config.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }
        if !config.proxy_bypass.is_empty() {
            builder = builder.arg(format!(
                "--proxy-bypass-list={}",
                config.proxy_bypass.join(",")
            ));
        }
        if let Some(path) = &config.chrome_path {
            builder = builder.chrome_executable(path);
        }

        // Unique profile directory per session so parallel sessions never
        // share state; removed again on drop.
        let temp_dir = match &config.user_data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder = builder.user_data_dir(dir);
                None
            }
            None => {
                let dir = std::env::temp_dir().join(format!("clearway-{}", uuid::Uuid::new_v4()));
                std::fs::create_dir_all(&dir)?;
                builder = builder.user_data_dir(&dir);
                Some(dir)
            }
        };

        if !config.extensions.is_empty() {
            let provisioner = ExtensionProvisioner::builtin(&config.extension_root);
            let ids: Vec<&str> = config.extensions.iter().map(String::as_str).collect();
            let paths = provisioner.provision(&ids)?;
            if !paths.is_empty() {
                let joined = paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                builder = builder
                    .arg(format!("--disable-extensions-except={}", joined))
                    .arg(format!("--load-extension={}", joined))
                    .arg("--disable-extensions=false");
            }
        }

        let browser_config = builder
            .build()
            .map_err(EngineError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| EngineError::LaunchFailed(e.to_string()))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    log::debug!("browser event error: {}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| EngineError::LaunchFailed(format!("failed to open page: {}", e)))?;

        for script in [STEALTH_JS, HOOK_JS] {
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script))
                .await?;
        }

        Ok(Self {
            browser,
            page,
            temp_dir,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Navigate the session page and wait for the load event.
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(EngineError::Navigation)?;

        let response = self
            .page
            .execute(params)
            .await
            .map_err(|e| EngineError::Navigation(format!("{}: {}", url, e)))?;
        if let Some(error_text) = &response.result.error_text {
            return Err(EngineError::Navigation(format!("{}: {}", url, error_text)));
        }

        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| EngineError::Navigation(format!("{}: {}", url, e)))?;
        Ok(())
    }

    /// Whether `selector` currently matches an element.
    pub async fn query_selector(&self, selector: &str) -> Result<bool> {
        let expression = format!(
            "document.querySelector('{}') !== null",
            escape_selector(selector)
        );
        let result = self.page.evaluate(expression.as_str()).await?;
        let present: bool = result
            .into_value()
            .map_err(|e| EngineError::Transient(format!("visibility check: {}", e)))?;
        Ok(present)
    }

    /// Clicks at a fixed offset from `selector`'s top-left corner. Used
    /// for challenge widgets living in cross-origin iframes, where the
    /// checkbox itself cannot be queried: the click lands on page
    /// coordinates computed from the wrapper element.
    pub async fn click_at_offset(&self, selector: &str, offset: (f64, f64)) -> Result<()> {
        let frames: Vec<serde_json::Value> = self
            .page
            .evaluate("Array.from(document.querySelectorAll('iframe')).map(f => f.src)")
            .await?
            .into_value()
            .map_err(|e| EngineError::Transient(format!("iframe scan: {}", e)))?;
        if frames.is_empty() {
            return Err(EngineError::Transient("no challenge iframe".to_string()));
        }
        log::info!("challenge iframe: {:?}", frames[0]);

        let selector = if selector.is_empty() { "body" } else { selector };
        let expression = format!(
            "{{ let r = document.querySelector('{}').getBoundingClientRect(); ({{x: r.x, y: r.y}}); }}",
            escape_selector(selector)
        );
        let rect: Rect = self
            .page
            .evaluate(expression.as_str())
            .await?
            .into_value()
            .map_err(|e| EngineError::Transient(format!("bounding rect: {}", e)))?;

        let (x, y) = (rect.x + offset.0, rect.y + offset.1);
        for kind in [
            DispatchMouseEventType::MousePressed,
            DispatchMouseEventType::MouseReleased,
        ] {
            let params = DispatchMouseEventParams::builder()
                .r#type(kind)
                .x(x)
                .y(y)
                .button(MouseButton::Left)
                .click_count(1)
                .build()
                .map_err(EngineError::Transient)?;
            self.page.execute(params).await?;
        }
        Ok(())
    }

    /// Click `selector`, scrolling it into view first.
    pub async fn click(&self, selector: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .map_err(|_| EngineError::ElementNotFound(selector.to_string()))?
            .click()
            .await
            .map_err(|e| EngineError::Transient(format!("click {}: {}", selector, e)))?;
        Ok(())
    }

    /// Click `selector` and type `text` into it.
    pub async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .map_err(|_| EngineError::ElementNotFound(selector.to_string()))?
            .click()
            .await
            .map_err(|e| EngineError::Transient(format!("focus {}: {}", selector, e)))?
            .type_str(text)
            .await
            .map_err(|e| EngineError::Transient(format!("type into {}: {}", selector, e)))?;
        Ok(())
    }

    /// All cookies visible to the session, as (name, value) pairs.
    pub async fn cookies(&self) -> Result<Vec<(String, String)>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies.into_iter().map(|c| (c.name, c.value)).collect())
    }

    /// The page's negotiated language preference.
    pub async fn language(&self) -> Result<Option<String>> {
        let result = self.page.evaluate("navigator.language").await?;
        Ok(result.into_value().ok())
    }

    /// Captures a PNG screenshot into `dir` under a random filename and
    /// returns its path. Diagnostic artifact on flow failure.
    pub async fn screenshot_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let bytes = self
            .page
            .screenshot(chromiumoxide::page::ScreenshotParams::default())
            .await?;
        tokio::fs::create_dir_all(dir).await?;
        let file = dir.join(format!("screenshot-{}.png", uuid::Uuid::new_v4()));
        tokio::fs::write(&file, bytes).await?;
        log::info!("screenshot file: {}", file.display());
        Ok(file)
    }

    /// Install the callback bridge into the current page.
    pub async fn install_bridge(&self, event_names: &[String]) -> Result<()> {
        bridge::install(&self.page, event_names).await
    }

    /// Await a bridge event's most recent result.
    pub async fn await_event(&self, name: &str, wait: Duration) -> Result<serde_json::Value> {
        bridge::await_result(&self.page, name, wait).await
    }

    /// Close the browser. The session owns it exclusively, so this ends
    /// the session's remote capability.
    pub async fn close(mut self) -> Result<()> {
        self.browser
            .close()
            .await
            .map_err(|e| EngineError::Transient(format!("close browser: {}", e)))?;
        let _ = self.browser.wait().await;
        Ok(())
    }
}

impl Drop for ChromeDriver {
    fn drop(&mut self) {
        if let Some(temp_dir) = &self.temp_dir {
            if temp_dir.exists() {
                let _ = std::fs::remove_dir_all(temp_dir);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Rect {
    x: f64,
    y: f64,
}

fn escape_selector(selector: &str) -> String {
    selector.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stealth_scripts_are_embedded() {
        assert!(STEALTH_JS.contains("webdriver"));
        assert!(HOOK_JS.contains("attachShadow"));
    }

    #[test]
    fn selector_escaping_survives_quotes() {
        assert_eq!(escape_selector("a[title='x']"), "a[title=\\'x\\']");
    }
}

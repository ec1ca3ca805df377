//! Callback bridge between host control flow and in-page JavaScript.
//!
//! Some completions are only knowable inside the page (e.g. a challenge
//! widget invoking its success callback). The bridge injects a
//! page-resident registry that records such events, and lets the host
//! await the most recent result by name instead of polling the DOM.

use crate::error::{EngineError, Result};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use std::time::Duration;

/// Window property holding the registry. Namespaced to avoid colliding
/// with page globals.
const REGISTRY_NAME: &str = "__clearwayCallbacks";

/// Extra protocol-level budget on top of the page-side wait, so the host
/// never cuts off a promise the page is still legitimately waiting on.
const PROTOCOL_MARGIN: Duration = Duration::from_secs(2);

/// Builds the registry bootstrap script. `register` wires a handler,
/// `execute` invokes one (throwing for unknown names), and `waitFor`
/// returns a promise for the most recent result under a name. Results
/// are last-write-wins, not queued: the flows built on this are
/// request/response shaped.
pub fn bridge_script(event_names: &[String]) -> String {
    let mut registrations = String::new();
    for name in event_names {
        registrations.push_str(&format!(
            "\nwindow.{reg}.register('{name}', (data) => data);",
            reg = REGISTRY_NAME,
            name = escape_js(name),
        ));
    }

    format!(
        r#"
window.{reg} = {{
    handlers: {{}},
    results: {{}},
    waiters: {{}},
    register(name, handler) {{
        this.handlers[name] = handler;
    }},
    execute(name, data) {{
        const handler = this.handlers[name];
        if (!handler) {{
            throw new Error('event "' + name + '" not registered');
        }}
        const value = handler.call(this, data);
        this.results[name] = value;
        const pending = this.waiters[name] || [];
        this.waiters[name] = [];
        for (const resolve of pending) resolve(value);
        return value;
    }},
    waitFor(name, timeoutMs) {{
        if (name in this.results) {{
            return Promise.resolve(this.results[name]);
        }}
        return new Promise((resolve, reject) => {{
            const timer = setTimeout(
                () => reject(new Error('await timeout: ' + name)),
                timeoutMs,
            );
            (this.waiters[name] = this.waiters[name] || []).push((value) => {{
                clearTimeout(timer);
                resolve(value);
            }});
        }});
    }},
}};{registrations}
"#,
        reg = REGISTRY_NAME,
        registrations = registrations,
    )
}

/// Installs the registry into the current page. Torn down implicitly on
/// navigation, so flows re-install it after each page load that needs it.
pub async fn install(page: &Page, event_names: &[String]) -> Result<()> {
    page.evaluate(bridge_script(event_names).as_str()).await?;
    Ok(())
}

/// Invokes a registered handler from the host side, recording its result.
pub async fn execute(page: &Page, name: &str, data: &serde_json::Value) -> Result<()> {
    let script = format!(
        "window.{}.execute('{}', {})",
        REGISTRY_NAME,
        escape_js(name),
        data,
    );
    match page.evaluate(script.as_str()).await {
        Ok(_) => Ok(()),
        Err(e) => Err(classify(name, e)),
    }
}

/// Awaits the page-side promise for `name`, surfacing its resolution as
/// the returned value and its rejection as `AwaitTimeout`. The protocol
/// timeout is strictly larger than the page-side window.
pub async fn await_result(
    page: &Page,
    name: &str,
    wait: Duration,
) -> Result<serde_json::Value> {
    let expression = format!(
        "window.{}.waitFor('{}', {})",
        REGISTRY_NAME,
        escape_js(name),
        wait.as_millis(),
    );
    let params = EvaluateParams::builder()
        .expression(expression)
        .await_promise(true)
        .return_by_value(true)
        .build()
        .map_err(EngineError::Transient)?;

    let evaluation = tokio::time::timeout(wait + PROTOCOL_MARGIN, page.evaluate(params)).await;
    match evaluation {
        Ok(Ok(result)) => Ok(result.value().cloned().unwrap_or(serde_json::Value::Null)),
        Ok(Err(e)) => Err(classify(name, e)),
        Err(_) => Err(EngineError::AwaitTimeout(name.to_string())),
    }
}

/// Maps a page-side exception onto the bridge error taxonomy.
fn classify(name: &str, error: chromiumoxide::error::CdpError) -> EngineError {
    let message = error.to_string();
    if message.contains("await timeout") {
        EngineError::AwaitTimeout(name.to_string())
    } else if message.contains("not registered") {
        EngineError::EventNotRegistered(name.to_string())
    } else {
        EngineError::Cdp(error)
    }
}

fn escape_js(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

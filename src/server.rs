//! HTTP surface.
//!
//! Thin warp front end over the flow machine. Every endpoint returns the
//! same JSON envelope `{ ok, msg, data }`; any error surfacing from a
//! flow is mapped into it rather than panicking the process. Each request
//! launches its own browser, so concurrent requests are independent
//! sessions.

use crate::browser::ChromeDriver;
use crate::config::BrowserLaunchConfig;
use crate::error::EngineError;
use crate::flow::{FlowConfig, FlowMachine};
use crate::mail::GuerrillaMailbox;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use warp::Filter;

/// Sender address carrying registration one-time codes.
const CODE_SENDER: &str = "login@you.com";

/// Overall budget for one clearance/registration request.
const SESSION_DEADLINE: Duration = Duration::from_secs(180);

/// Shared, read-only service configuration.
pub struct AppState {
    pub browser: BrowserLaunchConfig,
    pub flow: FlowConfig,
}

#[derive(Debug, Serialize)]
struct Envelope {
    ok: bool,
    msg: String,
    data: serde_json::Value,
}

impl Envelope {
    fn ok(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            msg: "success".to_string(),
            data,
        }
    }

    fn err(msg: impl ToString) -> Self {
        Self {
            ok: false,
            msg: msg.to_string(),
            data: serde_json::Value::Null,
        }
    }
}

/// All routes of the service. Split out from [`serve`] so tests can
/// exercise them with `warp::test`.
pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let health =
        warp::path("health").map(|| warp::reply::json(&serde_json::json!({ "status": "ok" })));

    let state_filter = warp::any().map(move || state.clone());

    let clearance = warp::path("clearance")
        .and(warp::get())
        .and(state_filter.clone())
        .and_then(handle_clearance);

    let register = warp::path("register")
        .and(warp::get())
        .and(state_filter)
        .and_then(handle_register);

    // Diagnostic screenshots are fetchable next to the JSON they were
    // reported in.
    let artifacts = warp::path("tmp").and(warp::fs::dir("tmp"));

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "OPTIONS"]);

    health
        .or(clearance)
        .or(register)
        .or(artifacts)
        .with(cors)
        .with(warp::log::custom(log_request))
}

/// Binds and serves until the listener fails.
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("server start by http://{}", addr);
    warp::serve(routes(state))
        .run_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
        .await;
    Ok(())
}

async fn handle_clearance(state: Arc<AppState>) -> Result<impl warp::Reply, Infallible> {
    let request_id = uuid::Uuid::new_v4();
    log::info!("------ START CLEARANCE {} ------", request_id);

    let result = tokio::time::timeout(SESSION_DEADLINE, run_clearance(&state)).await;
    let envelope = match result {
        Ok(Ok(data)) => Envelope::ok(data),
        Ok(Err(e)) => Envelope::err(e),
        Err(_) => Envelope::err(EngineError::DeadlineExceeded),
    };

    log::info!("------ END CLEARANCE {} ok={} ------", request_id, envelope.ok);
    Ok(warp::reply::json(&envelope))
}

async fn handle_register(state: Arc<AppState>) -> Result<impl warp::Reply, Infallible> {
    let request_id = uuid::Uuid::new_v4();
    log::info!("------ START REGISTER {} ------", request_id);

    let result = tokio::time::timeout(SESSION_DEADLINE, run_register(&state)).await;
    let envelope = match result {
        Ok(Ok(data)) => Envelope::ok(data),
        Ok(Err(e)) => Envelope::err(e),
        Err(_) => Envelope::err(EngineError::DeadlineExceeded),
    };

    log::info!("------ END REGISTER {} ok={} ------", request_id, envelope.ok);
    Ok(warp::reply::json(&envelope))
}

async fn run_clearance(state: &AppState) -> crate::error::Result<serde_json::Value> {
    let driver = ChromeDriver::launch(&state.browser).await?;
    let mut machine = FlowMachine::new(&driver, &state.flow);
    let outcome = machine.run_clearance().await;
    if let Err(e) = driver.close().await {
        log::warn!("browser teardown: {}", e);
    }
    let clearance = outcome?;

    Ok(serde_json::json!({
        "lang": clearance.lang,
        "userAgent": state.browser.user_agent,
        "cookie": clearance.cookies.header_string(),
    }))
}

async fn run_register(state: &AppState) -> crate::error::Result<serde_json::Value> {
    let mailbox = GuerrillaMailbox::new(state.browser.proxy.as_deref(), CODE_SENDER)?;
    let driver = ChromeDriver::launch(&state.browser).await?;
    let mut machine = FlowMachine::new(&driver, &state.flow);
    let outcome = machine.run_registration(&mailbox).await;
    if let Err(e) = driver.close().await {
        log::warn!("browser teardown: {}", e);
    }
    let registration = outcome?;

    Ok(serde_json::json!(registration.cookies.header_string()))
}

fn log_request(info: warp::log::Info<'_>) {
    log::info!(
        "{} {} -> {} in {:?}",
        info.method(),
        info.path(),
        info.status(),
        info.elapsed(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shapes_match_the_wire_contract() {
        let ok = Envelope::ok(serde_json::json!({"cookie": "cf_clearance=x; "}));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["msg"], "success");
        assert_eq!(value["data"]["cookie"], "cf_clearance=x; ");

        let err = Envelope::err(EngineError::DeadlineExceeded);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["msg"], "Deadline exceeded");
        assert!(value["data"].is_null());
    }
}

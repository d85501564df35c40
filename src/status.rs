//! Status page and shutdown-control endpoints served by the control app.
//!
//! This is a thin facade over shared state: handlers read `GlobalState`,
//! the shutdown APIs mutate the scheduled-shutdown slot or force every
//! proxy idle, and nothing here talks to the control plane directly.

use crate::state::GlobalState;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

type HandlerResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Helper to create a response with the given status and body
fn response(status: StatusCode, body: impl Into<Bytes>) -> HandlerResponse {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> HandlerResponse {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create an HTML response
fn html_response(body: String) -> HandlerResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

#[derive(Debug, Deserialize)]
struct ScheduleShutdownRequest {
    shutdown_in_minutes: Option<f64>,
}

/// Route a request hitting the control application.
pub async fn handle_control_request(
    req: Request<Incoming>,
    global: Arc<GlobalState>,
) -> Result<HandlerResponse, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Control request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/") => Response::builder()
            .status(StatusCode::FOUND)
            .header(hyper::header::LOCATION, "/status")
            .body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed())
            .expect("valid response with StatusCode enum and static header"),

        (&Method::GET, "/status") => html_response(render_status(&global)),

        (&Method::POST, "/api/schedule-shutdown") => {
            let body = req.into_body().collect().await?.to_bytes();
            handle_schedule_shutdown(&global, &body)
        }

        (&Method::POST, "/api/cancel-shutdown") => {
            global.control_proxy().clear_scheduled_shutdown();
            info!("Scheduled shutdown cancelled");
            json_response(StatusCode::OK, r#"{"status":"success"}"#)
        }

        (&Method::POST, "/api/immediate-shutdown") => {
            info!("Immediate shutdown requested");
            global.force_all_idle();
            json_response(StatusCode::OK, r#"{"status":"success"}"#)
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn handle_schedule_shutdown(global: &GlobalState, body: &[u8]) -> HandlerResponse {
    let minutes = serde_json::from_slice::<ScheduleShutdownRequest>(body)
        .ok()
        .and_then(|r| r.shutdown_in_minutes);

    // User input error: reject with 400, not worth an error-level log
    let minutes = match minutes {
        Some(m) if m.is_finite() && m > 0.0 => m,
        _ => {
            warn!("Rejected invalid shutdown time");
            return json_response(
                StatusCode::BAD_REQUEST,
                r#"{"error":"Invalid shutdown time"}"#,
            );
        }
    };

    // A delay too large to represent as a timestamp is rejected like any
    // other invalid value instead of overflowing
    let at = Duration::try_from_secs_f64(minutes * 60.0)
        .ok()
        .and_then(|d| SystemTime::now().checked_add(d));
    let at = match at {
        Some(at) => at,
        None => {
            warn!(minutes, "Rejected out-of-range shutdown time");
            return json_response(
                StatusCode::BAD_REQUEST,
                r#"{"error":"Invalid shutdown time"}"#,
            );
        }
    };
    global.control_proxy().set_scheduled_shutdown(at);

    info!(minutes, "Shutdown scheduled");
    json_response(StatusCode::OK, r#"{"status":"success"}"#)
}

/// Placeholder page served by forwarding apps while the tunnel is down.
pub fn starting_page(name: &str) -> HandlerResponse {
    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>{name} is starting</title>
  <meta http-equiv="refresh" content="5">
</head>
<body>
  <h1>{name} is starting...</h1>
  <p>The pod is being provisioned. This page refreshes automatically.</p>
</body>
</html>
"#
    );
    html_response(body)
}

/// Render the human status page from current shared state.
fn render_status(global: &GlobalState) -> String {
    let (pod_running, pod_start_time) = {
        let pod = global.pod.lock();
        (pod.pod_running, pod.pod_start_time)
    };
    let (ssh_running, endpoint) = {
        let ssh = global.ssh.lock();
        (ssh.ssh_running, ssh.endpoint.clone())
    };

    let pod_start = pod_start_time.map(format_timestamp);
    let pod_uptime = pod_start_time
        .and_then(|t| t.elapsed().ok())
        .map(format_duration);

    let scheduled = global.control_proxy().scheduled_shutdown();
    let scheduled_time = scheduled.map(format_timestamp);
    let countdown = scheduled
        .and_then(|at| at.duration_since(SystemTime::now()).ok())
        .map(format_duration);

    let mut rows = String::new();
    for proxy in &global.proxies {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            proxy.name,
            if ssh_running { "yes" } else { "no" },
            format_minutes_ago(proxy.last_web_activity()),
            proxy.local_port,
            if proxy.remote_port == 0 {
                "-".to_string()
            } else {
                proxy.remote_port.to_string()
            },
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>Pod status</title>
  <meta http-equiv="refresh" content="10">
</head>
<body>
  <h1>Pod status</h1>
  <ul>
    <li>Pod running: {pod_running}</li>
    <li>Pod started: {pod_start}</li>
    <li>Pod uptime: {pod_uptime}</li>
    <li>SSH running: {ssh_running}</li>
    <li>SSH endpoint: {endpoint}</li>
    <li>Scheduled shutdown: {scheduled_time} {countdown}</li>
    <li>Current time: {now}</li>
  </ul>
  <table border="1">
    <tr><th>App</th><th>Active</th><th>Last activity</th><th>Local port</th><th>Remote port</th></tr>
    {rows}
  </table>
  <form method="post" action="/api/immediate-shutdown"><button>Shut down now</button></form>
  <form method="post" action="/api/cancel-shutdown"><button>Cancel scheduled shutdown</button></form>
</body>
</html>
"#,
        pod_running = pod_running,
        pod_start = pod_start.as_deref().unwrap_or("-"),
        pod_uptime = pod_uptime.as_deref().unwrap_or("-"),
        ssh_running = ssh_running,
        endpoint = endpoint
            .map(|e| format!("{}:{}", e.ip, e.port))
            .unwrap_or_else(|| "-".to_string()),
        scheduled_time = scheduled_time.as_deref().unwrap_or("none"),
        countdown = countdown
            .map(|c| format!("(in {c})"))
            .unwrap_or_default(),
        now = format_timestamp(SystemTime::now()),
        rows = rows,
    )
}

pub(crate) fn format_timestamp(at: SystemTime) -> String {
    chrono::DateTime::<chrono::Local>::from(at)
        .format("%m/%d/%Y %H:%M:%S")
        .to_string()
}

/// Format a duration as HH:MM:SS.
pub(crate) fn format_duration(duration: Duration) -> String {
    let raw_seconds = duration.as_secs();
    let hours = raw_seconds / 3600;
    let minutes = (raw_seconds % 3600) / 60;
    let seconds = raw_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// "x.y minutes ago" or "never".
pub(crate) fn format_minutes_ago(at: Option<Instant>) -> String {
    match at {
        Some(t) => format!("{:.1} minutes ago", t.elapsed().as_secs_f64() / 60.0),
        None => "never".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn test_state() -> Arc<GlobalState> {
        GlobalState::new(
            &[
                AppConfig {
                    name: "control".to_string(),
                    local_port: 8080,
                    remote_port: 0,
                },
                AppConfig {
                    name: "comfyui".to_string(),
                    local_port: 8188,
                    remote_port: 8188,
                },
            ],
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_duration(Duration::from_secs(59)), "00:00:59");
        assert_eq!(format_duration(Duration::from_secs(3661)), "01:01:01");
        assert_eq!(format_duration(Duration::from_secs(90061)), "25:01:01");
    }

    #[test]
    fn test_format_minutes_ago() {
        assert_eq!(format_minutes_ago(None), "never");
        let s = format_minutes_ago(Some(Instant::now()));
        assert!(s.ends_with("minutes ago"), "unexpected: {s}");
    }

    #[test]
    fn test_schedule_shutdown_validation() {
        let state = test_state();

        let resp = handle_schedule_shutdown(&state, br#"{"shutdown_in_minutes": 5}"#);
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.control_proxy().scheduled_shutdown().is_some());

        state.control_proxy().clear_scheduled_shutdown();

        let resp = handle_schedule_shutdown(&state, br#"{"shutdown_in_minutes": 0}"#);
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.control_proxy().scheduled_shutdown().is_none());

        let resp = handle_schedule_shutdown(&state, br#"{"shutdown_in_minutes": -3}"#);
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = handle_schedule_shutdown(&state, br#"{}"#);
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = handle_schedule_shutdown(&state, b"not json");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_schedule_shutdown_rejects_oversized_delay() {
        // Finite and positive, but far beyond what a timestamp can hold
        let state = test_state();
        for body in [
            br#"{"shutdown_in_minutes": 1e300}"#.as_slice(),
            br#"{"shutdown_in_minutes": 1e19}"#.as_slice(),
        ] {
            let resp = handle_schedule_shutdown(&state, body);
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
        assert!(state.control_proxy().scheduled_shutdown().is_none());
    }

    #[test]
    fn test_render_status_mentions_apps() {
        let state = test_state();
        let html = render_status(&state);
        assert!(html.contains("comfyui"));
        assert!(html.contains("control"));
        assert!(html.contains("Pod running: false"));
        assert!(html.contains("never"));
    }

    #[test]
    fn test_render_status_with_scheduled_shutdown() {
        let state = test_state();
        state
            .control_proxy()
            .set_scheduled_shutdown(SystemTime::now() + Duration::from_secs(300));
        let html = render_status(&state);
        assert!(html.contains("(in 00:0"));
    }

    #[test]
    fn test_starting_page() {
        let resp = starting_page("comfyui");
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

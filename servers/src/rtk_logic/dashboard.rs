//! # Status Dashboard
//!
//! A read-only HTTP view of the status table: an HTML page at `/`, the same
//! data as JSON at `/status`, and a plain `/health` probe.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Local};
use tokio::net::TcpListener;

use lib_common::core::{StatusSnapshot, StatusTracker};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone)]
struct DashboardState {
    tracker: Arc<StatusTracker>,
}

/// Builds the dashboard router over `tracker`.
pub fn router(tracker: Arc<StatusTracker>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(DashboardState { tracker })
}

/// Serves the dashboard on `0.0.0.0:port` until `shutdown_guard` is cancelled.
pub async fn serve(
    port: u16,
    tracker: Arc<StatusTracker>,
    shutdown_guard: tokio_graceful::ShutdownGuard,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Dashboard listening");

    axum::serve(listener, router(tracker))
        .with_graceful_shutdown(async move { shutdown_guard.cancelled().await })
        .await?;
    tracing::info!("Dashboard stopped");
    Ok(())
}

async fn index_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Html(render_html(&state.tracker.snapshot()))
}

async fn status_handler(State(state): State<DashboardState>) -> Json<StatusSnapshot> {
    Json(state.tracker.snapshot())
}

async fn health_handler() -> &'static str {
    "OK"
}

fn format_time(time: Option<&DateTime<Local>>) -> String {
    time.map_or_else(|| "-".to_string(), |t| t.format(TIME_FORMAT).to_string())
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders the snapshot as a small self-refreshing HTML table.
pub fn render_html(snapshot: &StatusSnapshot) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <meta http-equiv=\"refresh\" content=\"5\"><title>RTK relay</title></head><body>\n",
    );
    let _ = writeln!(
        html,
        "<p>Server time: {}<br>Running since: {}</p>",
        format_time(Some(&snapshot.server_time)),
        format_time(Some(&snapshot.started_at))
    );
    html.push_str("<table border=\"1\">\n<tr><th>Service</th><th>State</th><th>Last received</th></tr>\n");
    for row in &snapshot.services {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(&row.name),
            row.state,
            format_time(row.last_received_at.as_ref())
        );
    }
    html.push_str("</table>\n</body></html>\n");
    html
}

//! Read-only live view of a crawl: an HTML page fed by server-sent events.

use std::convert::Infallible;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};
use usagi::CrawlEvent;

fn to_sse_event(event: &CrawlEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

/// Bind `127.0.0.1:port` and stream every [`CrawlEvent`] sent on `events`.
pub async fn serve(port: u16, events: broadcast::Sender<CrawlEvent>) -> Result<()> {
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { axum::http::StatusCode::NO_CONTENT }),
        )
        .with_state(events);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("could not bind port {port}"))?;
    info!(url = %format!("http://localhost:{port}"), "Live view running");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Live view stopped");
        }
    });
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn sse_handler(
    State(events): State<broadcast::Sender<CrawlEvent>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(events.subscribe())
        .filter_map(|result| result.ok().map(|event| Ok::<_, Infallible>(to_sse_event(&event))));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>usagi crawl</title>
<style>
  body { background: #101014; color: #ddd; font: 13px/1.5 ui-monospace, monospace; margin: 24px; }
  h1 { font: 600 18px system-ui, sans-serif; color: #fff; }
  .row { padding: 4px 10px; border-left: 3px solid #3b82f6; margin: 4px 0; background: #16161d; }
  .planning { border-color: #6366f1; }
  .failed, .recovered { border-color: #ef4444; color: #fca5a5; }
  .provider_switched { border-color: #f59e0b; color: #fcd34d; }
  .terminated { border-color: #22c55e; color: #86efac; }
</style>
</head>
<body>
  <h1>usagi crawl</h1>
  <div id="log"></div>
<script>
  const log = document.getElementById('log');
  const esc = s => String(s).replace(/&/g, '&amp;').replace(/</g, '&lt;');
  function describe(d) {
    switch (d.event) {
      case 'started': return 'start ' + d.url + ' with ' + d.provider + ': ' + d.goal;
      case 'planning': return 'step ' + d.step + (d.fresh ? ' new state ' : ' seen state ') + d.fingerprint.slice(0, 12) + ' ' + d.url;
      case 'proposed': return '  ' + d.action + (d.source === 'loop_breaker' ? ' (loop breaker)' : '');
      case 'step_finished': return '  #' + d.index + ' ' + (d.action || '(planning)') + (d.success ? ' ok' : ' failed');
      case 'recovered': return '  ' + d.class + ': ' + d.message;
      case 'provider_switched': return 'switched to ' + d.provider;
      case 'terminated': return 'finished: ' + d.reason + ' after ' + d.steps + ' steps, ' + d.states + ' states';
      default: return JSON.stringify(d);
    }
  }
  const es = new EventSource('/events');
  es.onmessage = e => {
    const d = JSON.parse(e.data);
    const div = document.createElement('div');
    div.className = 'row ' + d.event + (d.success === false ? ' failed' : '');
    div.innerHTML = esc(describe(d));
    log.appendChild(div);
    window.scrollTo(0, document.body.scrollHeight);
  };
</script>
</body>
</html>
"##;

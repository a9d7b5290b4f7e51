//! 控制面板 - HTTP 传输层
//!
//! 只负责把操作员的请求翻译成 `ControlSignal`，并把实时概览推给浏览器。
//! 不持有任何流程状态，所有读写都经过 `ControlChannel`。
//!
//! - `GET  /`              简易页面
//! - `GET  /api/snapshot`  当前概览（JSON）
//! - `GET  /api/state`     概览推送（SSE，每 500ms）
//! - `POST /api/control`   控制动作

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::{DelayKind, LotId};
use crate::services::{ControlChannel, ControlSignal, LiveFeed};

/// SSE 推送间隔
const PUSH_INTERVAL: Duration = Duration::from_millis(500);

/// 端口被占用时最多向后尝试的个数
const PORT_PROBE_SPAN: u16 = 5;

/// 控制动作
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    Pause,
    Resume,
    /// 跳过当前 LOT
    Skip,
    /// 跳过指定 LOT：正在处理的立即跳过，其余标记为跳过
    SkipLot { lot: LotId },
    StopAfterCurrent,
    Abort,
    SetDelay { name: String, value: f64 },
    /// 批量调整延迟，键为 `delay_short` 等
    UpdateConfig { config: HashMap<String, f64> },
    /// 切换某个 LOT 的跳过标记；给出 `skip` 时直接设置
    ToggleLot {
        lot: LotId,
        #[serde(default)]
        skip: Option<bool>,
    },
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_lots: Option<Vec<LotId>>,
}

impl ControlResponse {
    fn ok(status: &str) -> Self {
        Self {
            ok: true,
            status: Some(status.to_string()),
            error: None,
            skip_lots: None,
        }
    }

    fn rejected(error: String) -> Self {
        Self {
            ok: false,
            status: None,
            error: Some(error),
            skip_lots: None,
        }
    }
}

pub fn create_router(channel: Arc<ControlChannel>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/snapshot", get(snapshot))
        .route("/api/state", get(state_stream))
        .route("/api/control", post(control))
        .with_state(channel)
}

/// 在 `port..=port+5` 中第一个空闲端口上启动控制面板
pub async fn spawn(channel: Arc<ControlChannel>, port: u16) -> Option<(SocketAddr, JoinHandle<()>)> {
    let listener = bind_first_free(port).await?;
    let addr = listener.local_addr().ok()?;
    let app = create_router(channel);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("⚠️ 控制面板已退出: {}", e);
        }
    });

    info!("🖥️ 控制面板: http://{}", addr);
    Some((addr, handle))
}

async fn bind_first_free(port: u16) -> Option<TcpListener> {
    for candidate in port..=port.saturating_add(PORT_PROBE_SPAN) {
        match TcpListener::bind(("127.0.0.1", candidate)).await {
            Ok(listener) => return Some(listener),
            Err(e) => warn!("端口 {} 不可用: {}", candidate, e),
        }
    }
    warn!(
        "⚠️ 端口 {}-{} 均被占用，控制面板未启动（自动化照常运行）",
        port,
        port.saturating_add(PORT_PROBE_SPAN)
    );
    None
}

// ========== 处理函数 ==========

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn snapshot(State(channel): State<Arc<ControlChannel>>) -> Json<LiveFeed> {
    Json(channel.snapshot())
}

async fn state_stream(
    State(channel): State<Arc<ControlChannel>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold((channel, true, false), |(channel, first, done)| async move {
        if done {
            return None;
        }
        if !first {
            tokio::time::sleep(PUSH_INTERVAL).await;
        }
        let feed = channel.snapshot();
        // 运行结束后推完最后一次就停止
        let done = feed.is_finished;
        let event = match serde_json::to_string(&feed) {
            Ok(json) => Event::default().data(json),
            Err(e) => Event::default().event("error").data(e.to_string()),
        };
        Some((Ok(event), (channel, false, done)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn control(
    State(channel): State<Arc<ControlChannel>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let request: ControlRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ControlResponse::rejected(format!("无效的控制请求: {}", e))),
            )
        }
    };

    match apply(&channel, request) {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(error) => (StatusCode::BAD_REQUEST, Json(ControlResponse::rejected(error))),
    }
}

/// 把控制动作转成信号
pub fn apply(channel: &ControlChannel, request: ControlRequest) -> Result<ControlResponse, String> {
    let response = match request {
        ControlRequest::Pause => {
            channel.send(ControlSignal::Pause);
            ControlResponse::ok("paused")
        }
        ControlRequest::Resume => {
            channel.send(ControlSignal::Resume);
            ControlResponse::ok("resumed")
        }
        ControlRequest::Skip => {
            channel.send(ControlSignal::SkipCurrentLot);
            ControlResponse::ok("skipping")
        }
        ControlRequest::SkipLot { lot } => {
            if channel.snapshot().lot_id == Some(lot) {
                channel.send(ControlSignal::SkipCurrentLot);
                ControlResponse::ok("skipping")
            } else {
                channel.send(ControlSignal::ToggleLotSkip(lot, true));
                with_skip_lots(channel, ControlResponse::ok("marked"))
            }
        }
        ControlRequest::StopAfterCurrent => {
            channel.send(ControlSignal::StopAfterCurrent);
            ControlResponse::ok("stopping")
        }
        ControlRequest::Abort => {
            channel.send(ControlSignal::Abort);
            ControlResponse::ok("aborting")
        }
        ControlRequest::SetDelay { name, value } => {
            let kind: DelayKind = name.parse().map_err(|e| format!("{}", e))?;
            channel.send(ControlSignal::SetDelay(kind, value));
            ControlResponse::ok("updated")
        }
        ControlRequest::UpdateConfig { config } => {
            let mut updates = Vec::with_capacity(config.len());
            for (name, value) in config {
                let kind: DelayKind = name.parse().map_err(|e| format!("{}", e))?;
                updates.push((kind, value));
            }
            for (kind, value) in updates {
                channel.send(ControlSignal::SetDelay(kind, value));
            }
            ControlResponse::ok("updated")
        }
        ControlRequest::ToggleLot { lot, skip } => {
            let skip = skip.unwrap_or_else(|| !channel.is_lot_skipped(lot));
            channel.send(ControlSignal::ToggleLotSkip(lot, skip));
            with_skip_lots(channel, ControlResponse::ok(if skip { "marked" } else { "unmarked" }))
        }
    };
    Ok(response)
}

fn with_skip_lots(channel: &ControlChannel, mut response: ControlResponse) -> ControlResponse {
    response.skip_lots = Some(channel.snapshot().skip_lots);
    response
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="zh">
<head>
<meta charset="utf-8">
<title>RD 付款控制面板</title>
<style>
body { font-family: sans-serif; background: #111; color: #ddd; margin: 24px; }
button { margin: 4px; padding: 6px 14px; }
table { border-collapse: collapse; margin-top: 12px; }
td, th { border: 1px solid #444; padding: 4px 8px; font-size: 13px; }
pre { background: #000; padding: 8px; height: 240px; overflow-y: scroll; }
</style>
</head>
<body>
<h2>RD 付款控制面板</h2>
<div id="summary">连接中...</div>
<div>
  <button onclick="send({action:'pause'})">暂停</button>
  <button onclick="send({action:'resume'})">继续</button>
  <button onclick="send({action:'skip'})">跳过当前 LOT</button>
  <button onclick="send({action:'stop_after_current'})">当前 LOT 完成后停止</button>
  <button onclick="send({action:'abort'})">中止</button>
</div>
<div>
  <label>short <input id="short" size="4"></label>
  <label>medium <input id="medium" size="4"></label>
  <label>long <input id="long" size="4"></label>
  <label>checkbox <input id="checkbox" size="4"></label>
  <button onclick="applyDelays()">应用延迟</button>
</div>
<table><thead><tr><th>LOT</th><th>数量</th><th>付款</th><th>参考号</th><th>备注</th><th></th></tr></thead>
<tbody id="lots"></tbody></table>
<pre id="log"></pre>
<script>
function send(body) {
  fetch('/api/control', {method: 'POST', headers: {'Content-Type': 'application/json'}, body: JSON.stringify(body)});
}
function applyDelays() {
  const config = {};
  for (const name of ['short', 'medium', 'long', 'checkbox']) {
    const v = parseFloat(document.getElementById(name).value);
    if (!isNaN(v)) config['delay_' + name] = v;
  }
  send({action: 'update_config', config});
}
const source = new EventSource('/api/state');
source.onmessage = (e) => {
  const d = JSON.parse(e.data);
  document.getElementById('summary').textContent =
    `${d.phase} | LOT ${d.lot_id ?? '--'} ${d.step} | ${d.percent_complete.toFixed(0)}% | ` +
    `完成 ${d.lots_done} 失败 ${d.lots_failed} 跳过 ${d.lots_skipped} / ${d.lots_total} | ` +
    `内存 ${d.memory_usage_mb} MB | ${d.elapsed_seconds}s` + (d.is_paused ? ' | 已暂停' : '');
  const rows = d.lot_statuses.map(r => {
    const marked = d.skip_lots.includes(r.lot_id);
    return `<tr><td>${r.lot_id}</td><td>${r.expected_count}</td><td>${r.status.pay_status}</td>` +
      `<td>${r.status.reference_id ?? ''}</td><td>${r.status.remarks}</td>` +
      `<td><button onclick="send({action:'toggle_lot',lot:${r.lot_id}})">${marked ? '取消跳过' : '跳过'}</button></td></tr>`;
  });
  document.getElementById('lots').innerHTML = rows.join('');
  const log = document.getElementById('log');
  log.textContent = d.log_tail.join('\n');
  log.scrollTop = log.scrollHeight;
};
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::run_state::MAX_DELAY_SECS;
    use crate::services::{EventRecord, LotOutcomeKind};

    fn request(json: serde_json::Value) -> ControlRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn control_requests_deserialize_by_action() {
        assert_eq!(request(serde_json::json!({"action": "pause"})), ControlRequest::Pause);
        assert_eq!(
            request(serde_json::json!({"action": "toggle_lot", "lot": 4})),
            ControlRequest::ToggleLot { lot: 4, skip: None }
        );
        assert!(serde_json::from_value::<ControlRequest>(serde_json::json!({"action": "reboot"})).is_err());
    }

    #[test]
    fn toggle_lot_flips_the_mark() {
        let channel = ControlChannel::default();
        apply(&channel, ControlRequest::ToggleLot { lot: 3, skip: None }).unwrap();
        assert!(channel.is_lot_skipped(3));
        let response = apply(&channel, ControlRequest::ToggleLot { lot: 3, skip: None }).unwrap();
        assert!(!channel.is_lot_skipped(3));
        assert_eq!(response.skip_lots, Some(vec![]));
    }

    #[test]
    fn set_delay_is_clamped_and_unknown_names_rejected() {
        let channel = ControlChannel::default();
        apply(
            &channel,
            ControlRequest::SetDelay {
                name: "delay_short".into(),
                value: 0.0,
            },
        )
        .unwrap();
        assert_eq!(channel.current_delays().short, DelayKind::Short.minimum());

        let err = apply(
            &channel,
            ControlRequest::SetDelay {
                name: "huge".into(),
                value: 1.0,
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn absurd_delay_is_capped() {
        let channel = ControlChannel::default();
        apply(
            &channel,
            ControlRequest::SetDelay {
                name: "long".into(),
                value: 1e20,
            },
        )
        .unwrap();
        assert_eq!(channel.current_delays().long, MAX_DELAY_SECS);
        assert_eq!(channel.current_delays().duration(DelayKind::Long), Duration::from_secs(300));
    }

    #[test]
    fn skip_lot_for_a_finished_lot_only_marks_it() {
        let channel = ControlChannel::default();
        channel.publish_event(EventRecord::LotStarted { lot_id: 1, index: 0 });
        channel.publish_event(EventRecord::LotFinished {
            lot_id: 1,
            outcome: LotOutcomeKind::Done,
            status: Default::default(),
        });

        apply(&channel, ControlRequest::SkipLot { lot: 1 }).unwrap();
        assert_eq!(channel.current_signal(), None);
        assert!(channel.is_lot_skipped(1));
    }

    #[tokio::test]
    async fn pause_and_resume_flip_the_feed() {
        let channel = Arc::new(ControlChannel::default());
        apply(&channel, ControlRequest::Pause).unwrap();
        assert!(channel.snapshot().is_paused);
        apply(&channel, ControlRequest::Resume).unwrap();
        assert!(!channel.snapshot().is_paused);
    }
}

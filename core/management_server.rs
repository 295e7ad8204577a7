// Copyright 2018-2026 the Som authors. MIT license.

//! Optional HTTP side-channel for operations: health, readiness, metrics,
//! configuration and breaker control. CORS is permissive; the listener is
//! meant for internal tooling, not the public internet.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use http::Method;
use http::Request;
use http::Response;
use http::StatusCode;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::debug;
use log::warn;
use serde_json::json;
use tokio::net::TcpListener;

use crate::cache::CacheStats;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::ModuleSystemConfig;
use crate::errors::AnyError;
use crate::metrics::Metrics;
use crate::metrics::OverallHealth;

type CacheStatsProvider = Arc<dyn Fn() -> CacheStats + Send + Sync>;

/// Everything the endpoints read or mutate, shared with the owning
/// module system.
pub struct ManagementState {
  pub config: Arc<Mutex<ModuleSystemConfig>>,
  pub metrics: Arc<Metrics>,
  pub breakers: Arc<CircuitBreakerManager>,
  pub cache_stats: CacheStatsProvider,
}

pub struct ManagementServer {
  addr: SocketAddr,
  shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
  task: Option<tokio::task::JoinHandle<()>>,
}

impl ManagementServer {
  pub async fn start(
    port: u16,
    state: Arc<ManagementState>,
  ) -> Result<Self, AnyError> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let task = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = &mut shutdown_rx => break,
          accepted = listener.accept() => {
            let (stream, _) = match accepted {
              Ok(accepted) => accepted,
              Err(err) => {
                warn!("management server accept failed: {}", err);
                continue;
              }
            };
            let io = TokioIo::new(stream);
            let state = Arc::clone(&state);
            tokio::spawn(async move {
              let service = service_fn(move |request| {
                let state = Arc::clone(&state);
                async move {
                  Ok::<_, Infallible>(handle(request, state).await)
                }
              });
              let result = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await;
              if let Err(err) = result {
                debug!("management connection error: {}", err);
              }
            });
          }
        }
      }
    });

    debug!("management server listening on {}", addr);
    Ok(Self {
      addr,
      shutdown_tx: Some(shutdown_tx),
      task: Some(task),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.addr
  }

  pub async fn stop(mut self) {
    if let Some(shutdown_tx) = self.shutdown_tx.take() {
      let _ = shutdown_tx.send(());
    }
    if let Some(task) = self.task.take() {
      let _ = task.await;
    }
  }
}

impl Drop for ManagementServer {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

async fn handle(
  request: Request<hyper::body::Incoming>,
  state: Arc<ManagementState>,
) -> Response<Full<Bytes>> {
  let method = request.method().clone();
  let path = request.uri().path().to_string();

  if method == Method::OPTIONS {
    return with_cors(
      Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Full::new(Bytes::new()))
        .unwrap(),
    );
  }

  let response = match (method, path.as_str()) {
    (Method::GET, "/health") => health(&state),
    (Method::GET, "/health/ready") => readiness(&state),
    (Method::GET, "/metrics") => {
      let snapshot = state.metrics.snapshot((state.cache_stats)());
      json_response(StatusCode::OK, &json!(snapshot))
    }
    (Method::GET, "/config") => {
      let snapshot = state.config.lock().unwrap().clone();
      json_response(StatusCode::OK, &json!(snapshot))
    }
    (Method::POST, "/config") | (Method::PUT, "/config") => {
      match read_json_body(request).await {
        Ok(updates) => update_config(&state, &updates),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
      }
    }
    (Method::GET, "/circuit-breakers") => json_response(
      StatusCode::OK,
      &json!({ "breakers": state.breakers.statuses() }),
    ),
    (Method::POST, "/circuit-breakers") => {
      match read_json_body(request).await {
        Ok(body) => breaker_action(&state, &body),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
      }
    }
    (Method::POST, "/admin/reset") => {
      state.metrics.reset();
      state.breakers.reset_all();
      json_response(StatusCode::OK, &json!({ "reset": true }))
    }
    _ => error_response(StatusCode::NOT_FOUND, "not found"),
  };
  with_cors(response)
}

fn health(state: &ManagementState) -> Response<Full<Bytes>> {
  let memory_limit = state
    .config
    .lock()
    .unwrap()
    .resource_limits
    .max_memory_bytes;
  let report = state.metrics.health((state.cache_stats)(), memory_limit);
  let status = match report.status {
    OverallHealth::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    _ => StatusCode::OK,
  };
  json_response(
    status,
    &json!({
      "status": report.status,
      "checks": report.checks,
      "circuitBreakers": state.breakers.statuses(),
    }),
  )
}

fn readiness(state: &ManagementState) -> Response<Full<Bytes>> {
  let open = state.breakers.open_count();
  if open == 0 {
    json_response(StatusCode::OK, &json!({ "ready": true }))
  } else {
    json_response(
      StatusCode::SERVICE_UNAVAILABLE,
      &json!({ "ready": false, "openBreakers": open }),
    )
  }
}

fn update_config(
  state: &ManagementState,
  updates: &serde_json::Value,
) -> Response<Full<Bytes>> {
  let mut config = state.config.lock().unwrap();
  match config.with_updates(updates) {
    Ok(updated) => {
      *config = updated;
      json_response(StatusCode::OK, &json!(config.clone()))
    }
    Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
  }
}

fn breaker_action(
  state: &ManagementState,
  body: &serde_json::Value,
) -> Response<Full<Bytes>> {
  match body.get("type").and_then(|t| t.as_str()) {
    Some("reset") => {
      match body.get("moduleId").and_then(|id| id.as_str()) {
        Some(module_id) => {
          let reset = state.breakers.reset(module_id);
          if reset {
            json_response(StatusCode::OK, &json!({ "reset": module_id }))
          } else {
            error_response(
              StatusCode::NOT_FOUND,
              &format!("no circuit breaker for \"{}\"", module_id),
            )
          }
        }
        None => {
          state.breakers.reset_all();
          json_response(StatusCode::OK, &json!({ "reset": "all" }))
        }
      }
    }
    _ => error_response(
      StatusCode::BAD_REQUEST,
      "unsupported action; expected {\"type\":\"reset\"}",
    ),
  }
}

async fn read_json_body(
  request: Request<hyper::body::Incoming>,
) -> Result<serde_json::Value, AnyError> {
  let body = request.into_body().collect().await?.to_bytes();
  Ok(serde_json::from_slice(&body)?)
}

fn json_response(
  status: StatusCode,
  body: &serde_json::Value,
) -> Response<Full<Bytes>> {
  Response::builder()
    .status(status)
    .header(http::header::CONTENT_TYPE, "application/json")
    .body(Full::new(Bytes::from(body.to_string())))
    .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
  json_response(status, &json!({ "error": message }))
}

fn with_cors(mut response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
  let headers = response.headers_mut();
  headers.insert(
    http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
    http::HeaderValue::from_static("*"),
  );
  headers.insert(
    http::header::ACCESS_CONTROL_ALLOW_METHODS,
    http::HeaderValue::from_static("GET, POST, PUT, OPTIONS"),
  );
  headers.insert(
    http::header::ACCESS_CONTROL_ALLOW_HEADERS,
    http::HeaderValue::from_static("Content-Type"),
  );
  response
}

#[cfg(test)]
mod tests {
  use tokio::io::AsyncReadExt;
  use tokio::io::AsyncWriteExt;

  use super::*;
  use crate::circuit_breaker::CircuitBreakerConfig;

  fn test_state() -> Arc<ManagementState> {
    let metrics = Arc::new(Metrics::new());
    Arc::new(ManagementState {
      config: Arc::new(Mutex::new(ModuleSystemConfig::new("/project"))),
      metrics: Arc::clone(&metrics),
      breakers: Arc::new(CircuitBreakerManager::new(
        CircuitBreakerConfig::default(),
        Some(metrics),
      )),
      cache_stats: Arc::new(CacheStats::default),
    })
  }

  async fn request(addr: SocketAddr, raw: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
  }

  async fn get(addr: SocketAddr, path: &str) -> String {
    request(
      addr,
      &format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
      ),
    )
    .await
  }

  async fn post(addr: SocketAddr, path: &str, body: &str) -> String {
    request(
      addr,
      &format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: \
         application/json\r\nContent-Length: {}\r\nConnection: \
         close\r\n\r\n{}",
        path,
        body.len(),
        body
      ),
    )
    .await
  }

  #[tokio::test]
  async fn health_endpoint_reports_checks() {
    let server = ManagementServer::start(0, test_state()).await.unwrap();
    let response = get(server.local_addr(), "/health").await;
    assert!(response.contains("HTTP/1.1 200"));
    assert!(response.contains("\"checks\""));
    assert!(response.contains("access-control-allow-origin: *"));
    server.stop().await;
  }

  #[tokio::test]
  async fn readiness_fails_with_open_breakers() {
    let state = test_state();
    for _ in 0..5 {
      state.breakers.record_failure("external:db");
    }
    let server = ManagementServer::start(0, state).await.unwrap();
    let response = get(server.local_addr(), "/health/ready").await;
    assert!(response.contains("HTTP/1.1 503"));
    assert!(response.contains("\"ready\":false"));
    server.stop().await;
  }

  #[tokio::test]
  async fn metrics_endpoint_returns_snapshot() {
    let server = ManagementServer::start(0, test_state()).await.unwrap();
    let response = get(server.local_addr(), "/metrics").await;
    assert!(response.contains("HTTP/1.1 200"));
    assert!(response.contains("\"uptimeSeconds\""));
    assert!(response.contains("\"counters\""));
    server.stop().await;
  }

  #[tokio::test]
  async fn config_round_trips_updates() {
    let state = test_state();
    let server = ManagementServer::start(0, Arc::clone(&state)).await.unwrap();
    let response = post(
      server.local_addr(),
      "/config",
      r#"{"loading":{"maxCacheSize":77}}"#,
    )
    .await;
    assert!(response.contains("HTTP/1.1 200"));
    assert_eq!(
      state.config.lock().unwrap().loading.max_cache_size,
      77
    );

    let invalid = post(
      server.local_addr(),
      "/config",
      r#"{"loading":{"maxCacheMemory":1}}"#,
    )
    .await;
    assert!(invalid.contains("HTTP/1.1 400"));
    server.stop().await;
  }

  #[tokio::test]
  async fn breaker_reset_action() {
    let state = test_state();
    for _ in 0..5 {
      state.breakers.record_failure("external:db");
    }
    let server = ManagementServer::start(0, Arc::clone(&state)).await.unwrap();
    let response = post(
      server.local_addr(),
      "/circuit-breakers",
      r#"{"type":"reset","moduleId":"external:db"}"#,
    )
    .await;
    assert!(response.contains("HTTP/1.1 200"));
    assert_eq!(state.breakers.open_count(), 0);
    server.stop().await;
  }

  #[tokio::test]
  async fn unknown_paths_are_404() {
    let server = ManagementServer::start(0, test_state()).await.unwrap();
    let response = get(server.local_addr(), "/nope").await;
    assert!(response.contains("HTTP/1.1 404"));
    server.stop().await;
  }

  #[tokio::test]
  async fn admin_reset_clears_metrics() {
    let state = test_state();
    state
      .metrics
      .counters
      .requests
      .store(9, std::sync::atomic::Ordering::Relaxed);
    let server = ManagementServer::start(0, Arc::clone(&state)).await.unwrap();
    let response = post(server.local_addr(), "/admin/reset", "{}").await;
    assert!(response.contains("HTTP/1.1 200"));
    assert_eq!(
      state
        .metrics
        .counters
        .requests
        .load(std::sync::atomic::Ordering::Relaxed),
      0
    );
    server.stop().await;
  }
}

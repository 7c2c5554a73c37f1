//! Per-task HTTP control socket.
//!
//! The preamble's `taskEval`, `nixReplEval` and `taskReloadFlake` post to this
//! socket; requests go through the shared evaluator queue like any other.
use std::path::{Path, PathBuf};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::UnixListener;
use tokio::task::{JoinHandle, JoinSet};
use tower::Service;

use crate::error::{EvaluationError, RunnerError};
use crate::evaluator::EvaluatorHandle;
use crate::task::Task;

/// Variable the socket path is exported under.
pub const CONTROL_SOCKET_ENV: &str = "TASK_CONTROL_SOCKET";

const SOCKET_NAME: &str = "control.sock";

#[derive(Clone)]
struct SocketState {
    evaluator: EvaluatorHandle,
    flake_attribute_path: String,
    original_flake_url: String,
}

#[derive(Debug, Deserialize)]
struct EvalRequest {
    #[serde(default)]
    args: String,
    #[serde(default)]
    environment: Option<Value>,
}

/// A listening control socket. Dropping it stops the server and every open connection.
pub struct ControlSocket {
    path: PathBuf,
    server: JoinHandle<()>,
}

impl ControlSocket {
    /// Listens on `<dir>/control.sock` on behalf of `task`.
    pub fn bind(dir: &Path, evaluator: EvaluatorHandle, task: &Task) -> Result<Self, RunnerError> {
        let path = dir.join(SOCKET_NAME);
        let listener = UnixListener::bind(&path).map_err(|e| {
            RunnerError::Environment(format!("control socket {}: {e}", path.display()))
        })?;
        let app = router(SocketState {
            evaluator,
            flake_attribute_path: task.flake_attribute_path.clone(),
            original_flake_url: task.original_flake_url.clone(),
        });
        let server = tokio::spawn(serve(listener, app, task.id.clone()));
        tracing::debug!(task_id = %task.id, path = %path.display(), "control socket listening");
        Ok(Self { path, server })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn router(state: SocketState) -> Router {
    Router::new()
        .route("/eval", post(eval_handler))
        .route("/evalRaw", post(eval_raw_handler))
        .route("/reloadFlake", post(reload_flake_handler))
        .with_state(state)
}

async fn serve(listener: UnixListener, app: Router, task_id: String) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error.kind = "control_socket.accept", error.message = %e);
                        break;
                    }
                };
                let app = app.clone();
                connections.spawn(async move {
                    let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                        app.clone().call(request)
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::debug!(error = %e, "control socket connection ended");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// POST /eval: applies the task's own attribute to `args`, with the caller's environment.
async fn eval_handler(State(state): State<SocketState>, body: String) -> Response {
    let request: EvalRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let command = format!("({}) {}", request.args, state.flake_attribute_path);
    reply(
        state
            .evaluator
            .eval_with_environment(command, request.environment)
            .await,
    )
}

/// POST /evalRaw: the body is sent to the evaluator as is.
async fn eval_raw_handler(State(state): State<SocketState>, body: String) -> Response {
    reply(state.evaluator.eval(body).await)
}

/// POST /reloadFlake
async fn reload_flake_handler(State(state): State<SocketState>) -> Response {
    let command = format!(":lf {}#", state.original_flake_url);
    match state.evaluator.eval(command).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn reply(result: Result<Option<Value>, EvaluationError>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, render_value(value)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Objects and lists as compact JSON; scalars as text with a trailing newline.
fn render_value(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => format!("{s}\n"),
        Some(v @ (Value::Object(_) | Value::Array(_))) => v.to_string(),
        Some(v) => format!("{v}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvaluatorConfig;
    use crate::evaluator::EvaluatorDriver;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    /// Answers every line with `"got:<line>"`; lines containing `broken` get a diagnostic instead.
    async fn echo_evaluator() -> EvaluatorDriver {
        let (drv_in, fake_in) = tokio::io::duplex(8192);
        let (mut fake_out, drv_out) = tokio::io::duplex(8192);
        let (mut fake_err, drv_err) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            fake_err.write_all(b"ready\n").await.unwrap();
            let mut lines = BufReader::new(fake_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains("broken") {
                    fake_err.write_all(b"error: undefined variable\n").await.unwrap();
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    fake_out.write_all(b"\n").await.unwrap();
                } else {
                    let body = serde_json::to_string(&format!("got:{line}")).unwrap();
                    fake_out.write_all(format!("{body}\n").as_bytes()).await.unwrap();
                }
            }
        });
        let cfg = EvaluatorConfig {
            startup_marker: "ready".into(),
            ..EvaluatorConfig::default()
        };
        EvaluatorDriver::start(drv_in, drv_out, drv_err, &cfg).await.unwrap()
    }

    async fn send(path: &Path, route: &str, body: &str) -> (u16, String) {
        let mut stream = UnixStream::connect(path).await.unwrap();
        let request = format!(
            "POST {route} HTTP/1.1\r\nHost: ctrl\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        let status = raw[9..12].parse().unwrap();
        let body = raw.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
        (status, body)
    }

    #[tokio::test]
    async fn routes_requests_through_the_evaluator() {
        let dir = tempfile::tempdir().unwrap();
        let driver = echo_evaluator().await;
        let mut t = crate::task::fixtures::task("app", &[]);
        t.flake_attribute_path = "tasks.x86_64-linux.app".into();
        t.original_flake_url = "github:acme/infra".into();

        let socket = ControlSocket::bind(dir.path(), driver.handle(), &t).unwrap();
        assert_eq!(socket.path(), dir.path().join("control.sock"));

        let (status, body) = send(socket.path(), "/evalRaw", "1 + 1").await;
        assert_eq!((status, body.as_str()), (200, "got:1 + 1\n"));

        let (status, body) = send(
            socket.path(),
            "/eval",
            r#"{"args":"x: x.name","environment":{"STAGE":"dev"}}"#,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(
            body,
            "got:let __environment = builtins.fromJSON \"{\\\"STAGE\\\":\\\"dev\\\"}\"; in ((x: x.name) tasks.x86_64-linux.app)\n"
        );

        let (status, body) = send(socket.path(), "/reloadFlake", "").await;
        assert_eq!((status, body.as_str()), (200, ""));

        let (status, body) = send(socket.path(), "/evalRaw", "broken").await;
        assert_eq!(status, 500);
        assert!(body.contains("undefined variable"));

        let (status, _) = send(socket.path(), "/eval", "not json").await;
        assert_eq!(status, 400);

        let (status, _) = send(socket.path(), "/nothing", "").await;
        assert_eq!(status, 404);
    }

    #[test]
    fn values_render_like_shell_output() {
        assert_eq!(render_value(Some(json!("hi"))), "hi\n");
        assert_eq!(render_value(Some(json!(3))), "3\n");
        assert_eq!(render_value(Some(json!({ "a": 1 }))), r#"{"a":1}"#);
        assert_eq!(render_value(None), "null");
    }
}

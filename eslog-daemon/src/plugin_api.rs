//! Docker logging-plugin HTTP API over a unix socket.
//!
//! Every endpoint is a POST with a JSON body and a JSON answer using the
//! plugin content type.
//!
//! | Path | Request | Response |
//! |------|---------|----------|
//! | `/Plugin.Activate` | - | `{"Implements":["LoggingDriver"]}` |
//! | `/LogDriver.StartLogging` | `{"File","Info"}` | `{"Err":""}` |
//! | `/LogDriver.StopLogging` | `{"File"}` | `{"Err":""}` |
//! | `/LogDriver.Capabilities` | - | `{"Cap":{"ReadLogs":false}}` |
//! | `/LogDriver.ReadLogs` | - | 501 |

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use eslog_core::types::ContainerInfo;
use eslog_log_pipeline::{Capabilities, LoggingDriver};

/// Content type of every plugin response.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1+json";

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

const MISSING_CONTAINER_ID: &str = "must provide container id in log context";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartLoggingRequest {
    file: String,
    #[serde(default)]
    info: ContainerInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StopLoggingRequest {
    file: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ErrResponse {
    err: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CapabilitiesResponse {
    cap: Capabilities,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ActivateResponse {
    implements: [&'static str; 1],
}

/// Bind the plugin socket, replacing a stale socket file left by a previous run.
pub fn bind(path: impl AsRef<Path>) -> io::Result<UnixListener> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale plugin socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Accept plugin connections until `shutdown` fires.
///
/// Connections still open at shutdown are aborted.
pub async fn serve<D: LoggingDriver>(
    listener: UnixListener,
    driver: Arc<D>,
    shutdown: CancellationToken,
) -> Result<()> {
    let server = hyper::server::conn::http1::Builder::new();
    let mut connections = JoinSet::new();

    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "plugin socket accept failed");
                    return Err(e.into());
                }
            },
            Some(finished) = connections.join_next() => {
                match finished {
                    Err(e) if e.is_panic() => {
                        error!(error = %e, "plugin connection handler panicked");
                    }
                    _ => {}
                }
                continue;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let server = server.clone();
        let driver = Arc::clone(&driver);
        connections.spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let driver = Arc::clone(&driver);
                async move { handle(driver.as_ref(), req).await }
            });
            if let Err(e) = server.serve_connection(io, service).await {
                debug!(error = %e, "plugin connection closed with error");
            }
        });
    }

    connections.shutdown().await;
    info!("plugin API stopped");
    Ok(())
}

/// Route one plugin request.
pub async fn handle<D, B>(driver: &D, req: Request<B>) -> Result<Response<Full<Bytes>>, hyper::http::Error>
where
    D: LoggingDriver,
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_owned();
    let known = matches!(
        path.as_str(),
        "/Plugin.Activate"
            | "/LogDriver.StartLogging"
            | "/LogDriver.StopLogging"
            | "/LogDriver.Capabilities"
            | "/LogDriver.ReadLogs"
    );
    if !known {
        return reply(StatusCode::NOT_FOUND, &err_body(format!("unknown endpoint {path}")));
    }
    if req.method() != Method::POST {
        return reply(
            StatusCode::METHOD_NOT_ALLOWED,
            &err_body(format!("{} not allowed", req.method())),
        );
    }

    match path.as_str() {
        "/Plugin.Activate" => reply(
            StatusCode::OK,
            &ActivateResponse {
                implements: ["LoggingDriver"],
            },
        ),
        "/LogDriver.Capabilities" => reply(
            StatusCode::OK,
            &CapabilitiesResponse {
                cap: driver.capabilities(),
            },
        ),
        "/LogDriver.ReadLogs" => reply(
            StatusCode::NOT_IMPLEMENTED,
            &err_body("reading logs is not supported by this driver"),
        ),
        "/LogDriver.StartLogging" => {
            let request: StartLoggingRequest = match decode(req.into_body()).await {
                Ok(r) => r,
                Err(reason) => return reply(StatusCode::BAD_REQUEST, &err_body(reason)),
            };
            if request.info.container_id.is_empty() {
                warn!(file = %request.file, "StartLogging without container id");
                return reply(StatusCode::OK, &err_body(MISSING_CONTAINER_ID));
            }
            let result = driver.start_logging(&request.file, &request.info).await;
            reply(StatusCode::OK, &result_body(result))
        }
        "/LogDriver.StopLogging" => {
            let request: StopLoggingRequest = match decode(req.into_body()).await {
                Ok(r) => r,
                Err(reason) => return reply(StatusCode::BAD_REQUEST, &err_body(reason)),
            };
            let result = driver.stop_logging(&request.file).await;
            reply(StatusCode::OK, &result_body(result))
        }
        _ => reply(StatusCode::NOT_FOUND, &err_body(format!("unknown endpoint {path}"))),
    }
}

async fn decode<T, B>(body: B) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| format!("could not read request body: {e}"))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| format!("could not decode payload: {e}"))
}

fn err_body(err: impl Into<String>) -> ErrResponse {
    ErrResponse { err: err.into() }
}

fn result_body<E: std::fmt::Display>(result: Result<(), E>) -> ErrResponse {
    err_body(result.err().map(|e| e.to_string()).unwrap_or_default())
}

fn reply<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let json = match serde_json::to_vec(body) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "could not encode plugin response");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header(CONTENT_TYPE, PLUGIN_CONTENT_TYPE)
                .body(Full::new(Bytes::from_static(b"{\"Err\":\"internal error\"}")));
        }
    };
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, PLUGIN_CONTENT_TYPE)
        .body(Full::new(Bytes::from(json)))
}

//! Main axum router and the git smart HTTP request handler.
//!
//! Routes:
//! - `ANY  <health_path>`                    - Liveness check
//! - `GET  /:app[.git]/info/refs?service=..` - Ref advertisement
//! - `POST /:app[.git]/git-upload-pack`      - Fetch negotiation / pack data
//! - `POST /:app[.git]/git-receive-pack`     - Push (runs the deploy hook)
//!
//! Anything else is answered with 403, which is what git clients expect when
//! a smart HTTP service is not offered.
//!
//! A git request goes through routing, auth, app lookup and repository
//! preparation, each of which can still fail with a proper status code.  Once
//! the subprocess is running the 200 is sent and a streaming task takes over
//! the repository and the subprocess; from then on failures are only logged.

use std::io;
use std::io::Write as _;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::any,
};
use flate2::read::GzDecoder;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::ChildStdin;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{Instrument, Span, debug, error, field, info, instrument, warn};
use uuid::Uuid;

use super::pktline::{FlushingWriter, ResponseSink, encode_flush, encode_line};
use super::router::{self, Handler};
use crate::AppState;
use crate::auth::parse_basic_auth;
use crate::cache::WorkingRepo;
use crate::directory::AppId;
use crate::git::{self, GitProcess, Rpc};

/// Response chunks buffered between the streaming task and the HTTP body.
const RESPONSE_CHANNEL_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.health_path, any(crate::health::health_handler))
        .fallback(handle_git)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Entry point for every request that is not the health check.
#[instrument(
    skip_all,
    fields(
        request_id = %Uuid::new_v4(),
        %method,
        path = %uri.path(),
        app = field::Empty,
        service = field::Empty,
    )
)]
async fn handle_git(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    // 1. Match a service and a valid app name.
    let Some(route) = router::route(&method, uri.path()) else {
        debug!("no git service at this path");
        return Err(AppError::Forbidden);
    };

    // 2. Shared-secret Basic auth; the user name is ignored.
    let creds = parse_basic_auth(&headers);
    if !creds
        .as_ref()
        .is_some_and(|c| state.secret.verify(&c.password))
    {
        debug!(
            user = creds.as_ref().map(|c| c.username.as_str()),
            "missing or invalid credentials"
        );
        return Err(AppError::Unauthorized);
    }

    // 3. Resolve the app.
    let app = match state.directory.lookup(&route.app_name).await {
        Ok(Some(app)) => app,
        Ok(None) => {
            debug!(app_name = %route.app_name, "unknown app");
            return Err(AppError::NotFound("unknown app"));
        }
        Err(e) => return Err(AppError::internal("get_app", e)),
    };
    Span::current().record("app", app.as_str());

    // 4. Settle which service runs before touching the blob store.
    let rpc = match route.service.rpc {
        Some(rpc) => rpc,
        None => {
            let service = Query::<InfoRefsQuery>::try_from_uri(&uri)
                .ok()
                .and_then(|Query(q)| q.service);
            // The dumb protocol is not supported.
            service
                .as_deref()
                .and_then(Rpc::from_service)
                .ok_or(AppError::NotFound("Not Found"))?
        }
    };
    Span::current().record("service", rpc.name());

    // 5. Materialize the working repository.
    let repo = state
        .repos
        .prepare(app.as_str())
        .await
        .map_err(|e| AppError::internal("prepare_repo", e))?;

    let exchange = Exchange {
        state: Arc::clone(&state),
        rpc,
        app,
        repo,
    };
    match route.service.handler {
        Handler::InfoRefs => exchange.start_advertisement(),
        Handler::Rpc => exchange.start_rpc(&headers, body).await,
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// A prepared request: the app, the service and the repository it runs in.
struct Exchange {
    state: Arc<AppState>,
    rpc: Rpc,
    app: AppId,
    repo: WorkingRepo,
}

impl Exchange {
    /// `GET .../info/refs`: start `--advertise-refs` and stream its output
    /// behind the `# service=` header.
    fn start_advertisement(self) -> Result<Response, AppError> {
        let mut process =
            git::spawn_stateless_rpc(self.rpc, self.repo.path(), self.app.as_str(), true)
                .map_err(|e| AppError::internal("handle_get_info_refs", e))?;
        let output = take_output(&mut process, "handle_get_info_refs")?;

        let content_type = format!("application/x-{}-advertisement", self.rpc.name());
        Ok(self.stream(Handler::InfoRefs, process, output, &content_type))
    }

    /// `POST .../git-<service>`: feed the request body to the subprocess,
    /// then stream its output.
    async fn start_rpc(self, headers: &HeaderMap, body: Body) -> Result<Response, AppError> {
        let mut process =
            git::spawn_stateless_rpc(self.rpc, self.repo.path(), self.app.as_str(), false)
                .map_err(|e| AppError::internal("handle_post_rpc", e))?;
        let output = take_output(&mut process, "handle_post_rpc")?;
        let stdin = process.take_stdin().ok_or_else(|| {
            AppError::internal("handle_post_rpc", anyhow!("subprocess has no stdin"))
        })?;

        let gzip = headers
            .get(header::CONTENT_ENCODING)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"));
        let written = copy_request_body(body, gzip, stdin)
            .await
            .map_err(|e| AppError::internal("handle_post_rpc write to subprocess", e))?;
        debug!(bytes = written, gzip, "request body delivered");

        let content_type = format!("application/x-{}-result", self.rpc.name());
        Ok(self.stream(Handler::Rpc, process, output, &content_type))
    }

    /// Commit the 200 and hand everything to a streaming task.
    ///
    /// The task is tracked in [`AppState::tasks`] so shutdown waits for the
    /// snapshot upload and directory removal that follow the response.
    fn stream(
        self,
        kind: Handler,
        process: GitProcess,
        output: pipe::Receiver,
        content_type: &str,
    ) -> Response {
        let (sink, rx) = ResponseSink::channel(RESPONSE_CHANNEL_DEPTH);
        let tasks = self.state.tasks.clone();
        tasks.spawn(self.run(kind, process, output, sink).instrument(Span::current()));

        let body = Body::from_stream(ReceiverStream::new(rx));
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response()
    }

    /// Streaming task: relay output, finish the response, release the
    /// subprocess, persist after a push and remove the working repository.
    async fn run(
        mut self,
        kind: Handler,
        mut process: GitProcess,
        output: pipe::Receiver,
        sink: ResponseSink,
    ) {
        let mut writer = FlushingWriter::new(sink);
        match kind {
            Handler::InfoRefs => {
                match write_service_header(&mut writer, self.rpc).await {
                    Ok(()) => {
                        relay(&mut process, output, &mut writer, "handle_get_info_refs").await;
                    }
                    Err(e) => error!(op = "handle_get_info_refs response", error = %e),
                }
            }
            Handler::Rpc => relay(&mut process, output, &mut writer, "handle_post_rpc").await,
        }

        let mut sink = writer.into_inner();
        if let Err(e) = sink.shutdown().await {
            debug!(error = %e, "response body already closed");
        }
        drop(sink);
        process.cleanup();

        if kind == Handler::Rpc && self.rpc == Rpc::ReceivePack {
            if let Err(e) = self.state.repos.persist(&self.repo).await {
                error!(
                    app_id = %self.app,
                    error = %format!("{e:#}"),
                    "failed to store repository snapshot"
                );
            }
        }

        if let Err(e) = self.repo.discard().await {
            warn!(error = %format!("{e:#}"), "failed to remove working repository");
        }
    }
}

fn take_output(process: &mut GitProcess, op: &'static str) -> Result<pipe::Receiver, AppError> {
    process
        .take_output()
        .ok_or_else(|| AppError::internal(op, anyhow!("subprocess output already taken")))
}

async fn write_service_header<W>(w: &mut W, rpc: Rpc) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    encode_line(w, format!("# service={}\n", rpc.name()).as_bytes()).await?;
    encode_flush(w).await
}

/// Copy subprocess output to the response, then wait for the subprocess.
async fn relay(
    process: &mut GitProcess,
    mut output: pipe::Receiver,
    writer: &mut FlushingWriter<ResponseSink>,
    op: &'static str,
) {
    match tokio::io::copy(&mut output, writer).await {
        Ok(bytes) => debug!(bytes, "subprocess output relayed"),
        Err(e) => {
            error!(op = %format!("{op} read from subprocess"), error = %e);
            return;
        }
    }
    match process.wait().await {
        Ok(()) => info!("git exchange complete"),
        Err(e) => error!(op = %format!("{op} wait for subprocess"), error = %format!("{e:#}")),
    }
}

/// Write the request body to the subprocess stdin, decompressing it first
/// when it is gzip-encoded.  Stdin is closed on return.
async fn copy_request_body(body: Body, gzip: bool, mut stdin: ChildStdin) -> anyhow::Result<u64> {
    let stream = body.into_data_stream().map_err(io::Error::other);
    let mut reader = StreamReader::new(Box::pin(stream));

    if !gzip {
        let n = tokio::io::copy(&mut reader, &mut stdin)
            .await
            .context("failed to copy request body")?;
        stdin.shutdown().await.context("failed to close stdin")?;
        return Ok(n);
    }

    let src = SyncIoBridge::new(reader);
    let mut dst = SyncIoBridge::new(stdin);
    tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
        let mut decoder = GzDecoder::new(src);
        let n = io::copy(&mut decoder, &mut dst).context("failed to decompress request body")?;
        dst.flush().context("failed to flush stdin")?;
        Ok(n)
    })
    .await
    .context("decompress task panicked")?
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failures that still decide the response status.
#[derive(Debug)]
pub enum AppError {
    Forbidden,
    Unauthorized,
    NotFound(&'static str),
    Internal {
        op: &'static str,
        source: anyhow::Error,
    },
}

impl AppError {
    fn internal(op: &'static str, source: anyhow::Error) -> Self {
        Self::Internal { op, source }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"))],
                "Authentication required",
            )
                .into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Internal { op, source } => {
                error!(op, error = %format!("{source:#}"), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

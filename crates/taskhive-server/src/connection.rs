use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use libtaskhive::SharedCoordinator;
use taskhive_protocol::StatusCode;

use crate::routes::{self, ApiError, RouteArgs};
use crate::wire::{self, Request, WireError};

#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_body_bytes: usize,
    pub read_timeout: Duration,
}

/// Serve exactly one request on `stream`, then close it.
pub async fn handle_client<S>(stream: S, state: SharedCoordinator, limits: ConnectionLimits)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let request = match timeout(
        limits.read_timeout,
        wire::read_request(&mut reader, limits.max_body_bytes),
    )
    .await
    {
        Ok(request) => request,
        Err(_) => {
            debug!("client timed out before sending a full request");
            return;
        }
    };

    let (status, body) = match request {
        Ok(request) => dispatch(request, &state).await,
        Err(WireError::Io(e)) => {
            debug!("read error: {e}");
            return;
        }
        Err(e) => {
            warn!("rejected request: {e}");
            let err = ApiError::from(e);
            (err.status, err.body)
        }
    };

    if let Err(e) = writer.write_all(&wire::encode_response(status, &body)).await {
        error!("write error: {e}");
        return;
    }
    let _ = writer.shutdown().await;
}

async fn dispatch(request: Request, state: &SharedCoordinator) -> (StatusCode, Value) {
    let Some((handler, params)) = routes::resolve(request.method, &request.path) else {
        let err = ApiError::not_found(request.method, &request.path);
        return (err.status, err.body);
    };

    let args = RouteArgs {
        params,
        query: request.query,
        body: request.body,
    };
    let result = {
        let mut coord = state.lock().await;
        handler(&mut coord, args)
    };

    match result {
        Ok(body) => (StatusCode::Ok, body),
        Err(err) => {
            debug!(
                method = request.method.as_str(),
                path = %request.path,
                status = err.status.code(),
                "request failed"
            );
            (err.status, err.body)
        }
    }
}

#[cfg(test)]
mod tests {
    use libtaskhive::{BacklogFile, Coordinator, CoordinatorConfig};
    use tokio::io::{AsyncReadExt, duplex};

    use super::*;

    const LIMITS: ConnectionLimits = ConnectionLimits {
        max_body_bytes: 1024,
        read_timeout: Duration::from_secs(5),
    };

    async fn roundtrip(state: &SharedCoordinator, raw: &[u8]) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let handle = tokio::spawn(handle_client(server, state.clone(), LIMITS));
        client.write_all(raw).await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        handle.await.unwrap();
        out
    }

    fn shared(dir: &std::path::Path) -> SharedCoordinator {
        Coordinator::open(BacklogFile::in_state_dir(dir), CoordinatorConfig::default())
            .unwrap()
            .into_shared()
    }

    #[tokio::test]
    async fn serves_one_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = shared(dir.path());
        let out = roundtrip(&state, b"GET /status HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("\"total_tasks\":0"));
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = shared(dir.path());
        let out = roundtrip(&state, b"DELETE /status HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let dir = tempfile::tempdir().unwrap();
        let state = shared(dir.path());
        let out = roundtrip(
            &state,
            b"POST /task/create HTTP/1.1\r\nContent-Length: 4096\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }
}

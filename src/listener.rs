// Listeners - the two ways messages arrive
//
// TCP: newline-delimited text, one message per line. Lines of one connection
//      are handled in order; connections run in parallel.
// HTTP: any method, any path, one message per request body. The request is
//       answered right away; processing continues in its own task.
//
// Nothing is rejected here (apart from oversized lines and bodies). Parsing and
// validation happen in the pipeline, and the sender never hears about them.

use crate::pipeline::Pipeline;
use anyhow::Result;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::any;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;

pub async fn serve_tcp(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    max_line_bytes: usize,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "tcp listener started");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("tcp accept failed: {}", e);
                continue;
            }
        };

        // One task per client
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            tracing::debug!(%peer, "client connected");
            match read_lines(socket, &pipeline, max_line_bytes).await {
                Ok(lines) => tracing::debug!(%peer, lines, "client disconnected"),
                Err(e) => tracing::warn!(%peer, "connection error: {}", e),
            }
        });
    }
}

/// Feed every line of `reader` to the pipeline, in order.
/// Lines longer than `max_line_bytes` are skipped up to the next newline.
/// Returns the number of messages handed over.
pub async fn read_lines<R>(
    reader: R,
    pipeline: &Pipeline,
    max_line_bytes: usize,
) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut handled = 0;

    loop {
        match read_bounded_line(&mut reader, &mut buf, max_line_bytes).await? {
            LineRead::Eof => return Ok(handled),
            LineRead::TooLong(len) => {
                tracing::warn!(len, max_line_bytes, "line too long, discarded");
                continue;
            }
            LineRead::Line => {}
        }

        // DESIGN CHOICE: Lossy UTF-8
        // A stray invalid byte should not cost the whole line
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }

        pipeline.ingest(line).await;
        handled += 1;
    }
}

enum LineRead {
    Line,
    /// Line exceeded the limit and was consumed without being kept
    TooLong(usize),
    Eof,
}

/// Read up to the next newline, never buffering more than `max_size` bytes
/// (plus the newline itself).
async fn read_bounded_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_size: usize,
) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut total = 0;
    let mut too_long = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }

        let (take, done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        let content = if done { take - 1 } else { take };
        if !too_long && buf.len() + content <= max_size {
            buf.extend_from_slice(&available[..take]);
        } else {
            too_long = true;
            buf.clear();
        }

        total += take;
        reader.consume(take);
        if done {
            break;
        }
    }

    Ok(match (total, too_long) {
        (0, _) => LineRead::Eof,
        (len, true) => LineRead::TooLong(len),
        _ => LineRead::Line,
    })
}

pub fn http_router(pipeline: Arc<Pipeline>, max_body_bytes: usize) -> Router {
    Router::new()
        .fallback(any(receive))
        .with_state(pipeline)
        .layer(DefaultBodyLimit::max(max_body_bytes))
}

pub async fn serve_http(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    max_body_bytes: usize,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "http listener started");
    axum::serve(listener, http_router(pipeline, max_body_bytes)).await?;
    Ok(())
}

async fn receive(State(pipeline): State<Arc<Pipeline>>, body: Bytes) -> StatusCode {
    let raw = String::from_utf8_lossy(&body)
        .trim_end_matches(['\r', '\n'])
        .to_string();

    if !raw.is_empty() {
        tokio::spawn(async move {
            pipeline.ingest(&raw).await;
        });
    }

    StatusCode::OK
}

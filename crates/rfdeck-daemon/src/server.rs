use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, Semaphore};
use tokio::time;
use tracing::{debug, info, instrument, warn, Instrument};

use rfdeck_core::sweep::{Subscription, SweepEvent};
use rfdeck_ipc::{
    endpoint_for_body, ClientHello, DaemonError, DaemonEvent, ErrorCode, FeatureFlag, HelloAck,
    RequestBody, RequestEnvelope, ResponseBody, ResponseEnvelope, PROTOCOL_VERSION,
};

use crate::dispatch::handle_request;
use crate::state::DaemonState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_PROTOCOL_VIOLATIONS: usize = 3;
const ERROR_REQUEST_ID: u64 = 0;

fn build_feature_list() -> Vec<FeatureFlag> {
    vec![
        FeatureFlag::SweepSubscribe,
        FeatureFlag::UdsTimeouts,
        FeatureFlag::ToolManagers,
    ]
}

async fn read_frame_timed<R>(
    stream: &mut R,
    max_frame: u32,
    timeout_duration: Duration,
) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    match time::timeout(timeout_duration, read_frame(stream, max_frame)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "frame read timeout",
        )),
    }
}

async fn write_frame_timed<W>(
    stream: &mut W,
    payload: &[u8],
    max_frame: u32,
    timeout_duration: Duration,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match time::timeout(timeout_duration, write_frame(stream, payload, max_frame)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "frame write timeout",
        )),
    }
}

pub async fn run(listener: UnixListener, state: Arc<DaemonState>, shutdown: Arc<Notify>) {
    let max_connections = state.config.max_connections.max(1);
    let conn_limit = Arc::new(Semaphore::new(max_connections));
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                break;
            }
            result = listener.accept() => {
                let (stream, _addr) = match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("Accept error: {}", err);
                        continue;
                    }
                };

                let permit = match conn_limit.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Connection limit reached, rejecting");
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_connection(stream, state).await;
                });
            }
        }
    }
}

#[instrument(skip(stream, state), fields(client))]
async fn handle_connection(mut stream: UnixStream, state: Arc<DaemonState>) {
    debug!("New connection accepted");
    let max_frame = state.config.max_frame;
    let write_timeout = state.config.write_timeout;

    let hello_payload = match time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream, max_frame))
        .await
    {
        Ok(Ok(payload)) => payload,
        Ok(Err(err)) => {
            warn!("Handshake frame error: {}", err);
            return;
        }
        Err(_) => {
            warn!("Handshake timed out");
            return;
        }
    };

    let hello: ClientHello = match serde_json::from_slice(&hello_payload) {
        Ok(hello) => hello,
        Err(err) => {
            let _ = send_error_timed(
                &mut stream,
                ERROR_REQUEST_ID,
                protocol_violation(format!("invalid hello: {}", err)),
                max_frame,
                write_timeout,
            )
            .await;
            return;
        }
    };
    tracing::Span::current().record("client", hello.client_name.as_str());

    if hello.protocol_version != PROTOCOL_VERSION {
        let _ = send_error_timed(
            &mut stream,
            ERROR_REQUEST_ID,
            DaemonError::new(
                ErrorCode::IncompatibleProtocol,
                format!("unsupported protocol {}", hello.protocol_version),
                false,
            ),
            max_frame,
            write_timeout,
        )
        .await;
        return;
    }

    let ack = HelloAck {
        protocol_version: PROTOCOL_VERSION,
        daemon_version: state.version.clone(),
        features: build_feature_list(),
        max_frame,
    };

    let ack_bytes = match serde_json::to_vec(&ack) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("Failed to serialize hello ack: {}", err);
            return;
        }
    };

    if let Err(err) = write_frame_timed(&mut stream, &ack_bytes, max_frame, write_timeout).await {
        warn!("Failed to send hello ack: {}", err);
        return;
    }

    let max_rps = state.config.max_requests_per_second;
    let mut tokens = max_rps;
    let mut last_refill = Instant::now();
    let mut violations = 0usize;

    loop {
        let payload =
            match read_frame_timed(&mut stream, max_frame, state.config.read_timeout).await {
                Ok(payload) => payload,
                Err(err) => {
                    if err.kind() == io::ErrorKind::TimedOut {
                        debug!("Frame read timeout, closing idle connection");
                        let _ = send_error_timed(
                            &mut stream,
                            ERROR_REQUEST_ID,
                            DaemonError::new(ErrorCode::Timeout, "read timeout", true),
                            max_frame,
                            write_timeout,
                        )
                        .await;
                    } else if err.kind() != io::ErrorKind::UnexpectedEof {
                        warn!("Frame read error: {}", err);
                    }
                    break;
                }
            };

        let request: RequestEnvelope = match serde_json::from_slice(&payload) {
            Ok(req) => req,
            Err(err) => {
                violations += 1;
                let _ = send_error_timed(
                    &mut stream,
                    ERROR_REQUEST_ID,
                    protocol_violation(format!("invalid request: {}", err)),
                    max_frame,
                    write_timeout,
                )
                .await;
                if violations >= MAX_PROTOCOL_VIOLATIONS {
                    warn!("Too many protocol violations, closing connection");
                    break;
                }
                continue;
            }
        };

        if request.v != PROTOCOL_VERSION {
            violations += 1;
            let _ = send_error_timed(
                &mut stream,
                request.request_id,
                DaemonError::new(
                    ErrorCode::IncompatibleProtocol,
                    "protocol version mismatch",
                    false,
                ),
                max_frame,
                write_timeout,
            )
            .await;
            if violations >= MAX_PROTOCOL_VIOLATIONS {
                break;
            }
            continue;
        }

        if request.endpoint != endpoint_for_body(&request.body) {
            violations += 1;
            let _ = send_error_timed(
                &mut stream,
                request.request_id,
                protocol_violation("endpoint/body mismatch"),
                max_frame,
                write_timeout,
            )
            .await;
            if violations >= MAX_PROTOCOL_VIOLATIONS {
                break;
            }
            continue;
        }

        if max_rps > 0 {
            if last_refill.elapsed() >= Duration::from_secs(1) {
                tokens = max_rps;
                last_refill = Instant::now();
            }
            if tokens == 0 {
                let _ = send_error_timed(
                    &mut stream,
                    request.request_id,
                    DaemonError::new(ErrorCode::RateLimited, "rate limit exceeded", true),
                    max_frame,
                    write_timeout,
                )
                .await;
                continue;
            }
            tokens -= 1;
        }

        let request_id = request.request_id;
        let request_span = tracing::info_span!(
            "request",
            request_id,
            endpoint = ?request.endpoint,
        );

        // Attach before the acknowledgement so no event between the two is lost.
        let subscription = matches!(request.body, RequestBody::SweepSubscribe)
            .then(|| state.sweep.subscribe());

        let response = handle_request(&state, request)
            .instrument(request_span)
            .await;
        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to serialize response: {}", err);
                break;
            }
        };

        if let Err(err) = write_frame_timed(&mut stream, &payload, max_frame, write_timeout).await {
            if err.kind() == io::ErrorKind::TimedOut {
                warn!("Response write timeout for request {}", response.request_id);
            } else {
                warn!("Failed to write response: {}", err);
            }
            break;
        }

        if let Some(subscription) = subscription {
            stream_events(&mut stream, subscription, request_id, &state).await;
            break;
        }
    }
}

/// Pushes sweep events until the peer hangs up, a write stalls, or the
/// daemon closes the hub.
async fn stream_events(
    stream: &mut UnixStream,
    mut subscription: Subscription,
    request_id: u64,
    state: &DaemonState,
) {
    let max_frame = state.config.max_frame;
    let write_timeout = state.config.write_timeout;
    let (mut reader, mut writer) = stream.split();
    let mut scratch = [0u8; 256];
    let mut pushed = 0u64;
    info!(request_id, "sweep subscriber attached");

    loop {
        let event = tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => event,
                None => break,
            },
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                // Push connections are one-way; anything the peer sends is discarded.
                Ok(_) => continue,
            },
        };

        let mut events = Vec::with_capacity(2);
        let dropped = subscription.take_dropped();
        if dropped > 0 {
            events.push(DaemonEvent::SubscriberLagged { dropped });
        }
        events.push(match event {
            SweepEvent::Sample(sample) => DaemonEvent::Spectrum(sample.as_ref().clone()),
            SweepEvent::Status(status) => DaemonEvent::SweepStatus(status),
        });

        for event in events {
            let envelope = ResponseEnvelope {
                v: PROTOCOL_VERSION,
                request_id,
                body: ResponseBody::Event(event),
            };
            let payload = match serde_json::to_vec(&envelope) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("Failed to serialize event: {}", err);
                    continue;
                }
            };
            if let Err(err) = write_frame_timed(&mut writer, &payload, max_frame, write_timeout).await
            {
                debug!("Subscriber write failed: {}", err);
                info!(request_id, pushed, "sweep subscriber detached");
                return;
            }
            pushed += 1;
        }
    }
    info!(request_id, pushed, "sweep subscriber detached");
}

fn protocol_violation(err: impl Into<String>) -> DaemonError {
    DaemonError::new(ErrorCode::BadRequest, err, false)
}

async fn read_frame<R>(stream: &mut R, max_frame: u32) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = match rfdeck_ipc::decode_frame_length(len_buf, max_frame) {
        Ok(len) => len,
        Err(err) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid frame length: {:?}", err),
            ));
        }
    };
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<W>(stream: &mut W, payload: &[u8], max_frame: u32) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty payload"));
    }
    if payload.len() as u32 > max_frame {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "payload exceeds max_frame",
        ));
    }
    let frame = rfdeck_ipc::encode_frame(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

async fn send_error_timed(
    stream: &mut UnixStream,
    request_id: u64,
    err: DaemonError,
    max_frame: u32,
    timeout_duration: Duration,
) -> Result<()> {
    let envelope = ResponseEnvelope {
        v: PROTOCOL_VERSION,
        request_id,
        body: ResponseBody::Err(err),
    };
    let payload = serde_json::to_vec(&envelope)?;
    write_frame_timed(stream, &payload, max_frame, timeout_duration).await?;
    Ok(())
}

//! Memcache text framing and the per-connection command loop. One request in,
//! one response out, except `monitor` which streams `VALUE` frames until the
//! stream ends with `END`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::metrics;
use crate::session::{SessionError, SessionHandler};

const MAX_LINE_LEN: usize = 8 * 1024;
const MAX_DATA_LEN: usize = 32 * 1024 * 1024;
const CRLF: &[u8] = b"\r\n";

/// Absolute/relative pivot for the `set` expiry field, per the memcache
/// convention: smaller values are seconds from now, larger ones are unix
/// seconds.
const EXPIRY_UNIX_PIVOT: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// framing

/// One decoded request frame. Parse problems surface as `Invalid` so the
/// command loop can answer `CLIENT_ERROR` before disconnecting, rather than
/// dropping the connection silently.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Line(Vec<String>),
    LineWithData { parts: Vec<String>, data: Bytes },
    Invalid(String),
}

#[derive(Debug, Default)]
pub(crate) struct MemcacheCodec {
    // set command waiting for its data block: (command words, payload bytes)
    pending_data: Option<(Vec<String>, usize)>,
}

impl MemcacheCodec {
    pub(crate) fn new() -> Self {
        MemcacheCodec::default()
    }
}

fn find_crlf(src: &BytesMut) -> Option<usize> {
    src.windows(2).position(|pair| pair == CRLF)
}

impl Decoder for MemcacheCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if let Some((parts, needed)) = self.pending_data.take() {
            if src.len() < needed + CRLF.len() {
                self.pending_data = Some((parts, needed));
                return Ok(None);
            }
            let data = src.split_to(needed).freeze();
            let trailer = src.split_to(CRLF.len());
            if &trailer[..] != CRLF {
                return Ok(Some(Frame::Invalid("data block missing CRLF".to_string())));
            }
            return Ok(Some(Frame::LineWithData { parts, data }));
        }

        let Some(pos) = find_crlf(src) else {
            if src.len() > MAX_LINE_LEN {
                src.clear();
                return Ok(Some(Frame::Invalid("command line too long".to_string())));
            }
            return Ok(None);
        };
        let line = src.split_to(pos);
        src.advance(CRLF.len());
        let Ok(text) = std::str::from_utf8(&line) else {
            return Ok(Some(Frame::Invalid("command is not valid utf-8".to_string())));
        };
        let parts: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        if parts.is_empty() {
            return Ok(Some(Frame::Invalid("empty command".to_string())));
        }

        if parts[0].eq_ignore_ascii_case("set") {
            if parts.len() != 5 {
                return Ok(Some(Frame::Invalid(
                    "set expects <key> <flags> <expiry> <bytes>".to_string(),
                )));
            }
            let Ok(needed) = parts[4].parse::<usize>() else {
                return Ok(Some(Frame::Invalid("bad data chunk size".to_string())));
            };
            if needed > MAX_DATA_LEN {
                return Ok(Some(Frame::Invalid("data chunk too large".to_string())));
            }
            self.pending_data = Some((parts, needed));
            // The data block may already be buffered.
            return self.decode(src);
        }

        Ok(Some(Frame::Line(parts)))
    }
}

/// Wire responses. `Value` frames carry no terminator; the command loop
/// follows them with `End`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Response {
    Value { queue: String, data: Bytes },
    Stored,
    NotStored,
    Deleted,
    End,
    Error,
    ClientError(String),
    ServerError(String),
    Stats(Vec<(String, String)>),
    Version(String),
    Line(String),
    Empty,
}

impl Encoder<Response> for MemcacheCodec {
    type Error = std::io::Error;

    fn encode(&mut self, resp: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match resp {
            Response::Value { queue, data } => {
                dst.extend_from_slice(format!("VALUE {queue} 0 {}\r\n", data.len()).as_bytes());
                dst.extend_from_slice(&data);
                dst.extend_from_slice(CRLF);
            }
            Response::Stored => dst.extend_from_slice(b"STORED\r\n"),
            Response::NotStored => dst.extend_from_slice(b"NOT_STORED\r\n"),
            Response::Deleted => dst.extend_from_slice(b"DELETED\r\n"),
            Response::End => dst.extend_from_slice(b"END\r\n"),
            Response::Error => dst.extend_from_slice(b"ERROR\r\n"),
            Response::ClientError(msg) => {
                dst.extend_from_slice(format!("CLIENT_ERROR {msg}\r\n").as_bytes());
            }
            Response::ServerError(msg) => {
                dst.extend_from_slice(format!("SERVER_ERROR {msg}\r\n").as_bytes());
            }
            Response::Stats(pairs) => {
                for (key, value) in pairs {
                    dst.extend_from_slice(format!("STAT {key} {value}\r\n").as_bytes());
                }
                dst.extend_from_slice(b"END\r\n");
            }
            Response::Version(version) => {
                dst.extend_from_slice(format!("VERSION {version}\r\n").as_bytes());
            }
            Response::Line(line) => {
                dst.extend_from_slice(line.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            Response::Empty => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// command parsing

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GetOptions {
    pub timeout: Option<Duration>,
    pub open: bool,
    pub close: bool,
    pub abort: bool,
    pub peek: bool,
}

/// Splits `queue[/opt]*` and validates the option combination.
pub(crate) fn parse_get_target(raw: &str) -> Result<(String, GetOptions), String> {
    let mut pieces = raw.split('/');
    let queue = pieces.next().unwrap_or_default().to_string();
    let mut opts = GetOptions::default();
    for opt in pieces {
        if let Some(ms) = opt.strip_prefix("t=") {
            let ms: u64 = ms.parse().map_err(|_| format!("bad timeout {opt:?}"))?;
            opts.timeout = Some(Duration::from_millis(ms));
        } else {
            match opt {
                "open" => opts.open = true,
                "close" => opts.close = true,
                "abort" => opts.abort = true,
                "peek" => opts.peek = true,
                other => return Err(format!("unknown get option {other:?}")),
            }
        }
    }
    if queue.is_empty() {
        return Err("missing queue name".to_string());
    }
    if (opts.peek || opts.abort) && (opts.open || opts.close) {
        return Err("cannot combine peek/abort with open/close".to_string());
    }
    if opts.peek && opts.abort {
        return Err("cannot combine peek with abort".to_string());
    }
    Ok((queue, opts))
}

/// `0` means no expiry; small values are relative seconds, large ones are
/// absolute unix seconds.
pub(crate) fn normalize_expiry(raw: u64, now: SystemTime) -> Option<SystemTime> {
    if raw == 0 {
        None
    } else if raw < EXPIRY_UNIX_PIVOT {
        Some(now + Duration::from_secs(raw))
    } else {
        Some(UNIX_EPOCH + Duration::from_secs(raw))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Get { queue: String, opts: GetOptions },
    Set { queue: String, expiry_raw: u64, data: Bytes },
    Monitor { queue: String, secs: u64, max_items: usize },
    Confirm { queue: String, count: usize },
    Delete(String),
    Flush(String),
    FlushAll,
    FlushExpired(String),
    FlushAllExpired,
    Stats,
    DumpStats(Vec<String>),
    Status(Option<String>),
    Version,
    Reload,
    Shutdown,
    Quit,
}

fn parse_usize(parts: &[String], idx: usize, what: &str) -> Result<usize, String> {
    let raw = parts.get(idx).ok_or_else(|| format!("missing {what}"))?;
    raw.parse().map_err(|_| format!("bad {what} {raw:?}"))
}

fn parse_u64(parts: &[String], idx: usize, what: &str) -> Result<u64, String> {
    let raw = parts.get(idx).ok_or_else(|| format!("missing {what}"))?;
    raw.parse().map_err(|_| format!("bad {what} {raw:?}"))
}

fn expect_args(parts: &[String], n: usize) -> Result<(), String> {
    if parts.len() == n {
        Ok(())
    } else {
        Err(format!("{} expects {} argument(s)", parts[0], n - 1))
    }
}

pub(crate) fn parse_command(parts: Vec<String>, data: Option<Bytes>) -> Result<Command, String> {
    let verb = parts[0].to_ascii_lowercase();
    match verb.as_str() {
        "get" | "gets" => {
            expect_args(&parts, 2)?;
            let (queue, opts) = parse_get_target(&parts[1])?;
            Ok(Command::Get { queue, opts })
        }
        "set" => {
            // arity and the byte count were validated by the decoder
            let queue = parts[1].clone();
            if queue.is_empty() || queue.contains('/') {
                return Err(format!("invalid queue name {queue:?}"));
            }
            let _flags = parse_u64(&parts, 2, "flags")?;
            let expiry_raw = parse_u64(&parts, 3, "expiry")?;
            Ok(Command::Set {
                queue,
                expiry_raw,
                data: data.unwrap_or_default(),
            })
        }
        "monitor" => {
            if parts.len() != 3 && parts.len() != 4 {
                return Err("monitor expects <queue> <seconds> [max-items]".to_string());
            }
            let queue = parts[1].clone();
            let secs = parse_u64(&parts, 2, "monitor timeout")?;
            // No cap argument means the stream runs to the deadline or drain.
            let max_items = if parts.len() == 4 {
                parse_usize(&parts, 3, "monitor item cap")?
            } else {
                usize::MAX
            };
            Ok(Command::Monitor {
                queue,
                secs,
                max_items,
            })
        }
        "confirm" => {
            expect_args(&parts, 3)?;
            Ok(Command::Confirm {
                queue: parts[1].clone(),
                count: parse_usize(&parts, 2, "confirm count")?,
            })
        }
        "delete" => {
            expect_args(&parts, 2)?;
            Ok(Command::Delete(parts[1].clone()))
        }
        "flush" => {
            expect_args(&parts, 2)?;
            Ok(Command::Flush(parts[1].clone()))
        }
        "flush_all" => {
            expect_args(&parts, 1)?;
            Ok(Command::FlushAll)
        }
        "flush_expired" => {
            expect_args(&parts, 2)?;
            Ok(Command::FlushExpired(parts[1].clone()))
        }
        "flush_all_expired" => {
            expect_args(&parts, 1)?;
            Ok(Command::FlushAllExpired)
        }
        "stats" => {
            expect_args(&parts, 1)?;
            Ok(Command::Stats)
        }
        "dump_stats" => Ok(Command::DumpStats(parts[1..].to_vec())),
        "status" => {
            if parts.len() > 2 {
                return Err("status expects at most one argument".to_string());
            }
            Ok(Command::Status(parts.get(1).cloned()))
        }
        "version" => Ok(Command::Version),
        "reload" => Ok(Command::Reload),
        "shutdown" => Ok(Command::Shutdown),
        "quit" => Ok(Command::Quit),
        other => Err(format!("unknown command {other:?}")),
    }
}

// ---------------------------------------------------------------------------
// the per-connection loop

enum Step {
    Continue,
    Disconnect,
}

type Wire = Framed<TcpStream, MemcacheCodec>;

/// Drives one connection to completion and tears the session down afterwards.
pub(crate) async fn serve(stream: TcpStream, session: SessionHandler) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, MemcacheCodec::new());
    let mut first_error_logged = false;
    let result = drive(&mut framed, &session, &mut first_error_logged).await;
    session.finish();
    result
}

async fn drive(
    framed: &mut Wire,
    session: &SessionHandler,
    first_error_logged: &mut bool,
) -> anyhow::Result<()> {
    while let Some(frame) = framed.next().await {
        let frame = frame.context("read request frame")?;
        match apply(framed, session, frame, first_error_logged).await? {
            Step::Continue => {}
            Step::Disconnect => break,
        }
    }
    Ok(())
}

async fn send(framed: &mut Wire, resp: Response) -> anyhow::Result<()> {
    framed.send(resp).await.context("write response")
}

async fn client_error(
    framed: &mut Wire,
    session: &SessionHandler,
    first_error_logged: &mut bool,
    reason: String,
) -> anyhow::Result<Step> {
    // Only the first client-induced error per session is logged, so one
    // misbehaving producer cannot flood the log.
    if !*first_error_logged {
        tracing::warn!(session = session.id(), reason = %reason, "client protocol error");
        *first_error_logged = true;
    }
    metrics::record_protocol_error();
    send(framed, Response::ClientError(reason)).await?;
    Ok(Step::Disconnect)
}

async fn fail(
    framed: &mut Wire,
    session: &SessionHandler,
    first_error_logged: &mut bool,
    err: SessionError,
) -> anyhow::Result<Step> {
    match err {
        SessionError::Protocol(reason) => {
            client_error(framed, session, first_error_logged, reason).await
        }
        SessionError::TransactionViolation { .. }
        | SessionError::TooManyOpenReads { .. }
        | SessionError::StatusNotConfigured => {
            tracing::debug!(session = session.id(), error = %err, "terminal session error");
            send(framed, Response::Error).await?;
            Ok(Step::Disconnect)
        }
        SessionError::Unavailable { .. } => {
            send(framed, Response::ServerError(err.to_string())).await?;
            Ok(Step::Disconnect)
        }
        SessionError::Storage(storage) => {
            tracing::error!(session = session.id(), error = %storage, "storage failure");
            send(framed, Response::ServerError(storage.to_string())).await?;
            Ok(Step::Disconnect)
        }
    }
}

async fn apply(
    framed: &mut Wire,
    session: &SessionHandler,
    frame: Frame,
    first_error_logged: &mut bool,
) -> anyhow::Result<Step> {
    let command = match frame {
        Frame::Invalid(reason) => {
            return client_error(framed, session, first_error_logged, reason).await;
        }
        Frame::Line(parts) => parse_command(parts, None),
        Frame::LineWithData { parts, data } => parse_command(parts, Some(data)),
    };
    let command = match command {
        Ok(command) => command,
        Err(reason) => return client_error(framed, session, first_error_logged, reason).await,
    };

    match command {
        Command::Get { queue, opts } => {
            if opts.abort {
                return match session.abort_read(&queue) {
                    Ok(_) => {
                        send(framed, Response::End).await?;
                        Ok(Step::Continue)
                    }
                    Err(err) => fail(framed, session, first_error_logged, err).await,
                };
            }
            if opts.close {
                if let Err(err) = session.close_read(&queue) {
                    return fail(framed, session, first_error_logged, err).await;
                }
            }
            let fetches = opts.open || opts.peek || !opts.close;
            if !fetches {
                send(framed, Response::End).await?;
                return Ok(Step::Continue);
            }
            match session
                .get_item(&queue, opts.timeout, opts.open, opts.peek)
                .await
            {
                Ok(Some(item)) => {
                    framed.feed(Response::Value { queue, data: item.data }).await?;
                    send(framed, Response::End).await?;
                    Ok(Step::Continue)
                }
                Ok(None) => {
                    send(framed, Response::End).await?;
                    Ok(Step::Continue)
                }
                Err(err) => fail(framed, session, first_error_logged, err).await,
            }
        }
        Command::Set {
            queue,
            expiry_raw,
            data,
        } => {
            let expiry = normalize_expiry(expiry_raw, SystemTime::now());
            match session.set_item(&queue, expiry, data).await {
                Ok(true) => {
                    send(framed, Response::Stored).await?;
                    Ok(Step::Continue)
                }
                Ok(false) => {
                    send(framed, Response::NotStored).await?;
                    Ok(Step::Continue)
                }
                Err(err) => fail(framed, session, first_error_logged, err).await,
            }
        }
        Command::Monitor {
            queue,
            secs,
            max_items,
        } => {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
            let (tx, mut rx) = mpsc::channel(8);
            let monitor = session.monitor_until(&queue, deadline, max_items, true, tx);
            let writer = async {
                while let Some(item) = rx.recv().await {
                    framed
                        .feed(Response::Value {
                            queue: queue.clone(),
                            data: item.data,
                        })
                        .await?;
                    framed.flush().await?;
                }
                Ok::<_, anyhow::Error>(())
            };
            let (monitor_res, write_res) = tokio::join!(monitor, writer);
            write_res?;
            match monitor_res {
                Ok(()) => {
                    send(framed, Response::End).await?;
                    Ok(Step::Continue)
                }
                Err(err) => fail(framed, session, first_error_logged, err).await,
            }
        }
        Command::Confirm { queue, count } => match session.close_reads(&queue, count) {
            Ok(true) => {
                send(framed, Response::End).await?;
                Ok(Step::Continue)
            }
            Ok(false) => {
                // Nothing to confirm is an error reply, not a protocol
                // violation; the connection stays up.
                send(framed, Response::Error).await?;
                Ok(Step::Continue)
            }
            Err(err) => fail(framed, session, first_error_logged, err).await,
        },
        Command::Delete(queue) => match session.delete_queue(&queue).await {
            Ok(()) => {
                send(framed, Response::Deleted).await?;
                Ok(Step::Continue)
            }
            Err(err) => fail(framed, session, first_error_logged, err).await,
        },
        Command::Flush(queue) => match session.flush(&queue) {
            Ok(()) => {
                send(framed, Response::End).await?;
                Ok(Step::Continue)
            }
            Err(err) => fail(framed, session, first_error_logged, err).await,
        },
        Command::FlushAll => match session.flush_all_queues() {
            Ok(()) => {
                send(framed, Response::Line("Flushed all queues.".to_string())).await?;
                Ok(Step::Continue)
            }
            Err(err) => fail(framed, session, first_error_logged, err).await,
        },
        Command::FlushExpired(queue) => match session.flush_expired(&queue) {
            Ok(count) => {
                send(framed, Response::Line(count.to_string())).await?;
                Ok(Step::Continue)
            }
            Err(err) => fail(framed, session, first_error_logged, err).await,
        },
        Command::FlushAllExpired => match session.flush_all_expired() {
            Ok(count) => {
                send(framed, Response::Line(count.to_string())).await?;
                Ok(Step::Continue)
            }
            Err(err) => fail(framed, session, first_error_logged, err).await,
        },
        Command::Stats => {
            send(framed, Response::Stats(gather_stats(session))).await?;
            Ok(Step::Continue)
        }
        Command::DumpStats(queues) => {
            let names = if queues.is_empty() {
                session.queues().queue_names()
            } else {
                queues
            };
            for name in names {
                if let Some(stats) = session.queues().stats(&name) {
                    framed.feed(Response::Line(format!("queue '{name}' {{"))).await?;
                    for (key, value) in stats {
                        framed.feed(Response::Line(format!("  {key}={value}"))).await?;
                    }
                    framed.feed(Response::Line("}".to_string())).await?;
                }
            }
            send(framed, Response::End).await?;
            Ok(Step::Continue)
        }
        Command::Status(None) => match session.current_status() {
            Ok(status) => {
                send(framed, Response::Line(status.to_string())).await?;
                Ok(Step::Continue)
            }
            Err(err) => fail(framed, session, first_error_logged, err).await,
        },
        Command::Status(Some(raw)) => match session.set_status(&raw) {
            Ok(()) => {
                send(framed, Response::End).await?;
                Ok(Step::Continue)
            }
            Err(err) => fail(framed, session, first_error_logged, err).await,
        },
        Command::Version => {
            send(
                framed,
                Response::Version(env!("CARGO_PKG_VERSION").to_string()),
            )
            .await?;
            Ok(Step::Continue)
        }
        Command::Reload => {
            session.tunables().reload();
            tracing::info!(session = session.id(), "config reloaded");
            send(framed, Response::Line("Reloaded config.".to_string())).await?;
            Ok(Step::Continue)
        }
        Command::Shutdown => {
            session.shutdown();
            send(framed, Response::Empty).await?;
            Ok(Step::Disconnect)
        }
        Command::Quit => {
            send(framed, Response::Empty).await?;
            Ok(Step::Disconnect)
        }
    }
}

fn gather_stats(session: &SessionHandler) -> Vec<(String, String)> {
    let queues = session.queues();
    let storage = spool_store::metrics::snapshot();
    let mut lines = vec![
        ("uptime".to_string(), metrics::uptime().as_secs().to_string()),
        ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
    ];
    lines.extend(metrics::stat_lines());
    lines.push(("curr_items".to_string(), queues.current_items().to_string()));
    lines.push(("curr_bytes".to_string(), queues.current_bytes().to_string()));
    lines.push((
        "open_transactions".to_string(),
        queues.total_open_reads().to_string(),
    ));
    lines.push((
        "reserved_memory_ratio".to_string(),
        format!("{:.4}", queues.reserved_memory_ratio()),
    ));
    lines.push(("queues".to_string(), queues.queue_names().len().to_string()));
    lines.push((
        "journal_writes".to_string(),
        storage.journal_writes.to_string(),
    ));
    lines.push((
        "journal_bytes".to_string(),
        storage.journal_bytes.to_string(),
    ));
    lines.push(("fsync_count".to_string(), storage.fsync_count.to_string()));
    lines.push((
        "fsync_usec_total".to_string(),
        storage.fsync_total_us.to_string(),
    ));
    lines.push((
        "fsync_usec_max".to_string(),
        storage.fsync_max_us.to_string(),
    ));
    lines.push(("fsync_errors".to_string(), storage.fsync_errors.to_string()));
    lines.push((
        "sync_lag_usec_total".to_string(),
        storage.sync_lag_total_us.to_string(),
    ));
    lines.push((
        "sync_lag_usec_max".to_string(),
        storage.sync_lag_max_us.to_string(),
    ));
    for name in queues.queue_names() {
        if let Some(stats) = queues.stats(&name) {
            for (key, value) in stats {
                lines.push((format!("queue_{name}_{key}"), value));
            }
        }
    }
    lines
}

//! Streaming session: per-connection command parser and push loop.
//!
//! A session is transport-agnostic. It consumes text commands through
//! [`Session::handle`] and emits [`Outbound`] messages on a bounded channel
//! whose single reader owns the socket, so concurrent senders never
//! interleave frames.
//!
//! Each command runs as its own task. That keeps a long-running
//! `SUBSCRIBE*` loop from blocking receipt of the `UNSUBSCRIBE` that ends
//! it. The loop and the unsubscribing task share the subscription cell, an
//! atomic generation number read once per iteration. Only the device draw
//! runs on the blocking pool; sends are awaited on the async task, so a
//! client that stops reading parks its own tasks and nobody else's. Each
//! connection may have at most [`MAX_IN_FLIGHT`] one-shot commands pending.
//!
//! Input is classified before anything runs. Unknown commands, malformed
//! arguments and unresolvable device ids are dropped silently. Device
//! faults during execution close the connection with code 1011.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use quanttp_core::{DrawKind, EntropySource, Error, Limits, SourceRegistry, draw_value, format};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;

/// Close code sent when a fault ends the connection (RFC 6455 internal error).
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Capacity of the per-connection outbound queue.
pub const OUTBOUND_QUEUE: usize = 64;

/// One-shot commands a connection may have in flight. Further commands are
/// dropped until earlier ones finish.
pub const MAX_IN_FLIGHT: usize = 16;

/// Acknowledgement text for `UNSUBSCRIBE`.
pub const UNSUBSCRIBED: &str = "UNSUBSCRIBED";

// RFC 6455 caps close-frame reasons at 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

/// Message queued for the connection writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// What an active subscription pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Int32,
    Uniform,
    Normal,
    /// Raw binary chunks of the given size.
    Bytes(usize),
    /// Hex text of chunks of the given size.
    Hex(usize),
}

/// Parsed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Draw(DrawKind),
    RandBytes(usize),
    Subscribe(Mode),
    Unsubscribe,
    Clear,
}

/// A command plus its optional explicit device id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub device_id: Option<String>,
}

/// Observable subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Subscribed(Mode),
}

/// Parse one inbound text message.
///
/// The command token is case-insensitive; argument tokens keep their case.
/// Returns `None` for anything that should be ignored: empty input, unknown
/// commands, and size arguments that are missing, non-numeric, `< 1` or
/// above `max_size`.
pub fn parse_command(line: &str, max_size: usize) -> Option<Request> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next()?.to_ascii_uppercase();

    let mut size = || -> Option<usize> {
        let n: i64 = tokens.next()?.parse().ok()?;
        let n = usize::try_from(n).ok()?;
        (1..=max_size).contains(&n).then_some(n)
    };

    let command = match name.as_str() {
        "RANDINT32" => Command::Draw(DrawKind::Int32),
        "RANDUNIFORM" => Command::Draw(DrawKind::Uniform),
        "RANDNORMAL" => Command::Draw(DrawKind::Normal),
        "RANDBYTES" => Command::RandBytes(size()?),
        "SUBSCRIBEINT32" => Command::Subscribe(Mode::Int32),
        "SUBSCRIBEUNIFORM" => Command::Subscribe(Mode::Uniform),
        "SUBSCRIBENORMAL" => Command::Subscribe(Mode::Normal),
        "SUBSCRIBEBYTES" => Command::Subscribe(Mode::Bytes(size()?)),
        "SUBSCRIBEHEX" => Command::Subscribe(Mode::Hex(size()?)),
        "UNSUBSCRIBE" => Command::Unsubscribe,
        "CLEAR" => Command::Clear,
        _ => return None,
    };
    let device_id = tokens.next().map(str::to_string);
    Some(Request { command, device_id })
}

struct Subscription {
    generation: u64,
    mode: Option<Mode>,
}

/// State shared between the session and its in-flight tasks.
struct Shared {
    conn: String,
    registry: Arc<SourceRegistry>,
    default_device: Option<String>,
    outbound: mpsc::Sender<Outbound>,
    /// 0 when idle, otherwise the generation of the live push loop.
    active: AtomicU64,
    next_generation: AtomicU64,
    subscription: Mutex<Subscription>,
    /// Bounds one-shot commands in flight on this connection.
    permits: Arc<Semaphore>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Subscription> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the subscription slot. `None` if one is already live.
    fn try_subscribe(&self, mode: Mode) -> Option<u64> {
        let mut sub = self.lock();
        if sub.generation != 0 {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        sub.generation = generation;
        sub.mode = Some(mode);
        self.active.store(generation, Ordering::Release);
        Some(generation)
    }

    fn cancel(&self) {
        let mut sub = self.lock();
        sub.generation = 0;
        sub.mode = None;
        self.active.store(0, Ordering::Release);
    }

    /// Release the slot only if it still belongs to `generation`.
    fn finish(&self, generation: u64) {
        let mut sub = self.lock();
        if sub.generation == generation {
            sub.generation = 0;
            sub.mode = None;
            self.active.store(0, Ordering::Release);
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        self.active.load(Ordering::Acquire) == generation && !self.outbound.is_closed()
    }

    fn state(&self) -> SessionState {
        match self.lock().mode {
            Some(mode) => SessionState::Subscribed(mode),
            None => SessionState::Idle,
        }
    }

    /// Route an execution error: caller errors are dropped, faults close
    /// the connection.
    async fn fail(&self, err: Error) {
        if err.is_caller_error() {
            log::debug!("[{}] ignored: {err}", self.conn);
            return;
        }
        log::warn!("[{}] closing connection: {err}", self.conn);
        self.cancel();
        let _ = self
            .outbound
            .send(Outbound::Close {
                code: CLOSE_INTERNAL_ERROR,
                reason: close_reason(&err.to_string()),
            })
            .await;
    }

    async fn one_shot(&self, source: Arc<EntropySource>, command: Command) {
        let result = match command {
            Command::Draw(kind) => {
                on_device(&source, move |s| {
                    draw_value(s, kind).map(|v| Outbound::Text(v.to_text()))
                })
                .await
            }
            Command::RandBytes(n) => {
                on_device(&source, move |s| s.draw_bytes(n).map(Outbound::Binary)).await
            }
            Command::Clear => {
                let _ = on_device(&source, |s| {
                    s.clear();
                    Ok(())
                })
                .await;
                return;
            }
            Command::Subscribe(_) | Command::Unsubscribe => return,
        };
        match result {
            Ok(msg) => {
                let _ = self.outbound.send(msg).await;
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn push_loop(&self, source: Arc<EntropySource>, mode: Mode, generation: u64) {
        log::debug!("[{}] subscribed {mode:?} on {}", self.conn, source.id());
        while self.is_live(generation) {
            let msg = match on_device(&source, move |s| push_value(s, mode)).await {
                Ok(msg) => msg,
                Err(e) => {
                    self.finish(generation);
                    self.fail(e).await;
                    return;
                }
            };
            // Unsubscribed while drawing: drop the value.
            if !self.is_live(generation) {
                break;
            }
            if self.outbound.send(msg).await.is_err() {
                break;
            }
        }
        self.finish(generation);
        log::debug!("[{}] push loop on {} stopped", self.conn, source.id());
    }
}

/// Run one device operation on the blocking pool. Only the draw occupies a
/// blocking thread; the send that follows happens on the async task.
async fn on_device<T, F>(source: &Arc<EntropySource>, f: F) -> quanttp_core::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&EntropySource) -> quanttp_core::Result<T> + Send + 'static,
{
    let src = Arc::clone(source);
    tokio::task::spawn_blocking(move || f(&src))
        .await
        .unwrap_or_else(|e| {
            Err(Error::DeviceFault {
                device: source.id().to_string(),
                reason: format!("draw task failed: {e}"),
            })
        })
}

fn push_value(source: &EntropySource, mode: Mode) -> quanttp_core::Result<Outbound> {
    Ok(match mode {
        Mode::Int32 => Outbound::Text(format::int32_text(source.draw_int32()?)),
        Mode::Uniform => Outbound::Text(format::float_text(source.draw_uniform()?)),
        Mode::Normal => Outbound::Text(format::float_text(source.draw_normal()?)),
        Mode::Bytes(n) => Outbound::Binary(source.draw_bytes(n)?),
        Mode::Hex(n) => Outbound::Text(format::hex(&source.draw_bytes(n)?)),
    })
}

fn close_reason(msg: &str) -> String {
    if msg.len() <= MAX_CLOSE_REASON {
        return msg.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}

/// One connection's protocol state.
pub struct Session {
    shared: Arc<Shared>,
    limits: Limits,
    tasks: JoinSet<()>,
}

impl Session {
    /// Create an idle session writing to `outbound`.
    ///
    /// `default_device` addresses commands that carry no device id; with
    /// neither, the registry's sole device is used.
    pub fn new(
        conn: impl Into<String>,
        registry: Arc<SourceRegistry>,
        limits: Limits,
        default_device: Option<String>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                conn: conn.into(),
                registry,
                default_device,
                outbound,
                active: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
                subscription: Mutex::new(Subscription {
                    generation: 0,
                    mode: None,
                }),
                permits: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            }),
            limits,
            tasks: JoinSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Classify one inbound message and spawn the work it asks for.
    /// Never blocks on the device.
    pub fn handle(&mut self, line: &str) {
        while self.tasks.try_join_next().is_some() {}

        let Some(request) = parse_command(line, self.limits.max_size) else {
            log::debug!("[{}] ignored command {line:?}", self.shared.conn);
            return;
        };

        if request.command == Command::Unsubscribe {
            self.shared.cancel();
            if let Some(permit) = self.permit() {
                let shared = Arc::clone(&self.shared);
                self.tasks.spawn(async move {
                    let _ = shared.outbound.send(Outbound::Text(UNSUBSCRIBED.into())).await;
                    drop(permit);
                });
            }
            return;
        }

        let device_id = request
            .device_id
            .as_deref()
            .or(self.shared.default_device.as_deref());
        let source = match self.shared.registry.resolve(device_id) {
            Ok(source) => source,
            Err(e) => {
                log::debug!("[{}] ignored {:?}: {e}", self.shared.conn, request.command);
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        match request.command {
            Command::Subscribe(mode) => {
                let Some(generation) = shared.try_subscribe(mode) else {
                    return;
                };
                self.tasks
                    .spawn(async move { shared.push_loop(source, mode, generation).await });
            }
            command => {
                let Some(permit) = self.permit() else {
                    return;
                };
                self.tasks.spawn(async move {
                    shared.one_shot(source, command).await;
                    drop(permit);
                });
            }
        }
    }

    /// A slot for one more in-flight command, or `None` when the client
    /// already has [`MAX_IN_FLIGHT`] outstanding.
    fn permit(&self) -> Option<OwnedSemaphorePermit> {
        match Arc::clone(&self.shared.permits).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                log::debug!("[{}] too many commands in flight, dropping", self.shared.conn);
                None
            }
        }
    }

    /// Cancel any subscription and wait for every in-flight task.
    pub async fn shutdown(mut self) {
        self.shared.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

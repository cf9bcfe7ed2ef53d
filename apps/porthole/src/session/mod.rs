//! The per-viewer-group state machine. Each session owns one renderer,
//! runs a frame-paced render loop on its own task, and emits
//! full/diff/cursor/selection messages over a broadcast channel that
//! subscriber channels forward to their sockets.

pub mod keymap;
pub mod multiplexer;
pub mod registry;
pub mod server;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::model::{diff, CellPos, FrameSnapshot, Line};
use crate::protocol::{ClientMessage, Modifiers, MouseAction, ServerMessage};
use crate::renderer::{
    FrameCapture, MouseButton, Renderer, RendererError, RendererFactory, SelectionEvent,
    WheelDirection,
};

/// Largest wheel step accepted from the explicit scroll message.
const MAX_SCROLL_LINES: i32 = 50;
/// Outbound frames buffered per subscriber before it starts lagging.
const OUTPUT_BUFFER: usize = 256;

/// Stable opaque identifier of one session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub initial_cols: u16,
    pub initial_rows: u16,
    pub max_cols: u16,
    pub max_rows: u16,
    pub frame_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_cols: 80,
            initial_rows: 24,
            max_cols: 500,
            max_rows: 200,
            frame_rate: 30,
        }
    }
}

impl SessionConfig {
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.initial_cols = cols;
        self.initial_rows = rows;
        self
    }

    fn tick_period(&self) -> Duration {
        Duration::from_millis((1000 / u64::from(self.frame_rate.max(1))).max(1))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid terminal size {cols}x{rows} (maximum {max_cols}x{max_rows})")]
    InvalidSize {
        cols: u16,
        rows: u16,
        max_cols: u16,
        max_rows: u16,
    },
    #[error(transparent)]
    Renderer(#[from] RendererError),
}

/// Opaque token returned by the host application's connection hook and
/// handed back at disposal time.
#[derive(Debug, PartialEq, Eq)]
pub struct HookHandle(pub u64);

/// Host-application lifecycle capability pair: `connected` runs once when
/// the session is created, `disconnected` once during destroy with the
/// handle `connected` returned.
pub trait ConnectionHooks: Send + Sync {
    fn connected(&self, id: &SessionId) -> Option<HookHandle>;
    fn disconnected(&self, handle: HookHandle);
}

/// Hooks that do nothing; the default for hosts without teardown needs.
pub struct NoHooks;

impl ConnectionHooks for NoHooks {
    fn connected(&self, _id: &SessionId) -> Option<HookHandle> {
        None
    }

    fn disconnected(&self, _handle: HookHandle) {}
}

enum SessionCommand {
    Message(ClientMessage),
    /// Clear transmitted state so the next tick emits a full snapshot.
    ForceFull,
    Destroy,
}

/// Control surface of a running session. Cloneable; all clones address
/// the same underlying task.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    output: broadcast::Sender<ServerMessage>,
    destroyed: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Feed one client→server message into the session. Messages sent
    /// after destroy are silently ignored.
    pub fn handle_message(&self, message: ClientMessage) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(SessionCommand::Message(message));
    }

    /// Subscribe to the session's outbound stream. Subscribe before
    /// calling [`force_full`](Self::force_full) so the snapshot that
    /// re-seeds viewer state is observed.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.output.subscribe()
    }

    /// Force the next tick to transmit a full snapshot.
    pub fn force_full(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(SessionCommand::ForceFull);
    }

    /// Tear the session down. Idempotent; no messages are emitted after
    /// the first call.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(SessionCommand::Destroy);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Resolves once the session task has released its renderer.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Factory entry point for sessions; see [`SessionHandle`] for the
/// running surface.
pub struct Session;

impl Session {
    /// Create a session with an eagerly constructed renderer and start
    /// its render loop. Rejects sizes that are zero or beyond the
    /// configured maxima; renderer construction failures propagate.
    pub async fn create(
        id: SessionId,
        config: SessionConfig,
        factory: &dyn RendererFactory,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Result<SessionHandle, SessionError> {
        let SessionConfig {
            initial_cols,
            initial_rows,
            max_cols,
            max_rows,
            ..
        } = config;
        if initial_cols == 0
            || initial_rows == 0
            || initial_cols > max_cols
            || initial_rows > max_rows
        {
            return Err(SessionError::InvalidSize {
                cols: initial_cols,
                rows: initial_rows,
                max_cols,
                max_rows,
            });
        }

        let renderer = factory.create(initial_cols, initial_rows).await?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (output, _) = broadcast::channel(OUTPUT_BUFFER);
        let (done_tx, done_rx) = watch::channel(false);
        let destroyed = Arc::new(AtomicBool::new(false));

        let hook_handle = hooks.connected(&id);
        debug!(session = %id, cols = initial_cols, rows = initial_rows, "session created");

        let worker = SessionLoop {
            id: id.clone(),
            config,
            renderer,
            output: output.clone(),
            destroyed: destroyed.clone(),
            last_lines: Vec::new(),
            last_cursor: None,
            tick_requested: false,
            hooks,
            hook_handle,
        };
        tokio::spawn(worker.run(commands_rx, done_tx));

        Ok(SessionHandle {
            id,
            commands: commands_tx,
            output,
            destroyed,
            done: done_rx,
        })
    }
}

struct SessionLoop {
    id: SessionId,
    config: SessionConfig,
    renderer: Box<dyn Renderer>,
    output: broadcast::Sender<ServerMessage>,
    destroyed: Arc<AtomicBool>,
    last_lines: Vec<Line>,
    last_cursor: Option<(u16, u16, bool)>,
    tick_requested: bool,
    hooks: Arc<dyn ConnectionHooks>,
    hook_handle: Option<HookHandle>,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        done: watch::Sender<bool>,
    ) {
        let mut ticker = interval(self.config.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.render_tick().await;
                }
                command = commands.recv() => {
                    let Some(command) = command else { break 'outer };
                    if self.apply_command(command) {
                        break 'outer;
                    }
                    // Coalesce a burst of queued input into one render so
                    // a tick body never runs more than once per batch.
                    while let Ok(command) = commands.try_recv() {
                        if self.apply_command(command) {
                            break 'outer;
                        }
                    }
                    if self.tick_requested {
                        self.render_tick().await;
                    }
                }
            }
            if self.destroyed.load(Ordering::SeqCst) {
                break;
            }
        }

        self.shutdown();
        let _ = done.send(true);
    }

    /// Returns true when the session should stop.
    fn apply_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Message(message) => {
                self.apply_message(message);
                false
            }
            SessionCommand::ForceFull => {
                self.last_lines.clear();
                self.tick_requested = true;
                false
            }
            SessionCommand::Destroy => true,
        }
    }

    fn apply_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Key { key, modifiers } => {
                self.renderer
                    .press_key(keymap::map_key(&key), modifiers.unwrap_or(Modifiers::NONE));
                self.tick_requested = true;
            }
            ClientMessage::Mouse {
                action,
                x,
                y,
                button,
            } => {
                match action {
                    MouseAction::Down => self.renderer.mouse_down(x, y, map_button(button)),
                    MouseAction::Up => self.renderer.mouse_up(x, y, map_button(button)),
                    MouseAction::Move => self.renderer.mouse_move(x, y),
                    MouseAction::Scroll => {
                        let direction = if button == Some(4) {
                            WheelDirection::Up
                        } else {
                            WheelDirection::Down
                        };
                        self.renderer.wheel(x, y, direction, 1);
                    }
                }
                self.tick_requested = true;
            }
            ClientMessage::Scroll { x, y, lines } => {
                let lines = lines.clamp(-MAX_SCROLL_LINES, MAX_SCROLL_LINES);
                if lines != 0 {
                    let direction = if lines > 0 {
                        WheelDirection::Down
                    } else {
                        WheelDirection::Up
                    };
                    self.renderer.wheel(x, y, direction, lines.unsigned_abs());
                }
                self.tick_requested = true;
            }
            ClientMessage::Resize { cols, rows } => self.apply_resize(cols, rows),
            ClientMessage::Ping => {
                // Answered synchronously; pings never schedule a render.
                self.send(ServerMessage::Pong);
            }
        }
    }

    fn apply_resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.clamp(1, self.config.max_cols);
        let rows = rows.clamp(1, self.config.max_rows);
        trace!(session = %self.id, cols, rows, "resize");
        self.renderer.resize(cols, rows);
        self.last_lines.clear();
        self.tick_requested = true;
    }

    async fn render_tick(&mut self) {
        self.tick_requested = false;
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.renderer.render_once().await {
            warn!(session = %self.id, error = %err, "render tick failed");
            self.send(ServerMessage::Error {
                message: err.to_string(),
            });
            return;
        }
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let frame = self.renderer.capture();

        if self.last_lines.is_empty() {
            let snapshot = snapshot_from(&frame);
            self.last_cursor = Some(cursor_state(&frame));
            self.last_lines = frame.lines;
            self.send(ServerMessage::Full { data: snapshot });
            self.forward_selection();
            return;
        }

        let changes = diff(&self.last_lines, &frame.lines);
        if !changes.is_empty() {
            // More than half the screen changed: a full redraw is
            // cheaper on the wire than the delta.
            if changes.len() * 2 > frame.lines.len() {
                self.send(ServerMessage::Full {
                    data: snapshot_from(&frame),
                });
            } else {
                self.send(ServerMessage::Diff { changes });
            }
            self.last_lines = frame.lines.clone();
        }

        let cursor = cursor_state(&frame);
        if self.last_cursor != Some(cursor) {
            self.last_cursor = Some(cursor);
            let (x, y, visible) = cursor;
            self.send(ServerMessage::Cursor { x, y, visible });
        }

        self.forward_selection();
    }

    fn forward_selection(&mut self) {
        while let Some(event) = self.renderer.poll_selection() {
            let message = match event {
                SelectionEvent::Changed { anchor, focus } => ServerMessage::Selection {
                    anchor: CellPos::new(anchor.0 + 1, anchor.1 + 1),
                    focus: CellPos::new(focus.0 + 1, focus.1 + 1),
                },
                SelectionEvent::Cleared => ServerMessage::SelectionClear,
            };
            self.send(message);
        }
    }

    fn send(&self, message: ServerMessage) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        // No receivers just means no viewer is attached yet.
        let _ = self.output.send(message);
    }

    fn shutdown(&mut self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.hook_handle.take() {
            let hooks = self.hooks.clone();
            if catch_unwind(AssertUnwindSafe(|| hooks.disconnected(handle))).is_err() {
                warn!(session = %self.id, "connection hook panicked during disposal");
            }
        }
        self.renderer.destroy();
        debug!(session = %self.id, "session destroyed");
    }
}

fn map_button(button: Option<u8>) -> MouseButton {
    match button {
        Some(1) => MouseButton::Middle,
        Some(2) => MouseButton::Right,
        _ => MouseButton::Left,
    }
}

fn cursor_state(frame: &FrameCapture) -> (u16, u16, bool) {
    // The façade reports 0-based cells; the wire is 1-based.
    (
        frame.cursor_col + 1,
        frame.cursor_row + 1,
        frame.cursor_visible,
    )
}

fn snapshot_from(frame: &FrameCapture) -> FrameSnapshot {
    FrameSnapshot::new(
        frame.cols,
        frame.rows,
        CellPos::new(frame.cursor_col + 1, frame.cursor_row + 1),
        frame.cursor_visible,
        frame.offset,
        frame.lines.clone(),
    )
}

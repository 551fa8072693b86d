//! Headless embedded compositor.
//!
//! Hosts native wayland clients and legacy X11 clients (through an
//! Xwayland bridge) on a non-display backend, forwards host input into
//! the focused surface, and exports composed frames as shareable GPU
//! buffers the viewer imports like any other captured frame.
//!
//! One owned thread runs the wayland display and its calloop event loop;
//! everything window-system-side mutates only on that thread. The host
//! talks to it through bounded SPSC queues plus a calloop ping.

mod buffer;
mod keymap;
mod present;
mod seat;
mod shell;
mod state;
mod xwm;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use calloop::EventLoop;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use wayland_server::{Display, ListeningSocket};

use goggles_core::spsc::{self, SpscSender};
use goggles_core::{Error, ErrorKind, ExternalImageFrame, Result};
use goggles_render::gpu::Context;

use state::ServerState;

/// Queue depth for host → compositor requests.
const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Sentinel meaning "no focus change requested".
pub(crate) const NO_FOCUS_TARGET: u32 = 0;

/// Normalized input from the host window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    /// Linux keycode.
    Key { code: u32, pressed: bool },
    /// Relative motion in surface pixels.
    PointerMotion { dx: f64, dy: f64 },
    /// Linux button code (BTN_LEFT...).
    PointerButton { code: u32, pressed: bool },
    PointerAxis { value: f64, horizontal: bool },
}

/// Which window protocol a hosted surface arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    Native,
    Legacy,
}

/// Host-visible description of a hosted top-level surface.
#[derive(Debug, Clone)]
pub struct SurfaceInfo {
    pub id: u32,
    pub kind: SurfaceKind,
    pub title: String,
    pub class: String,
    pub mapped: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ResizeRequest {
    pub surface_id: u32,
    pub width: u32,
    pub height: u32,
    pub maximized: bool,
}

/// The frame snapshot shared with the host thread.
pub(crate) struct SharedState {
    pub frame: Mutex<Option<ExternalImageFrame>>,
    pub surfaces: Mutex<Vec<SurfaceInfo>>,
    pub x11_display: Mutex<Option<String>>,
}

/// Handle to the compositor thread. Dropping it shuts the display down.
pub struct EmbeddedCompositor {
    input_tx: SpscSender<InputEvent>,
    resize_tx: SpscSender<ResizeRequest>,
    focus_target: Arc<AtomicU32>,
    present_reset: Arc<AtomicBool>,
    pointer_locked: Arc<AtomicBool>,
    cursor_visible: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    shared: Arc<SharedState>,
    wake: calloop::ping::Ping,
    wayland_display: String,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EmbeddedCompositor {
    /// Starts the compositor thread on the given headless GPU context.
    pub fn spawn(gpu: Arc<Context>) -> Result<Self> {
        let socket = ListeningSocket::bind_auto("wayland", 1..33).map_err(|e| {
            Error::new(
                ErrorKind::CaptureInitFailed,
                format!("Failed to bind wayland socket: {e}"),
            )
        })?;
        let wayland_display = socket
            .socket_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::new(ErrorKind::CaptureInitFailed, "Wayland socket has no name")
            })?;

        let (input_tx, input_rx) = spsc::channel(REQUEST_QUEUE_CAPACITY);
        let (resize_tx, resize_rx) = spsc::channel(REQUEST_QUEUE_CAPACITY);
        let focus_target = Arc::new(AtomicU32::new(NO_FOCUS_TARGET));
        let present_reset = Arc::new(AtomicBool::new(false));
        let pointer_locked = Arc::new(AtomicBool::new(false));
        let cursor_visible = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(SharedState {
            frame: Mutex::new(None),
            surfaces: Mutex::new(Vec::new()),
            x11_display: Mutex::new(None),
        });

        let (wake, wake_source) = calloop::ping::make_ping().map_err(|e| {
            Error::new(
                ErrorKind::CaptureInitFailed,
                format!("Failed to create wake ping: {e}"),
            )
        })?;

        let thread_args = RunArgs {
            gpu,
            socket,
            wake_source,
            input_rx,
            resize_rx,
            focus_target: Arc::clone(&focus_target),
            present_reset: Arc::clone(&present_reset),
            pointer_locked: Arc::clone(&pointer_locked),
            cursor_visible: Arc::clone(&cursor_visible),
            shutdown: Arc::clone(&shutdown),
            shared: Arc::clone(&shared),
            wayland_display: wayland_display.clone(),
        };

        let thread = std::thread::Builder::new()
            .name("goggles-compositor".into())
            .spawn(move || {
                if let Err(e) = run(thread_args) {
                    error!("Compositor event loop exited with error: {e}");
                }
            })
            .map_err(|e| {
                Error::new(
                    ErrorKind::CaptureInitFailed,
                    format!("Failed to spawn compositor thread: {e}"),
                )
            })?;

        info!("Embedded compositor listening on {wayland_display}");
        Ok(Self {
            input_tx,
            resize_tx,
            focus_target,
            present_reset,
            pointer_locked,
            cursor_visible,
            shutdown,
            shared,
            wake,
            wayland_display,
            thread: Some(thread),
        })
    }

    /// Name of the wayland socket guest clients should connect to.
    pub fn wayland_display(&self) -> &str {
        &self.wayland_display
    }

    /// X display name once Xwayland is up (e.g. `:2`).
    pub fn x11_display(&self) -> Option<String> {
        self.shared.x11_display.lock().clone()
    }

    /// Queues one input event toward the focused surface. Returns false
    /// when the queue is full and the event was dropped.
    pub fn inject_event(&self, event: InputEvent) -> bool {
        match self.input_tx.try_push(event) {
            Ok(()) => {
                self.wake.ping();
                true
            }
            Err(_) => {
                debug!("Compositor input queue full, dropping event");
                false
            }
        }
    }

    /// Directs future input at the surface with this id.
    pub fn set_input_target(&self, surface_id: u32) {
        if surface_id == NO_FOCUS_TARGET {
            return;
        }
        self.focus_target.store(surface_id, Ordering::Release);
        self.wake.ping();
    }

    /// Asks the guest surface to resize.
    pub fn request_resize(&self, surface_id: u32, width: u32, height: u32, maximized: bool) {
        if surface_id == NO_FOCUS_TARGET {
            return;
        }
        let request = ResizeRequest {
            surface_id,
            width,
            height,
            maximized,
        };
        if self.resize_tx.try_push(request).is_err() {
            debug!("Compositor resize queue full, dropping request");
            return;
        }
        self.wake.ping();
    }

    /// Forces a re-render of the focused surface on the next loop turn.
    pub fn request_present_reset(&self) {
        self.present_reset.store(true, Ordering::Release);
        self.wake.ping();
    }

    /// Latest composed frame, if newer than `after`. The handle in the
    /// returned frame is an independently owned duplicate.
    pub fn latest(&self, after: u64) -> Option<ExternalImageFrame> {
        let guard = self.shared.frame.lock();
        let stored = guard.as_ref()?;
        if stored.frame_number <= after {
            return None;
        }
        stored.dup()
    }

    pub fn surfaces(&self) -> Vec<SurfaceInfo> {
        self.shared.surfaces.lock().clone()
    }

    /// Whether a guest currently holds a pointer lock (mouse capture).
    pub fn is_pointer_locked(&self) -> bool {
        self.pointer_locked.load(Ordering::Acquire)
    }

    pub fn set_cursor_visible(&self, visible: bool) {
        self.cursor_visible.store(visible, Ordering::Release);
        self.request_present_reset();
    }

    /// Stops the event loop and joins the thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.ping();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Compositor thread panicked during shutdown");
            }
        }
    }
}

impl Drop for EmbeddedCompositor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RunArgs {
    gpu: Arc<Context>,
    socket: ListeningSocket,
    wake_source: calloop::ping::PingSource,
    input_rx: spsc::SpscReceiver<InputEvent>,
    resize_rx: spsc::SpscReceiver<ResizeRequest>,
    focus_target: Arc<AtomicU32>,
    present_reset: Arc<AtomicBool>,
    pointer_locked: Arc<AtomicBool>,
    cursor_visible: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    shared: Arc<SharedState>,
    wayland_display: String,
}

/// The compositor thread body: wayland dispatch, host requests, X11
/// bridge pump, frame publication.
fn run(args: RunArgs) -> Result<()> {
    let RunArgs {
        gpu,
        socket,
        wake_source,
        input_rx,
        resize_rx,
        focus_target,
        present_reset,
        pointer_locked,
        cursor_visible,
        shutdown,
        shared,
        wayland_display,
    } = args;

    // The loop and display live entirely on this thread.
    let mut event_loop: EventLoop<'_, ServerState> = EventLoop::try_new().map_err(|e| {
        Error::new(
            ErrorKind::CaptureInitFailed,
            format!("Failed to create event loop: {e}"),
        )
    })?;

    let mut display: Display<ServerState> = Display::new().map_err(|e| {
        Error::new(
            ErrorKind::CaptureInitFailed,
            format!("Failed to create wayland display: {e}"),
        )
    })?;

    let mut state = ServerState::new(
        display.handle(),
        gpu,
        input_rx,
        resize_rx,
        focus_target,
        present_reset,
        pointer_locked,
        cursor_visible,
        Arc::clone(&shared),
    )?;

    // The X11 bridge is best-effort: native clients keep working when
    // Xwayland is not installed.
    match xwm::Xwm::spawn(&display.handle(), &wayland_display) {
        Ok(xwm) => {
            *shared.x11_display.lock() = Some(xwm.display_name().to_string());
            state.xwm = Some(xwm);
        }
        Err(e) => warn!("Xwayland unavailable: {e}"),
    }

    event_loop
        .handle()
        .insert_source(wake_source, |_, _, _state| {
            // Wakeup only; work happens in the loop body below.
        })
        .map_err(|e| {
            Error::new(
                ErrorKind::CaptureInitFailed,
                format!("Failed to register wake source: {e}"),
            )
        })?;

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        event_loop
            .dispatch(Some(Duration::from_millis(8)), &mut state)
            .map_err(|e| {
                Error::new(
                    ErrorKind::CaptureFrameFailed,
                    format!("Event loop dispatch failed: {e}"),
                )
            })?;

        // Accept pending guest connections.
        while let Ok(Some(stream)) = socket.accept() {
            let _ = display
                .handle()
                .insert_client(stream, Arc::new(state::ClientState));
            debug!("Guest client connected");
        }

        if let Err(e) = display.dispatch_clients(&mut state) {
            warn!("Client dispatch error: {e}");
        }

        // Focus and resize requests are applied before the input drain so
        // queued events land on the intended surface.
        state.process_host_requests();
        state.pump_xwm();
        state.flush_presentation();

        let _ = display.flush_clients();
    }

    info!("Compositor event loop stopped");
    Ok(())
}

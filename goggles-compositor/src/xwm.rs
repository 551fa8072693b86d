//! Legacy client support: spawns a rootless Xwayland and manages its
//! windows over x11rb, acting as the window manager.
//!
//! X windows become toplevel records like native ones; their pixels
//! arrive through the wayland side (Xwayland is itself a wayland client)
//! and are matched to X windows via WL_SURFACE_ID client messages.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use tracing::{debug, info, warn};
use wayland_server::protocol::wl_surface;
use wayland_server::{Client, DisplayHandle, Resource};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ClientMessageEvent, ConfigureWindowAux, ConnectionExt,
    EventMask, InputFocus, PropMode, StackMode, Window,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::state::{ServerState, SurfaceRole, ToplevelRecord};
use crate::SurfaceKind;

struct Atoms {
    wl_surface_id: u32,
    net_active_window: u32,
    net_wm_name: u32,
    utf8_string: u32,
}

pub(crate) struct Xwm {
    child: Child,
    conn: RustConnection,
    root: Window,
    atoms: Atoms,
    display_name: String,
    xwayland_client: Client,
    dh: DisplayHandle,
    /// WL_SURFACE_ID seen before the matching wl_surface existed.
    pending_associations: Vec<(Window, u32)>,
}

impl Xwm {
    /// Spawns `Xwayland -rootless` against our wayland display and
    /// connects to it as the window manager.
    pub fn spawn(dh: &DisplayHandle, wayland_display: &str) -> io::Result<Self> {
        // Socketpair for Xwayland's wayland connection; the child end is
        // passed through WAYLAND_SOCKET.
        let mut wl_fds = [0i32; 2];
        if unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, wl_fds.as_mut_ptr())
        } < 0
        {
            return Err(io::Error::last_os_error());
        }
        let our_end = unsafe { OwnedFd::from_raw_fd(wl_fds[0]) };
        let child_end = unsafe { OwnedFd::from_raw_fd(wl_fds[1]) };

        // Pipe Xwayland reports its display number through.
        let mut display_fds = [0i32; 2];
        if unsafe { libc::pipe(display_fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let display_read = unsafe { OwnedFd::from_raw_fd(display_fds[0]) };
        let display_write = unsafe { OwnedFd::from_raw_fd(display_fds[1]) };

        let child = Command::new("Xwayland")
            .arg("-rootless")
            .arg("-terminate")
            .arg("-displayfd")
            .arg(raw_fd_string(&display_write))
            .env("WAYLAND_DISPLAY", wayland_display)
            .env("WAYLAND_SOCKET", raw_fd_string(&child_end))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        drop(display_write);
        drop(child_end);

        let display_number = read_display_number(&display_read)?;
        let display_name = format!(":{display_number}");
        info!("Xwayland up on {display_name}");

        let xwayland_client = dh
            .insert_client(
                UnixStream::from(our_end),
                Arc::new(crate::state::ClientState),
            )
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let (conn, screen_num) = x11rb::connect(Some(&display_name))
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
        let root = conn.setup().roots[screen_num].root;

        // Claim substructure redirection: that is what makes us the WM.
        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().event_mask(
                EventMask::SUBSTRUCTURE_REDIRECT
                    | EventMask::SUBSTRUCTURE_NOTIFY
                    | EventMask::PROPERTY_CHANGE,
            ),
        )
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let atoms = Atoms {
            wl_surface_id: intern(&conn, b"WL_SURFACE_ID")?,
            net_active_window: intern(&conn, b"_NET_ACTIVE_WINDOW")?,
            net_wm_name: intern(&conn, b"_NET_WM_NAME")?,
            utf8_string: intern(&conn, b"UTF8_STRING")?,
        };
        conn.flush()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(Self {
            child,
            conn,
            root,
            atoms,
            display_name,
            xwayland_client,
            dh: dh.clone(),
            pending_associations: Vec::new(),
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Drains pending X events. Runs on the compositor event loop.
    pub fn pump(&mut self, state: &mut ServerState) {
        loop {
            let event = match self.conn.poll_for_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    warn!("X connection error: {e}");
                    return;
                }
            };
            self.handle_event(state, event);
        }

        self.retry_pending_associations(state);
        let _ = self.conn.flush();
    }

    fn handle_event(&mut self, state: &mut ServerState, event: Event) {
        match event {
            Event::CreateNotify(e) => {
                let id = state.alloc_toplevel_id();
                state.toplevels.insert(
                    id,
                    ToplevelRecord {
                        id,
                        kind: SurfaceKind::Legacy,
                        surface_key: None,
                        xdg_toplevel: None,
                        xdg_surface: None,
                        x11_window: Some(e.window),
                        title: String::new(),
                        class: String::new(),
                        mapped: false,
                        override_redirect: e.override_redirect,
                        x: i32::from(e.x),
                        y: i32::from(e.y),
                        width: u32::from(e.width),
                        height: u32::from(e.height),
                    },
                );
                debug!(
                    "X window {:#x} created (override_redirect={})",
                    e.window, e.override_redirect
                );
            }
            Event::MapRequest(e) => {
                let _ = self.conn.map_window(e.window);
            }
            Event::MapNotify(e) => {
                if let Some(id) = self.window_id(state, e.window) {
                    state.toplevel_mapped(id);
                    self.refresh_window_props(state, e.window);
                }
            }
            Event::UnmapNotify(e) => {
                if let Some(id) = self.window_id(state, e.window) {
                    if let Some(record) = state.toplevels.get_mut(&id) {
                        record.mapped = false;
                    }
                    state.publish_surfaces();
                    state.needs_present = true;
                }
            }
            Event::DestroyNotify(e) => {
                if let Some(id) = self.window_id(state, e.window) {
                    debug!("X window {:#x} destroyed", e.window);
                    state.remove_toplevel(id);
                }
                self.pending_associations.retain(|(w, _)| *w != e.window);
            }
            Event::ConfigureRequest(e) => {
                let aux = ConfigureWindowAux::from_configure_request(&e);
                let _ = self.conn.configure_window(e.window, &aux);
            }
            Event::ConfigureNotify(e) => {
                if let Some(id) = self.window_id(state, e.window) {
                    if let Some(record) = state.toplevels.get_mut(&id) {
                        record.x = i32::from(e.x);
                        record.y = i32::from(e.y);
                        record.width = u32::from(e.width);
                        record.height = u32::from(e.height);
                    }
                }
            }
            Event::PropertyNotify(e) => {
                self.refresh_window_props(state, e.window);
            }
            Event::ClientMessage(e) => {
                self.handle_client_message(state, e);
            }
            _ => {}
        }
    }

    fn handle_client_message(&mut self, state: &mut ServerState, event: ClientMessageEvent) {
        if u32::from(event.type_) != self.atoms.wl_surface_id {
            return;
        }
        let surface_id = event.data.as_data32()[0];
        if !self.associate(state, event.window, surface_id) {
            self.pending_associations.push((event.window, surface_id));
        }
    }

    fn retry_pending_associations(&mut self, state: &mut ServerState) {
        let pending = std::mem::take(&mut self.pending_associations);
        for (window, surface_id) in pending {
            if !self.associate(state, window, surface_id) {
                self.pending_associations.push((window, surface_id));
            }
        }
    }

    /// Pairs an X window with the wl_surface Xwayland created for it.
    fn associate(&self, state: &mut ServerState, window: Window, surface_id: u32) -> bool {
        let Ok(surface) = self
            .xwayland_client
            .object_from_protocol_id::<wl_surface::WlSurface>(&self.dh, surface_id)
        else {
            return false;
        };

        let Some(id) = self.window_id(state, window) else {
            return false;
        };
        let key = surface.id();
        state.surface_record(&surface).role = SurfaceRole::Toplevel(id);
        if let Some(record) = state.toplevels.get_mut(&id) {
            record.surface_key = Some(key);
        }
        debug!("X window {window:#x} associated with surface {id}");
        state.needs_present = true;
        true
    }

    fn window_id(&self, state: &ServerState, window: Window) -> Option<u32> {
        state
            .toplevels
            .values()
            .find(|t| t.x11_window == Some(window))
            .map(|t| t.id)
    }

    fn refresh_window_props(&self, state: &mut ServerState, window: Window) {
        let Some(id) = self.window_id(state, window) else {
            return;
        };

        let title = self
            .read_text_property(window, self.atoms.net_wm_name, self.atoms.utf8_string)
            .or_else(|| {
                self.read_text_property(
                    window,
                    u32::from(AtomEnum::WM_NAME),
                    u32::from(AtomEnum::STRING),
                )
            });
        let class = self.read_text_property(
            window,
            u32::from(AtomEnum::WM_CLASS),
            u32::from(AtomEnum::STRING),
        );

        if let Some(record) = state.toplevels.get_mut(&id) {
            if let Some(title) = title {
                record.title = title;
            }
            if let Some(class) = class {
                // WM_CLASS is two NUL-separated strings; the class name
                // is the second.
                record.class = class
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .last()
                    .unwrap_or("")
                    .to_string();
            }
        }
        state.publish_surfaces();
    }

    fn read_text_property(&self, window: Window, property: u32, ty: u32) -> Option<String> {
        let reply = self
            .conn
            .get_property(false, window, property, ty, 0, 1024)
            .ok()?
            .reply()
            .ok()?;
        if reply.value.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&reply.value).into_owned())
    }

    /// Legacy focus: input focus plus raise plus the EWMH active-window
    /// hint, re-applied before every event per the protocol contract.
    pub fn activate(&mut self, window: Window) {
        let _ = self
            .conn
            .set_input_focus(InputFocus::POINTER_ROOT, window, x11rb::CURRENT_TIME);
        let _ = self.conn.configure_window(
            window,
            &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE),
        );
        let _ = self.conn.change_property32(
            PropMode::REPLACE,
            self.root,
            self.atoms.net_active_window,
            AtomEnum::WINDOW,
            &[window],
        );
        let _ = self.conn.flush();
    }

    pub fn configure_window(&mut self, window: Window, width: u16, height: u16, _maximized: bool) {
        let _ = self.conn.configure_window(
            window,
            &ConfigureWindowAux::new()
                .width(u32::from(width))
                .height(u32::from(height)),
        );
        let _ = self.conn.flush();
    }
}

impl Drop for Xwm {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn intern(conn: &RustConnection, name: &[u8]) -> io::Result<u32> {
    let cookie = conn
        .intern_atom(false, name)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let reply = cookie
        .reply()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(reply.atom)
}

fn raw_fd_string(fd: &OwnedFd) -> String {
    use std::os::fd::AsRawFd;
    fd.as_raw_fd().to_string()
}

/// Waits for Xwayland to report its display number on the pipe.
fn read_display_number(read_end: &OwnedFd) -> io::Result<u32> {
    use std::os::fd::AsRawFd;

    let mut pfd = libc::pollfd {
        fd: read_end.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // Xwayland start is slow under load; allow a generous window.
    let rc = unsafe { libc::poll(&mut pfd, 1, 10_000) };
    if rc <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "Xwayland did not report a display",
        ));
    }

    let mut buf = [0u8; 16];
    let n = unsafe {
        libc::read(
            read_end.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if n <= 0 {
        return Err(io::Error::last_os_error());
    }
    let text = std::str::from_utf8(&buf[..n as usize])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad displayfd data"))?;
    text.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad display number"))
}

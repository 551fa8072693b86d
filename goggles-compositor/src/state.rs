//! Central compositor state: the surface registry and the core wayland
//! globals (compositor, subcompositor, output).
//!
//! Window-system objects carry no cross-references; every record lives in
//! a registry keyed by object id or by the stable surface id handed to
//! the host, and all mutation goes through lookups here.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info};
use wayland_server::backend::{ClientData, ClientId, DisconnectReason, ObjectId};
use wayland_server::protocol::{
    wl_buffer, wl_callback, wl_compositor, wl_output, wl_region, wl_subcompositor, wl_subsurface,
    wl_surface,
};
use wayland_server::{
    Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource,
};

use goggles_core::spsc::SpscReceiver;
use goggles_core::Result;
use goggles_render::gpu::Context;

use crate::present::FrameComposer;
use crate::seat::{ConstraintState, CursorState, SeatState};
use crate::xwm::Xwm;
use crate::{InputEvent, ResizeRequest, SharedState, SurfaceInfo, SurfaceKind, NO_FOCUS_TARGET};

/// Virtual output advertised to guests.
pub(crate) const OUTPUT_WIDTH: i32 = 1920;
pub(crate) const OUTPUT_HEIGHT: i32 = 1080;

pub(crate) struct ClientState;

impl ClientData for ClientState {
    fn initialized(&self, _client_id: ClientId) {}
    fn disconnected(&self, _client_id: ClientId, _reason: DisconnectReason) {}
}

/// Role a wl_surface has taken.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum SurfaceRole {
    #[default]
    None,
    /// Root surface of the hosted toplevel with this id.
    Toplevel(u32),
    /// Popup attached to the toplevel with this id.
    Popup(u32),
    Subsurface,
}

#[derive(Default)]
pub(crate) struct SurfaceRecord {
    pub surface: Option<wl_surface::WlSurface>,
    /// `Some(None)` is an explicit null attach.
    pub pending_buffer: Option<Option<wl_buffer::WlBuffer>>,
    pub current_buffer: Option<wl_buffer::WlBuffer>,
    pub frame_callbacks: Vec<wl_callback::WlCallback>,
    pub role: SurfaceRole,
}

/// One hosted top-level window, native or legacy.
pub(crate) struct ToplevelRecord {
    pub id: u32,
    pub kind: SurfaceKind,
    pub surface_key: Option<ObjectId>,
    pub xdg_toplevel: Option<
        wayland_protocols::xdg::shell::server::xdg_toplevel::XdgToplevel,
    >,
    pub xdg_surface: Option<
        wayland_protocols::xdg::shell::server::xdg_surface::XdgSurface,
    >,
    pub x11_window: Option<u32>,
    pub title: String,
    pub class: String,
    pub mapped: bool,
    pub override_redirect: bool,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

pub(crate) struct ServerState {
    pub dh: DisplayHandle,
    pub gpu: Arc<Context>,
    pub composer: FrameComposer,

    pub surfaces: FxHashMap<ObjectId, SurfaceRecord>,
    /// Rects added to wl_regions, for constraint bounding boxes.
    pub regions: FxHashMap<ObjectId, Vec<(i32, i32, i32, i32)>>,
    pub toplevels: FxHashMap<u32, ToplevelRecord>,
    /// Mapping order, oldest first; focus falls back to the most recent.
    pub map_order: Vec<u32>,
    next_toplevel_id: u32,

    pub seat: SeatState,
    pub cursor: CursorState,
    pub constraint: ConstraintState,

    pub input_rx: SpscReceiver<InputEvent>,
    pub resize_rx: SpscReceiver<ResizeRequest>,
    pub focus_target: Arc<AtomicU32>,
    pub present_reset: Arc<AtomicBool>,
    pub pointer_locked: Arc<AtomicBool>,
    pub cursor_visible: Arc<AtomicBool>,
    pub shared: Arc<SharedState>,

    pub xwm: Option<Xwm>,
    pub needs_present: bool,
    serial: u32,
}

impl ServerState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dh: DisplayHandle,
        gpu: Arc<Context>,
        input_rx: SpscReceiver<InputEvent>,
        resize_rx: SpscReceiver<ResizeRequest>,
        focus_target: Arc<AtomicU32>,
        present_reset: Arc<AtomicBool>,
        pointer_locked: Arc<AtomicBool>,
        cursor_visible: Arc<AtomicBool>,
        shared: Arc<SharedState>,
    ) -> Result<Self> {
        dh.create_global::<Self, wl_compositor::WlCompositor, ()>(4, ());
        dh.create_global::<Self, wl_subcompositor::WlSubcompositor, ()>(1, ());
        dh.create_global::<Self, wl_output::WlOutput, ()>(2, ());
        crate::buffer::create_globals(&dh);
        crate::shell::create_globals(&dh);
        crate::seat::create_globals(&dh);

        let composer = FrameComposer::new(Arc::clone(&gpu))?;

        Ok(Self {
            dh,
            gpu,
            composer,
            surfaces: FxHashMap::default(),
            regions: FxHashMap::default(),
            toplevels: FxHashMap::default(),
            map_order: Vec::new(),
            next_toplevel_id: 1,
            seat: SeatState::default(),
            cursor: CursorState::default(),
            constraint: ConstraintState::default(),
            input_rx,
            resize_rx,
            focus_target,
            present_reset,
            pointer_locked,
            cursor_visible,
            shared,
            xwm: None,
            needs_present: false,
            serial: 0,
        })
    }

    pub fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }

    pub fn alloc_toplevel_id(&mut self) -> u32 {
        let id = self.next_toplevel_id;
        self.next_toplevel_id += 1;
        id
    }

    pub fn surface_record(&mut self, surface: &wl_surface::WlSurface) -> &mut SurfaceRecord {
        self.surfaces.entry(surface.id()).or_default()
    }

    /// Focused toplevel id, if any.
    pub fn focused_id(&self) -> Option<u32> {
        self.seat.focused
    }

    pub fn focused_toplevel(&self) -> Option<&ToplevelRecord> {
        self.seat.focused.and_then(|id| self.toplevels.get(&id))
    }

    /// Host-side requests are handled before the input drain so events
    /// are dispatched to the surface they were aimed at.
    pub fn process_host_requests(&mut self) {
        let focus_id = self.focus_target.swap(NO_FOCUS_TARGET, Ordering::AcqRel);
        if focus_id != NO_FOCUS_TARGET {
            crate::seat::focus_surface_by_id(self, focus_id);
        }

        while let Some(request) = self.resize_rx.try_pop() {
            self.apply_resize_request(request);
        }

        if self.present_reset.swap(false, Ordering::AcqRel) {
            self.needs_present = true;
        }

        crate::seat::drain_input(self);
    }

    pub fn pump_xwm(&mut self) {
        if let Some(mut xwm) = self.xwm.take() {
            xwm.pump(self);
            self.xwm = Some(xwm);
        }
    }

    pub fn flush_presentation(&mut self) {
        if !self.needs_present {
            return;
        }
        self.needs_present = false;
        crate::present::render_focused(self);
    }

    fn apply_resize_request(&mut self, request: ResizeRequest) {
        let Some(record) = self.toplevels.get(&request.surface_id) else {
            return;
        };

        match record.kind {
            SurfaceKind::Native => {
                if let (Some(toplevel), Some(xdg_surface)) =
                    (record.xdg_toplevel.clone(), record.xdg_surface.clone())
                {
                    let states: Vec<u8> = if request.maximized {
                        // xdg_toplevel::State::Maximized on the wire.
                        1u32.to_ne_bytes().to_vec()
                    } else {
                        Vec::new()
                    };
                    toplevel.configure(request.width as i32, request.height as i32, states);
                    let serial = self.next_serial();
                    xdg_surface.configure(serial);
                }
            }
            SurfaceKind::Legacy => {
                if let (Some(window), Some(xwm)) = (record.x11_window, self.xwm.as_mut()) {
                    // X11 geometry is 16-bit on the wire.
                    let width = request.width.min(u32::from(u16::MAX)) as u16;
                    let height = request.height.min(u32::from(u16::MAX)) as u16;
                    xwm.configure_window(window, width, height, request.maximized);
                }
            }
        }

        self.needs_present = true;
    }

    /// Registers a freshly mapped toplevel and publishes the new list.
    pub fn toplevel_mapped(&mut self, id: u32) {
        if let Some(record) = self.toplevels.get_mut(&id) {
            record.mapped = true;
        }
        self.map_order.retain(|&other| other != id);
        self.map_order.push(id);

        // First window in gets focus without host intervention.
        if self.seat.focused.is_none() {
            crate::seat::focus_surface_by_id(self, id);
        }
        self.publish_surfaces();
        self.needs_present = true;
    }

    /// Removes a toplevel; focus falls back to the most recently mapped
    /// survivor, preferring legacy clients (which cannot signal their
    /// disconnect cleanly).
    pub fn remove_toplevel(&mut self, id: u32) {
        let was_focused = self.seat.focused == Some(id);
        if let Some(record) = self.toplevels.remove(&id) {
            if let Some(key) = record.surface_key {
                self.surfaces.remove(&key);
            }
        }
        self.map_order.retain(|&other| other != id);

        if was_focused {
            self.seat.focused = None;
            self.auto_focus_next_surface();
        }
        self.publish_surfaces();
    }

    fn auto_focus_next_surface(&mut self) {
        let next_legacy = self
            .map_order
            .iter()
            .rev()
            .copied()
            .find(|id| {
                self.toplevels
                    .get(id)
                    .is_some_and(|t| t.mapped && !t.override_redirect && t.kind == SurfaceKind::Legacy)
            });
        let next = next_legacy.or_else(|| {
            self.map_order.iter().rev().copied().find(|id| {
                self.toplevels
                    .get(id)
                    .is_some_and(|t| t.mapped && !t.override_redirect)
            })
        });

        match next {
            Some(id) => crate::seat::focus_surface_by_id(self, id),
            None => {
                *self.shared.frame.lock() = None;
                self.needs_present = false;
            }
        }
    }

    pub fn publish_surfaces(&self) {
        let mut list: Vec<SurfaceInfo> = self
            .toplevels
            .values()
            .filter(|t| !t.override_redirect)
            .map(|t| SurfaceInfo {
                id: t.id,
                kind: t.kind,
                title: t.title.clone(),
                class: t.class.clone(),
                mapped: t.mapped,
            })
            .collect();
        list.sort_by_key(|info| info.id);
        *self.shared.surfaces.lock() = list;
    }

    /// True when `key` is the focused root surface or one of its popup or
    /// override-redirect children.
    pub fn belongs_to_focused_tree(&self, key: &ObjectId) -> bool {
        let Some(focused) = self.focused_toplevel() else {
            return false;
        };
        if focused.surface_key.as_ref() == Some(key) {
            return true;
        }
        if let Some(record) = self.surfaces.get(key) {
            if let SurfaceRole::Popup(root) = record.role {
                return root == focused.id;
            }
        }
        // Legacy override-redirect children of the focused window.
        self.toplevels.values().any(|t| {
            t.override_redirect && t.surface_key.as_ref() == Some(key) && t.mapped
        })
    }

    fn commit_surface(&mut self, surface: &wl_surface::WlSurface) {
        let key = surface.id();
        let time = crate::seat::time_msec();

        let record = self.surfaces.entry(key.clone()).or_default();
        if let Some(pending) = record.pending_buffer.take() {
            if let Some(previous) = record.current_buffer.take() {
                previous.release();
            }
            record.current_buffer = pending;
        }
        for callback in record.frame_callbacks.drain(..) {
            callback.done(time);
        }

        // First commit with a buffer maps an xdg toplevel.
        let role = record.role.clone();
        let has_buffer = record.current_buffer.is_some();
        match role {
            SurfaceRole::Toplevel(id) => {
                let newly_mapped = has_buffer
                    && self
                        .toplevels
                        .get(&id)
                        .is_some_and(|t| !t.mapped);
                if newly_mapped {
                    info!("Toplevel {id} mapped");
                    self.toplevel_mapped(id);
                }
            }
            _ => {}
        }

        if self.belongs_to_focused_tree(&key) {
            self.needs_present = true;
        }
    }
}

// ---------------------------------------------------------------------
// wl_compositor
// ---------------------------------------------------------------------

impl GlobalDispatch<wl_compositor::WlCompositor, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_compositor::WlCompositor>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<wl_compositor::WlCompositor, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_compositor::WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                let surface = data_init.init(id, ());
                let record = state.surface_record(&surface);
                record.surface = Some(surface);
            }
            wl_compositor::Request::CreateRegion { id } => {
                data_init.init(id, ());
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------
// wl_surface
// ---------------------------------------------------------------------

impl Dispatch<wl_surface::WlSurface, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_surface::WlSurface,
        request: wl_surface::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_surface::Request::Attach { buffer, .. } => {
                let record = state.surface_record(resource);
                record.pending_buffer = Some(buffer);
            }
            wl_surface::Request::Frame { callback } => {
                let callback = data_init.init(callback, ());
                state.surface_record(resource).frame_callbacks.push(callback);
            }
            wl_surface::Request::Commit => {
                state.commit_surface(resource);
            }
            wl_surface::Request::Destroy => {
                // Registry cleanup happens in `destroyed`.
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        resource: &wl_surface::WlSurface,
        _data: &(),
    ) {
        let key = resource.id();
        let removed_role = state
            .surfaces
            .remove(&key)
            .map(|record| record.role)
            .unwrap_or_default();

        if let SurfaceRole::Toplevel(id) = removed_role {
            debug!("Surface of toplevel {id} destroyed");
            state.remove_toplevel(id);
        }
        crate::seat::forget_surface(state, &key);
    }
}

// ---------------------------------------------------------------------
// wl_region / wl_callback / wl_subcompositor
// ---------------------------------------------------------------------

impl Dispatch<wl_region::WlRegion, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_region::WlRegion,
        request: wl_region::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_region::Request::Add {
                x,
                y,
                width,
                height,
            } => {
                state
                    .regions
                    .entry(resource.id())
                    .or_default()
                    .push((x, y, width, height));
            }
            wl_region::Request::Subtract { .. } => {
                // Constraint regions only need a bounding box; holes in
                // the region are ignored.
            }
            wl_region::Request::Destroy => {}
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        resource: &wl_region::WlRegion,
        _data: &(),
    ) {
        state.regions.remove(&resource.id());
    }
}

impl Dispatch<wl_callback::WlCallback, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_callback::WlCallback,
        _request: wl_callback::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

impl GlobalDispatch<wl_subcompositor::WlSubcompositor, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_subcompositor::WlSubcompositor>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<wl_subcompositor::WlSubcompositor, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_subcompositor::WlSubcompositor,
        request: wl_subcompositor::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_subcompositor::Request::GetSubsurface { id, surface, .. } = request {
            data_init.init(id, ());
            state.surface_record(&surface).role = SurfaceRole::Subsurface;
        }
    }
}

impl Dispatch<wl_subsurface::WlSubsurface, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_subsurface::WlSubsurface,
        _request: wl_subsurface::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

// ---------------------------------------------------------------------
// wl_output
// ---------------------------------------------------------------------

impl GlobalDispatch<wl_output::WlOutput, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_output::WlOutput>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let output = data_init.init(resource, ());
        output.geometry(
            0,
            0,
            527,
            296,
            wl_output::Subpixel::Unknown,
            "goggles".into(),
            "embedded".into(),
            wl_output::Transform::Normal,
        );
        output.mode(
            wl_output::Mode::Current | wl_output::Mode::Preferred,
            OUTPUT_WIDTH,
            OUTPUT_HEIGHT,
            60_000,
        );
        if output.version() >= 2 {
            output.scale(1);
            output.done();
        }
    }
}

impl Dispatch<wl_output::WlOutput, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_output::WlOutput,
        _request: wl_output::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

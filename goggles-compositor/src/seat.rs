//! Seat: keyboard and pointer forwarding into guest surfaces, pointer
//! constraints, and the focus model.
//!
//! The one rule that must never be simplified away: legacy (X11) surfaces
//! require re-activation and re-entry before every single event. Native
//! clients keep focus state and only need enter on change.

use std::os::fd::AsFd;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;
use std::time::Instant;

use tracing::{debug, warn};
use wayland_protocols::wp::pointer_constraints::zv1::server::{
    zwp_confined_pointer_v1, zwp_locked_pointer_v1, zwp_pointer_constraints_v1,
};
use wayland_protocols::wp::relative_pointer::zv1::server::{
    zwp_relative_pointer_manager_v1, zwp_relative_pointer_v1,
};
use wayland_server::backend::{ClientId, ObjectId};
use wayland_server::protocol::{wl_keyboard, wl_pointer, wl_seat, wl_surface, wl_touch};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use crate::state::ServerState;
use crate::{InputEvent, SurfaceKind};

pub(crate) fn create_globals(dh: &DisplayHandle) {
    dh.create_global::<ServerState, wl_seat::WlSeat, ()>(5, ());
    dh.create_global::<ServerState, zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1, ()>(
        1,
        (),
    );
    dh.create_global::<ServerState, zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, ()>(1, ());
}

/// Milliseconds since compositor start, for input event timestamps.
pub(crate) fn time_msec() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u32
}

#[derive(Default)]
pub(crate) struct SeatState {
    pub keyboards: Vec<wl_keyboard::WlKeyboard>,
    pub pointers: Vec<wl_pointer::WlPointer>,
    pub relative_pointers: Vec<zwp_relative_pointer_v1::ZwpRelativePointerV1>,
    /// Hosted toplevel id input is aimed at.
    pub focused: Option<u32>,
    keyboard_entered: Option<ObjectId>,
    pointer_entered: Option<ObjectId>,
}

impl SeatState {
    pub fn forget_surface(&mut self, key: &ObjectId) {
        if self.keyboard_entered.as_ref() == Some(key) {
            self.keyboard_entered = None;
        }
        if self.pointer_entered.as_ref() == Some(key) {
            self.pointer_entered = None;
        }
    }
}

#[derive(Default)]
pub(crate) struct CursorState {
    pub x: f64,
    pub y: f64,
    pub initialized: bool,
    /// Root surface the cursor coordinates are relative to.
    pub surface: Option<ObjectId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConstraintKind {
    Locked,
    Confined,
}

#[derive(Default)]
pub(crate) struct ConstraintState {
    pub kind: Option<ConstraintKind>,
    pub surface: Option<ObjectId>,
    /// Bounding box of the constraint region, surface-local.
    pub region: Option<(f64, f64, f64, f64)>,
    pub cursor_hint: Option<(f64, f64)>,
}

/// Per-resource data of a lock/confine object.
pub(crate) struct ConstraintData {
    surface_key: ObjectId,
    kind: ConstraintKind,
}

/// Applies a host focus request on the event-loop thread.
pub(crate) fn focus_surface_by_id(state: &mut ServerState, id: u32) {
    let Some(record) = state.toplevels.get(&id) else {
        warn!("Focus request for unknown surface id {id}");
        return;
    };
    let kind = record.kind;
    let surface_key = record.surface_key.clone();
    let x11_window = record.x11_window;
    let xdg_toplevel = record.xdg_toplevel.clone();
    let xdg_surface = record.xdg_surface.clone();
    let (width, height) = (record.width, record.height);

    state.seat.focused = Some(id);
    debug!("Input target: surface {id} ({kind:?})");

    match kind {
        SurfaceKind::Native => {
            if let (Some(toplevel), Some(xdg_surface)) = (xdg_toplevel, xdg_surface) {
                // Activated state (value 4) in the configure state array.
                let states: Vec<u8> = 4u32.to_ne_bytes().to_vec();
                toplevel.configure(0, 0, states);
                let serial = state.next_serial();
                xdg_surface.configure(serial);
            }
            if let Some(surface) = surface_key.as_ref().and_then(|k| surface_resource(state, k)) {
                keyboard_enter(state, &surface);
            }
        }
        SurfaceKind::Legacy => {
            if let (Some(window), Some(xwm)) = (x11_window, state.xwm.as_mut()) {
                xwm.activate(window);
            }
            if let Some(surface) = surface_key.as_ref().and_then(|k| surface_resource(state, k)) {
                keyboard_enter(state, &surface);
                pointer_enter(state, &surface, f64::from(width) / 2.0, f64::from(height) / 2.0);
            }
        }
    }

    if let Some(key) = surface_key {
        reset_cursor_for_surface(state, &key);
    }
    state.needs_present = true;
}

fn surface_resource(state: &ServerState, key: &ObjectId) -> Option<wl_surface::WlSurface> {
    state.surfaces.get(key).and_then(|r| r.surface.clone())
}

fn same_client(a: &impl Resource, surface: &wl_surface::WlSurface) -> bool {
    match (a.client(), surface.client()) {
        (Some(ca), Some(cb)) => ca.id() == cb.id(),
        _ => false,
    }
}

fn keyboard_enter(state: &mut ServerState, surface: &wl_surface::WlSurface) {
    let serial = state.next_serial();
    for kb in &state.seat.keyboards {
        if same_client(kb, surface) {
            kb.enter(serial, surface, Vec::new());
            kb.modifiers(serial, 0, 0, 0, 0);
        }
    }
    state.seat.keyboard_entered = Some(surface.id());
}

fn pointer_enter(state: &mut ServerState, surface: &wl_surface::WlSurface, x: f64, y: f64) {
    let serial = state.next_serial();
    for pointer in &state.seat.pointers {
        if same_client(pointer, surface) {
            pointer.enter(serial, surface, x, y);
        }
    }
    state.seat.pointer_entered = Some(surface.id());
}

/// Centers the cursor when it moves to a different root surface.
fn reset_cursor_for_surface(state: &mut ServerState, key: &ObjectId) {
    if state.cursor.surface.as_ref() == Some(key) && state.cursor.initialized {
        return;
    }
    let extent = surface_extent(state, key);
    let (w, h) = extent.unwrap_or((crate::state::OUTPUT_WIDTH as u32, crate::state::OUTPUT_HEIGHT as u32));
    state.cursor.x = f64::from(w) / 2.0;
    state.cursor.y = f64::from(h) / 2.0;
    state.cursor.surface = Some(key.clone());
    state.cursor.initialized = true;
}

/// Pixel extent of a surface's current buffer.
pub(crate) fn surface_extent(state: &ServerState, key: &ObjectId) -> Option<(u32, u32)> {
    let record = state.surfaces.get(key)?;
    let buffer = record.current_buffer.as_ref()?;
    crate::buffer::buffer_backing(buffer).map(|data| data.backing.size())
}

/// Drains the host input queue; called after focus/resize requests so
/// events land on the surface they were aimed at. Order is preserved.
pub(crate) fn drain_input(state: &mut ServerState) {
    while let Some(event) = state.input_rx.try_pop() {
        let time = time_msec();
        match event {
            InputEvent::Key { code, pressed } => handle_key(state, code, pressed, time),
            InputEvent::PointerMotion { dx, dy } => handle_motion(state, dx, dy, time),
            InputEvent::PointerButton { code, pressed } => {
                handle_button(state, code, pressed, time)
            }
            InputEvent::PointerAxis { value, horizontal } => {
                handle_axis(state, value, horizontal, time)
            }
        }
    }
}

/// Focused root surface plus its protocol kind and X11 window.
fn input_target(state: &ServerState) -> Option<(wl_surface::WlSurface, SurfaceKind, Option<u32>)> {
    let record = state.focused_toplevel()?;
    let surface = record
        .surface_key
        .as_ref()
        .and_then(|k| surface_resource(state, k))?;
    Some((surface, record.kind, record.x11_window))
}

/// Re-activation before every event is the legacy protocol contract;
/// without it X11 clients silently drop input after the first event.
fn reactivate_if_legacy(state: &mut ServerState, kind: SurfaceKind, x11_window: Option<u32>) {
    if kind == SurfaceKind::Legacy {
        if let (Some(window), Some(xwm)) = (x11_window, state.xwm.as_mut()) {
            xwm.activate(window);
        }
    }
}

fn handle_key(state: &mut ServerState, code: u32, pressed: bool, time: u32) {
    let Some((surface, kind, x11_window)) = input_target(state) else {
        return;
    };

    reactivate_if_legacy(state, kind, x11_window);
    let need_enter =
        kind == SurfaceKind::Legacy || state.seat.keyboard_entered != Some(surface.id());
    if need_enter {
        keyboard_enter(state, &surface);
    }

    let serial = state.next_serial();
    let key_state = if pressed {
        wl_keyboard::KeyState::Pressed
    } else {
        wl_keyboard::KeyState::Released
    };
    for kb in &state.seat.keyboards {
        if same_client(kb, &surface) {
            kb.key(serial, time, code, key_state);
        }
    }
}

fn handle_motion(state: &mut ServerState, dx: f64, dy: f64, time: u32) {
    let Some((surface, kind, x11_window)) = input_target(state) else {
        return;
    };

    // Relative motion reaches the relative-pointer manager regardless of
    // any constraint.
    if dx != 0.0 || dy != 0.0 {
        let utime = u64::from(time) * 1000;
        for rp in &state.seat.relative_pointers {
            if same_client(rp, &surface) {
                rp.relative_motion(
                    (utime >> 32) as u32,
                    (utime & 0xffff_ffff) as u32,
                    dx,
                    dy,
                    dx,
                    dy,
                );
            }
        }
    }

    // A locked pointer pins the absolute position; only the hint moves it.
    if state.constraint.kind == Some(ConstraintKind::Locked) {
        apply_cursor_hint(state);
        pointer_frame(state, &surface);
        return;
    }

    update_cursor_position(state, &surface, dx, dy);

    reactivate_if_legacy(state, kind, x11_window);
    let (local_x, local_y) = (state.cursor.x, state.cursor.y);
    let need_enter =
        kind == SurfaceKind::Legacy || state.seat.pointer_entered != Some(surface.id());
    if need_enter {
        pointer_enter(state, &surface, local_x, local_y);
    }

    for pointer in &state.seat.pointers {
        if same_client(pointer, &surface) {
            pointer.motion(time, local_x, local_y);
        }
    }
    pointer_frame(state, &surface);
}

fn handle_button(state: &mut ServerState, code: u32, pressed: bool, time: u32) {
    let Some((surface, kind, x11_window)) = input_target(state) else {
        return;
    };

    reactivate_if_legacy(state, kind, x11_window);
    let (local_x, local_y) = (state.cursor.x, state.cursor.y);
    if state.seat.pointer_entered != Some(surface.id()) {
        pointer_enter(state, &surface, local_x, local_y);
    }

    let serial = state.next_serial();
    let button_state = if pressed {
        wl_pointer::ButtonState::Pressed
    } else {
        wl_pointer::ButtonState::Released
    };
    for pointer in &state.seat.pointers {
        if same_client(pointer, &surface) {
            pointer.button(serial, time, code, button_state);
        }
    }
    pointer_frame(state, &surface);
}

fn handle_axis(state: &mut ServerState, value: f64, horizontal: bool, time: u32) {
    let Some((surface, kind, x11_window)) = input_target(state) else {
        return;
    };

    reactivate_if_legacy(state, kind, x11_window);
    let (local_x, local_y) = (state.cursor.x, state.cursor.y);
    let need_enter =
        kind == SurfaceKind::Legacy || state.seat.pointer_entered != Some(surface.id());
    if need_enter {
        pointer_enter(state, &surface, local_x, local_y);
    }

    let axis = if horizontal {
        wl_pointer::Axis::HorizontalScroll
    } else {
        wl_pointer::Axis::VerticalScroll
    };
    for pointer in &state.seat.pointers {
        if same_client(pointer, &surface) {
            pointer.axis(time, axis, value);
        }
    }
    pointer_frame(state, &surface);
}

fn pointer_frame(state: &ServerState, surface: &wl_surface::WlSurface) {
    for pointer in &state.seat.pointers {
        if same_client(pointer, surface) && pointer.version() >= 5 {
            pointer.frame();
        }
    }
}

fn update_cursor_position(
    state: &mut ServerState,
    surface: &wl_surface::WlSurface,
    dx: f64,
    dy: f64,
) {
    let key = surface.id();
    reset_cursor_for_surface(state, &key);

    let previous = (state.cursor.x, state.cursor.y);
    let mut next_x = state.cursor.x + dx;
    let mut next_y = state.cursor.y + dy;

    if let Some((w, h)) = surface_extent(state, &key) {
        if w > 0 && h > 0 {
            next_x = next_x.clamp(0.0, f64::from(w) - 1.0);
            next_y = next_y.clamp(0.0, f64::from(h) - 1.0);
        }
    }

    if state.constraint.kind == Some(ConstraintKind::Confined) {
        if let Some((rx, ry, rw, rh)) = state.constraint.region {
            if rw > 0.0 && rh > 0.0 {
                next_x = next_x.clamp(rx, rx + rw - 1.0);
                next_y = next_y.clamp(ry, ry + rh - 1.0);
            }
        }
    }

    state.cursor.x = next_x;
    state.cursor.y = next_y;

    let cursor_shown = state.cursor_visible.load(Ordering::Acquire)
        && state.constraint.kind != Some(ConstraintKind::Locked);
    if cursor_shown && previous != (next_x, next_y) {
        state.needs_present = true;
    }
}

fn apply_cursor_hint(state: &mut ServerState) {
    let Some((hint_x, hint_y)) = state.constraint.cursor_hint.take() else {
        return;
    };
    let previous = (state.cursor.x, state.cursor.y);
    state.cursor.x = hint_x;
    state.cursor.y = hint_y;
    state.cursor.initialized = true;

    if let Some(key) = state.constraint.surface.clone() {
        if let Some((w, h)) = surface_extent(state, &key) {
            if w > 0 && h > 0 {
                state.cursor.x = state.cursor.x.clamp(0.0, f64::from(w) - 1.0);
                state.cursor.y = state.cursor.y.clamp(0.0, f64::from(h) - 1.0);
            }
        }
    }

    if previous != (state.cursor.x, state.cursor.y)
        && state.cursor_visible.load(Ordering::Acquire)
    {
        state.needs_present = true;
    }
}

fn deactivate_constraint(state: &mut ServerState) {
    state.constraint.kind = None;
    state.constraint.surface = None;
    state.constraint.region = None;
    state.constraint.cursor_hint = None;
    state.pointer_locked.store(false, Ordering::Release);
}

/// Bounding box of all rects added to a wl_region.
fn region_bbox(state: &ServerState, region: &ObjectId) -> Option<(f64, f64, f64, f64)> {
    let rects = state.regions.get(region)?;
    let mut iter = rects.iter();
    let first = iter.next()?;
    let mut min_x = first.0;
    let mut min_y = first.1;
    let mut max_x = first.0 + first.2;
    let mut max_y = first.1 + first.3;
    for r in iter {
        min_x = min_x.min(r.0);
        min_y = min_y.min(r.1);
        max_x = max_x.max(r.0 + r.2);
        max_y = max_y.max(r.1 + r.3);
    }
    Some((
        f64::from(min_x),
        f64::from(min_y),
        f64::from(max_x - min_x),
        f64::from(max_y - min_y),
    ))
}

// ---------------------------------------------------------------------
// wl_seat
// ---------------------------------------------------------------------

impl GlobalDispatch<wl_seat::WlSeat, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_seat::WlSeat>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let seat = data_init.init(resource, ());
        seat.capabilities(wl_seat::Capability::Keyboard | wl_seat::Capability::Pointer);
        if seat.version() >= 2 {
            seat.name("seat0".into());
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_seat::WlSeat,
        request: wl_seat::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_seat::Request::GetKeyboard { id } => {
                let keyboard = data_init.init(id, ());
                match crate::keymap::keymap_fd() {
                    Ok((fd, size)) => {
                        keyboard.keymap(wl_keyboard::KeymapFormat::XkbV1, fd.as_fd(), size);
                    }
                    Err(e) => warn!("Failed to serve keymap: {e}"),
                }
                if keyboard.version() >= 4 {
                    keyboard.repeat_info(25, 600);
                }
                state.seat.keyboards.push(keyboard);
            }
            wl_seat::Request::GetPointer { id } => {
                let pointer = data_init.init(id, ());
                state.seat.pointers.push(pointer);
            }
            wl_seat::Request::GetTouch { id } => {
                data_init.init(id, ());
            }
            wl_seat::Request::Release => {}
            _ => {}
        }
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_keyboard::WlKeyboard,
        _request: wl_keyboard::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        // Only request is release.
        state.seat.keyboards.retain(|kb| kb.id() != resource.id());
    }
}

impl Dispatch<wl_pointer::WlPointer, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_pointer::WlPointer,
        request: wl_pointer::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_pointer::Request::Release = request {
            state.seat.pointers.retain(|p| p.id() != resource.id());
        }
        // SetCursor is ignored: the compositor draws its own overlay.
    }
}

impl Dispatch<wl_touch::WlTouch, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_touch::WlTouch,
        _request: wl_touch::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

// ---------------------------------------------------------------------
// zwp_relative_pointer_manager_v1
// ---------------------------------------------------------------------

impl GlobalDispatch<zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1, ()>
    for ServerState
{
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1,
        request: zwp_relative_pointer_manager_v1::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let zwp_relative_pointer_manager_v1::Request::GetRelativePointer { id, .. } = request {
            let rp = data_init.init(id, ());
            state.seat.relative_pointers.push(rp);
        }
    }
}

impl Dispatch<zwp_relative_pointer_v1::ZwpRelativePointerV1, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &zwp_relative_pointer_v1::ZwpRelativePointerV1,
        _request: zwp_relative_pointer_v1::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        // Only request is destroy.
        state
            .seat
            .relative_pointers
            .retain(|rp| rp.id() != resource.id());
    }
}

// ---------------------------------------------------------------------
// zwp_pointer_constraints_v1
// ---------------------------------------------------------------------

impl GlobalDispatch<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &zwp_pointer_constraints_v1::ZwpPointerConstraintsV1,
        request: zwp_pointer_constraints_v1::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            zwp_pointer_constraints_v1::Request::LockPointer {
                id,
                surface,
                region,
                ..
            } => {
                let surface_key = surface.id();
                let locked = data_init.init(
                    id,
                    ConstraintData {
                        surface_key: surface_key.clone(),
                        kind: ConstraintKind::Locked,
                    },
                );
                activate_constraint(
                    state,
                    ConstraintKind::Locked,
                    surface_key,
                    region.map(|r| r.id()),
                );
                locked.locked();
            }
            zwp_pointer_constraints_v1::Request::ConfinePointer {
                id,
                surface,
                region,
                ..
            } => {
                let surface_key = surface.id();
                let confined = data_init.init(
                    id,
                    ConstraintData {
                        surface_key: surface_key.clone(),
                        kind: ConstraintKind::Confined,
                    },
                );
                activate_constraint(
                    state,
                    ConstraintKind::Confined,
                    surface_key,
                    region.map(|r| r.id()),
                );
                confined.confined();
            }
            zwp_pointer_constraints_v1::Request::Destroy => {}
            _ => {}
        }
    }
}

fn activate_constraint(
    state: &mut ServerState,
    kind: ConstraintKind,
    surface_key: ObjectId,
    region: Option<ObjectId>,
) {
    state.constraint.kind = Some(kind);
    state.constraint.surface = Some(surface_key);
    state.constraint.region = region.as_ref().and_then(|r| region_bbox(state, r));
    state.constraint.cursor_hint = None;
    state
        .pointer_locked
        .store(kind == ConstraintKind::Locked, Ordering::Release);
    debug!("Pointer constraint activated: {kind:?}");
}

impl Dispatch<zwp_locked_pointer_v1::ZwpLockedPointerV1, ConstraintData> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &zwp_locked_pointer_v1::ZwpLockedPointerV1,
        request: zwp_locked_pointer_v1::Request,
        data: &ConstraintData,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            zwp_locked_pointer_v1::Request::SetCursorPositionHint { surface_x, surface_y } => {
                if state.constraint.surface.as_ref() == Some(&data.surface_key) {
                    state.constraint.cursor_hint = Some((surface_x, surface_y));
                }
            }
            zwp_locked_pointer_v1::Request::SetRegion { region } => {
                if state.constraint.surface.as_ref() == Some(&data.surface_key) {
                    state.constraint.region =
                        region.as_ref().and_then(|r| region_bbox(state, &r.id()));
                }
            }
            zwp_locked_pointer_v1::Request::Destroy => {}
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &zwp_locked_pointer_v1::ZwpLockedPointerV1,
        data: &ConstraintData,
    ) {
        if state.constraint.surface.as_ref() == Some(&data.surface_key)
            && data.kind == ConstraintKind::Locked
        {
            deactivate_constraint(state);
        }
    }
}

impl Dispatch<zwp_confined_pointer_v1::ZwpConfinedPointerV1, ConstraintData> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &zwp_confined_pointer_v1::ZwpConfinedPointerV1,
        request: zwp_confined_pointer_v1::Request,
        data: &ConstraintData,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            zwp_confined_pointer_v1::Request::SetRegion { region } => {
                if state.constraint.surface.as_ref() == Some(&data.surface_key) {
                    state.constraint.region =
                        region.as_ref().and_then(|r| region_bbox(state, &r.id()));
                }
            }
            zwp_confined_pointer_v1::Request::Destroy => {}
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &zwp_confined_pointer_v1::ZwpConfinedPointerV1,
        data: &ConstraintData,
    ) {
        if state.constraint.surface.as_ref() == Some(&data.surface_key)
            && data.kind == ConstraintKind::Confined
        {
            deactivate_constraint(state);
        }
    }
}

// Seat role removed when a surface goes away.
pub(crate) fn forget_surface(state: &mut ServerState, key: &ObjectId) {
    state.seat.forget_surface(key);
    if state.constraint.surface.as_ref() == Some(key) {
        deactivate_constraint(state);
    }
    if state.cursor.surface.as_ref() == Some(key) {
        state.cursor.initialized = false;
        state.cursor.surface = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_monotone() {
        let a = time_msec();
        let b = time_msec();
        assert!(b >= a);
    }
}

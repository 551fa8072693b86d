//! xdg-shell: native toplevels and popups.

use tracing::debug;
use wayland_protocols::xdg::shell::server::{
    xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};
use wayland_server::backend::ClientId;
use wayland_server::protocol::wl_surface;
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use crate::state::{ServerState, SurfaceRole, ToplevelRecord, OUTPUT_HEIGHT, OUTPUT_WIDTH};
use crate::SurfaceKind;

pub(crate) fn create_globals(dh: &DisplayHandle) {
    dh.create_global::<ServerState, xdg_wm_base::XdgWmBase, ()>(3, ());
}

/// Ties an xdg_surface back to its wl_surface.
pub(crate) struct XdgSurfaceData {
    pub wl_surface: wl_surface::WlSurface,
}

/// Ties an xdg_toplevel / xdg_popup to the hosted toplevel id.
pub(crate) struct RoleData {
    pub toplevel_id: u32,
}

impl GlobalDispatch<xdg_wm_base::XdgWmBase, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<xdg_wm_base::XdgWmBase>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        resource: &xdg_wm_base::XdgWmBase,
        request: xdg_wm_base::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                data_init.init(id, XdgSurfaceData { wl_surface: surface });
            }
            xdg_wm_base::Request::CreatePositioner { id } => {
                data_init.init(id, ());
            }
            xdg_wm_base::Request::Pong { .. } => {}
            xdg_wm_base::Request::Destroy => {}
            _ => {}
        }
    }
}

impl Dispatch<xdg_positioner::XdgPositioner, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &xdg_positioner::XdgPositioner,
        _request: xdg_positioner::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

impl Dispatch<xdg_surface::XdgSurface, XdgSurfaceData> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &xdg_surface::XdgSurface,
        request: xdg_surface::Request,
        data: &XdgSurfaceData,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                let toplevel_id = state.alloc_toplevel_id();
                let toplevel = data_init.init(id, RoleData { toplevel_id });

                let surface_key = data.wl_surface.id();
                state.surface_record(&data.wl_surface).role =
                    SurfaceRole::Toplevel(toplevel_id);

                state.toplevels.insert(
                    toplevel_id,
                    ToplevelRecord {
                        id: toplevel_id,
                        kind: SurfaceKind::Native,
                        surface_key: Some(surface_key),
                        xdg_toplevel: Some(toplevel.clone()),
                        xdg_surface: Some(resource.clone()),
                        x11_window: None,
                        title: String::new(),
                        class: String::new(),
                        mapped: false,
                        override_redirect: false,
                        x: 0,
                        y: 0,
                        width: OUTPUT_WIDTH as u32,
                        height: OUTPUT_HEIGHT as u32,
                    },
                );
                debug!("New xdg toplevel {toplevel_id}");

                // The initial configure drives the first commit+map.
                toplevel.configure(0, 0, Vec::new());
                let serial = state.next_serial();
                resource.configure(serial);
                state.publish_surfaces();
            }
            xdg_surface::Request::GetPopup { id, parent, .. } => {
                // Popups belong to the toplevel of their parent surface.
                let root = parent
                    .as_ref()
                    .and_then(|p| p.data::<XdgSurfaceData>())
                    .map(|d| d.wl_surface.id())
                    .and_then(|key| {
                        state.surfaces.get(&key).and_then(|record| match record.role {
                            SurfaceRole::Toplevel(id) => Some(id),
                            SurfaceRole::Popup(id) => Some(id),
                            _ => None,
                        })
                    })
                    .unwrap_or(0);

                let popup = data_init.init(id, RoleData { toplevel_id: root });
                state.surface_record(&data.wl_surface).role = SurfaceRole::Popup(root);

                popup.configure(0, 0, 0, 0);
                let serial = state.next_serial();
                resource.configure(serial);
            }
            xdg_surface::Request::AckConfigure { .. } => {}
            xdg_surface::Request::SetWindowGeometry { .. } => {}
            xdg_surface::Request::Destroy => {}
            _ => {}
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, RoleData> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_toplevel::XdgToplevel,
        request: xdg_toplevel::Request,
        data: &RoleData,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_toplevel::Request::SetTitle { title } => {
                if let Some(record) = state.toplevels.get_mut(&data.toplevel_id) {
                    record.title = title;
                    state.publish_surfaces();
                }
            }
            xdg_toplevel::Request::SetAppId { app_id } => {
                if let Some(record) = state.toplevels.get_mut(&data.toplevel_id) {
                    record.class = app_id;
                    state.publish_surfaces();
                }
            }
            xdg_toplevel::Request::Destroy => {}
            // Interactive move/resize/minimize have nowhere to go on a
            // headless output.
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &xdg_toplevel::XdgToplevel,
        data: &RoleData,
    ) {
        debug!("xdg toplevel {} destroyed", data.toplevel_id);
        state.remove_toplevel(data.toplevel_id);
    }
}

impl Dispatch<xdg_popup::XdgPopup, RoleData> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &xdg_popup::XdgPopup,
        _request: xdg_popup::Request,
        _data: &RoleData,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &xdg_popup::XdgPopup,
        _data: &RoleData,
    ) {
        state.needs_present = true;
    }
}

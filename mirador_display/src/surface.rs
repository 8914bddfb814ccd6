//! Surface registry and the at-most-one primary designation.

use std::collections::HashMap;

use mirador_canvas::{Canvas, PixelBuffer};
use mirador_protocol::messages::SurfaceFormat;

/// Snapshot of the primary surface the host uses to wire up its widget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrimaryInfo {
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub shmid: i32,
    pub marked: bool,
}

/// One pixel canvas owned by the channel. Dropping the surface releases the
/// backing (heap or shared memory) and the canvas with its decoder handles.
pub(crate) struct Surface {
    pub id: u32,
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub primary: bool,
    pub buffer: PixelBuffer,
    pub canvas: Box<dyn Canvas>,
}

/// The primary lives outside the keyed map so the common lookup never
/// touches the hash table.
#[derive(Default)]
pub(crate) struct SurfaceRegistry {
    primary: Option<Surface>,
    surfaces: HashMap<u32, Surface>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, id: u32) -> Option<&Surface> {
        match &self.primary {
            Some(primary) if primary.id == id => Some(primary),
            _ => self.surfaces.get(&id),
        }
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut Surface> {
        match &mut self.primary {
            Some(primary) if primary.id == id => Some(primary),
            _ => self.surfaces.get_mut(&id),
        }
    }

    pub fn primary(&self) -> Option<&Surface> {
        self.primary.as_ref()
    }

    pub fn primary_mut(&mut self) -> Option<&mut Surface> {
        self.primary.as_mut()
    }

    pub fn primary_id(&self) -> Option<u32> {
        self.primary.as_ref().map(|s| s.id)
    }

    pub fn insert(&mut self, surface: Surface) {
        if surface.primary {
            self.primary = Some(surface);
        } else {
            self.surfaces.insert(surface.id, surface);
        }
    }

    pub fn remove(&mut self, id: u32) -> Option<Surface> {
        if self.primary.as_ref().map(|s| s.id) == Some(id) {
            return self.primary.take();
        }
        self.surfaces.remove(&id)
    }

    /// Bulk destroy; with `keep_primary` the primary survives a reset.
    pub fn clear(&mut self, keep_primary: bool) {
        self.surfaces.clear();
        if !keep_primary {
            self.primary = None;
        }
    }
}

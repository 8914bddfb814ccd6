//! Collaborator seams of the display channel.
//!
//! The channel itself never rasterises, decompresses, or talks to a GPU; it
//! drives the traits in this crate. The host wires in real implementations
//! (a software canvas, codec libraries, a shared-memory provider) and tests
//! wire in recording fakes.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use mirador_protocol::geometry::{Clip, Rect, Region};
use mirador_protocol::messages::{
    AlphaBlendData, CompositeData, CopyData, FillData, OpaqueData, Rop3Data, StrokeData,
    SurfaceFormat, TextData, TransparentData,
};

pub mod codec;

/// A decoded image held by the session pixmap cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pixmap {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: SurfaceFormat,
    pub data: Vec<u8>,
}

/// A color table held by the per-channel palette cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Palette {
    pub unique: u64,
    pub entries: Vec<u32>,
}

/// Borrowed view of a raster the canvas blits from.
///
/// A negative stride means the rows run bottom-to-top; `data` always covers
/// the full `height` rows either way.
#[derive(Clone, Copy, Debug)]
pub struct PixmapRef<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: isize,
}

/// Non-blocking view of the session image cache, for canvas-side lookups.
pub trait ImageStore {
    fn lookup(&self, id: u64) -> Option<Arc<Pixmap>>;
}

/// View of the per-channel palette cache, for canvas-side lookups.
///
/// Returned tables are weak in spirit: an invalidation may remove the entry,
/// so callers use them within a single drawing op and let go.
pub trait PaletteStore {
    fn lookup(&self, id: u64) -> Option<Arc<Palette>>;
}

/// Opaque dictionary window shared by every display channel of a session.
pub trait DictionaryWindow: Send + Sync {}

/// One of the per-surface image decompressors.
pub trait ImageDecoder {
    fn decode(&mut self, src: &[u8], out: &mut Vec<u8>) -> Result<()>;
}

/// The three decoder handles attached to each surface's canvas.
pub struct SurfaceDecoders {
    pub dictionary: Box<dyn ImageDecoder>,
    pub deflate: Box<dyn ImageDecoder>,
    pub jpeg: Box<dyn ImageDecoder>,
}

/// Builds the per-surface decoder handles.
pub trait DecoderFactory {
    fn lossless_dictionary(&self, window: &Arc<dyn DictionaryWindow>) -> Box<dyn ImageDecoder>;
    fn deflate(&self) -> Box<dyn ImageDecoder>;
    fn jpeg(&self) -> Box<dyn ImageDecoder>;
}

/// The 2D rendering collaborator. One canvas per surface.
pub trait Canvas {
    fn draw_fill(&mut self, bbox: &Rect, clip: &Clip, data: &FillData);
    fn draw_opaque(&mut self, bbox: &Rect, clip: &Clip, data: &OpaqueData);
    fn draw_copy(&mut self, bbox: &Rect, clip: &Clip, data: &CopyData);
    fn draw_blend(&mut self, bbox: &Rect, clip: &Clip, data: &CopyData);
    fn draw_blackness(&mut self, bbox: &Rect, clip: &Clip);
    fn draw_whiteness(&mut self, bbox: &Rect, clip: &Clip);
    fn draw_invers(&mut self, bbox: &Rect, clip: &Clip);
    fn draw_rop3(&mut self, bbox: &Rect, clip: &Clip, data: &Rop3Data);
    fn draw_stroke(&mut self, bbox: &Rect, clip: &Clip, data: &StrokeData);
    fn draw_text(&mut self, bbox: &Rect, clip: &Clip, data: &TextData);
    fn draw_transparent(&mut self, bbox: &Rect, clip: &Clip, data: &TransparentData);
    fn draw_alpha_blend(&mut self, bbox: &Rect, clip: &Clip, data: &AlphaBlendData);
    fn draw_composite(&mut self, bbox: &Rect, clip: &Clip, data: &CompositeData);
    fn copy_bits(&mut self, bbox: &Rect, clip: &Clip, src_pos: (i32, i32));
    fn put_image(&mut self, dest: &Rect, src: PixmapRef<'_>, clip: Option<&Region>);
    fn clear(&mut self);
}

/// Everything a canvas needs at construction time.
pub struct CanvasConfig {
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub buffer: PixelBuffer,
    pub images: Arc<dyn ImageStore>,
    pub palettes: Arc<dyn PaletteStore>,
    pub decoders: SurfaceDecoders,
}

pub trait CanvasFactory {
    fn create_canvas(&self, config: CanvasConfig) -> Result<Box<dyn Canvas>>;
}

/// A shared-memory segment backing a primary surface. Dropping the segment
/// releases the mapping and the id.
pub trait ShmSegment: Send {
    fn id(&self) -> i32;
    fn bytes(&mut self) -> &mut [u8];
}

/// Provider of shared-memory segments; `None` means fall back to the heap.
pub trait ShmAllocator {
    fn alloc(&self, size: usize) -> Option<Box<dyn ShmSegment>>;
}

/// Allocator used when the host has no shared-memory transport to the
/// windowing system; every surface lands on the heap.
pub struct NoShm;

impl ShmAllocator for NoShm {
    fn alloc(&self, _size: usize) -> Option<Box<dyn ShmSegment>> {
        None
    }
}

enum Backing {
    Heap(Vec<u8>),
    Shared(Box<dyn ShmSegment>),
}

/// Pixel backing of a surface, shared between the surface (which bounds its
/// lifetime) and the canvas (which writes it).
#[derive(Clone)]
pub struct PixelBuffer {
    inner: Arc<Mutex<Backing>>,
    len: usize,
    shmid: i32,
}

impl PixelBuffer {
    pub fn heap(size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Backing::Heap(vec![0; size]))),
            len: size,
            shmid: -1,
        }
    }

    pub fn shared(segment: Box<dyn ShmSegment>, size: usize) -> Self {
        let shmid = segment.id();
        Self {
            inner: Arc::new(Mutex::new(Backing::Shared(segment))),
            len: size,
            shmid,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shared-memory id, or -1 for heap backing.
    pub fn shmid(&self) -> i32 {
        self.shmid
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut backing = self.inner.lock();
        match &mut *backing {
            Backing::Heap(bytes) => f(bytes),
            Backing::Shared(segment) => f(segment.bytes()),
        }
    }
}

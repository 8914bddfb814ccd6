//! Pixmap and palette caches.
//!
//! The image cache is shared at session scope and serialises internally; the
//! palette cache belongs to one channel. Image readers may suspend until the
//! entry they need arrives on the wire, driving the dispatcher's pump while
//! they wait.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use mirador_canvas::{ImageStore, Palette, PaletteStore, Pixmap};

use crate::session::{MessagePump, PumpStatus};

struct ImageEntry {
    pixmap: Arc<Pixmap>,
    lossy: bool,
}

/// Content-addressed store of decoded pixmaps, keyed by 64-bit image id.
#[derive(Default)]
pub struct ImageCache {
    entries: Mutex<HashMap<u64, ImageEntry>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a lossless pixmap, replacing any lossy copy under the same id.
    pub fn put(&self, id: u64, pixmap: Arc<Pixmap>) {
        self.entries
            .lock()
            .insert(id, ImageEntry { pixmap, lossy: false });
    }

    pub fn put_lossy(&self, id: u64, pixmap: Arc<Pixmap>) {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            log::debug!("lossy put over occupied image slot {id}");
        }
        entries.insert(id, ImageEntry { pixmap, lossy: true });
    }

    pub fn replace_lossy(&self, id: u64, pixmap: Arc<Pixmap>) {
        self.put(id, pixmap);
    }

    /// Non-blocking lookup; the flag reports whether the entry is lossy.
    pub fn find(&self, id: u64) -> Option<(Arc<Pixmap>, bool)> {
        self.entries
            .lock()
            .get(&id)
            .map(|e| (e.pixmap.clone(), e.lossy))
    }

    /// Waits until the id is present, accepting a lossy copy. Returns `None`
    /// when the pump reports cancellation.
    pub fn get(&self, id: u64, pump: &mut dyn MessagePump) -> Option<Arc<Pixmap>> {
        self.wait(id, true, pump)
    }

    /// Waits until a lossless copy of the id is present. A lossy entry does
    /// not satisfy the wait. Returns `None` on cancellation.
    pub fn get_lossless(&self, id: u64, pump: &mut dyn MessagePump) -> Option<Arc<Pixmap>> {
        self.wait(id, false, pump)
    }

    fn wait(&self, id: u64, accept_lossy: bool, pump: &mut dyn MessagePump) -> Option<Arc<Pixmap>> {
        loop {
            if let Some((pixmap, lossy)) = self.find(id) {
                if accept_lossy || !lossy {
                    return Some(pixmap);
                }
            }
            if pump.pump() == PumpStatus::Cancelled {
                log::debug!("image wait for {id} cancelled");
                return None;
            }
        }
    }

    pub fn remove(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ImageStore for ImageCache {
    fn lookup(&self, id: u64) -> Option<Arc<Pixmap>> {
        self.find(id).map(|(pixmap, _)| pixmap)
    }
}

/// Per-channel palette store. Lookups hand out shared references that must
/// not be retained across a dispatcher yield; an invalidation may remove the
/// entry at any message boundary. There is no release operation.
#[derive(Default)]
pub struct PaletteCache {
    entries: Mutex<HashMap<u64, Arc<Palette>>>,
}

impl PaletteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a copy of the supplied table under its unique id.
    pub fn put(&self, palette: &Palette) {
        self.entries
            .lock()
            .insert(palette.unique, Arc::new(palette.clone()));
    }

    pub fn get(&self, id: u64) -> Option<Arc<Palette>> {
        self.entries.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl PaletteStore for PaletteCache {
    fn lookup(&self, id: u64) -> Option<Arc<Palette>> {
        self.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mirador_protocol::messages::SurfaceFormat;

    fn pixmap() -> Arc<Pixmap> {
        Arc::new(Pixmap {
            width: 2,
            height: 2,
            stride: 8,
            format: SurfaceFormat::Rgb32,
            data: vec![0; 16],
        })
    }

    /// Pump that runs a scripted action per call, mimicking the dispatcher
    /// delivering further messages while a reader waits.
    struct ScriptedPump<'a> {
        cache: &'a ImageCache,
        actions: Vec<Box<dyn FnOnce(&ImageCache) + 'a>>,
    }

    impl MessagePump for ScriptedPump<'_> {
        fn pump(&mut self) -> PumpStatus {
            if self.actions.is_empty() {
                return PumpStatus::Cancelled;
            }
            self.actions.remove(0)(self.cache);
            PumpStatus::Pumped
        }

        fn wait_for_channels(&mut self, _waits: &[mirador_protocol::messages::ChannelWait]) -> PumpStatus {
            PumpStatus::Pumped
        }
    }

    #[test]
    fn get_waits_for_put() {
        let cache = ImageCache::new();
        let mut pump = ScriptedPump {
            cache: &cache,
            actions: vec![Box::new(|c: &ImageCache| c.put(7, pixmap()))],
        };
        assert!(cache.get(7, &mut pump).is_some());
    }

    #[test]
    fn cancelled_wait_returns_none() {
        let cache = ImageCache::new();
        let mut pump = ScriptedPump {
            cache: &cache,
            actions: vec![],
        };
        assert!(cache.get(9, &mut pump).is_none());
    }

    #[test]
    fn lossless_wait_skips_lossy_entry() {
        let cache = ImageCache::new();
        cache.put_lossy(5, pixmap());
        let mut pump = ScriptedPump {
            cache: &cache,
            actions: vec![Box::new(|c: &ImageCache| c.replace_lossy(5, pixmap()))],
        };
        // The lossy entry is already present but must not satisfy the wait.
        assert!(cache.get_lossless(5, &mut pump).is_some());
        assert_eq!(cache.find(5).map(|(_, lossy)| lossy), Some(false));
    }

    #[test]
    fn lossy_get_accepts_lossy() {
        let cache = ImageCache::new();
        cache.put_lossy(4, pixmap());
        let mut pump = ScriptedPump {
            cache: &cache,
            actions: vec![],
        };
        assert!(cache.get(4, &mut pump).is_some());
    }

    #[test]
    fn clear_twice_is_clear_once() {
        let cache = ImageCache::new();
        cache.put(1, pixmap());
        cache.clear();
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn palette_put_copies_table() {
        let cache = PaletteCache::new();
        let mut palette = Palette {
            unique: 11,
            entries: vec![1, 2, 3],
        };
        cache.put(&palette);
        palette.entries[0] = 99;
        assert_eq!(cache.get(11).map(|p| p.entries[0]), Some(1));
        assert!(cache.remove(11));
        assert!(cache.get(11).is_none());
    }
}

//! Drawing facade: one routine forwarding tagged op records to the canvas.

use mirador_protocol::messages::{DrawBase, DrawOp, ResourceKind, ResourceRef};

use crate::channel::DisplayChannel;
use crate::events::DisplayEvent;

impl DisplayChannel {
    pub(crate) fn handle_draw(&mut self, base: &DrawBase, op: &DrawOp) {
        let Some(surface) = self.surfaces.find_mut(base.surface_id) else {
            log::warn!("draw {} on unknown surface {}", op.name(), base.surface_id);
            return;
        };

        let canvas = surface.canvas.as_mut();
        match op {
            DrawOp::Fill(data) => canvas.draw_fill(&base.bbox, &base.clip, data),
            DrawOp::Opaque(data) => canvas.draw_opaque(&base.bbox, &base.clip, data),
            DrawOp::Copy(data) => canvas.draw_copy(&base.bbox, &base.clip, data),
            DrawOp::Blend(data) => canvas.draw_blend(&base.bbox, &base.clip, data),
            DrawOp::Blackness => canvas.draw_blackness(&base.bbox, &base.clip),
            DrawOp::Whiteness => canvas.draw_whiteness(&base.bbox, &base.clip),
            DrawOp::Invers => canvas.draw_invers(&base.bbox, &base.clip),
            DrawOp::Rop3(data) => canvas.draw_rop3(&base.bbox, &base.clip, data),
            DrawOp::Stroke(data) => canvas.draw_stroke(&base.bbox, &base.clip, data),
            DrawOp::Text(data) => canvas.draw_text(&base.bbox, &base.clip, data),
            DrawOp::Transparent(data) => canvas.draw_transparent(&base.bbox, &base.clip, data),
            DrawOp::AlphaBlend(data) => canvas.draw_alpha_blend(&base.bbox, &base.clip, data),
            DrawOp::Composite(data) => canvas.draw_composite(&base.bbox, &base.clip, data),
        }

        if surface.primary {
            self.events.push_back(DisplayEvent::Invalidate(base.bbox));
        }
    }

    pub(crate) fn handle_copy_bits(&mut self, base: &DrawBase, src_pos: (i32, i32)) {
        let Some(surface) = self.surfaces.find_mut(base.surface_id) else {
            log::warn!("copy-bits on unknown surface {}", base.surface_id);
            return;
        };
        surface.canvas.copy_bits(&base.bbox, &base.clip, src_pos);
        if surface.primary {
            self.events.push_back(DisplayEvent::Invalidate(base.bbox));
        }
    }

    pub(crate) fn handle_inval_list(&mut self, resources: &[ResourceRef]) {
        for resource in resources {
            match resource.kind {
                ResourceKind::Pixmap => {
                    if !self.images.remove(resource.id) {
                        log::debug!("fail to remove image {}", resource.id);
                    }
                }
                ResourceKind::Other(kind) => {
                    log::warn!("invalidation for unknown resource type {kind}");
                }
            }
        }
    }
}

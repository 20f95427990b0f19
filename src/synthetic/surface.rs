use crate::timeline::{RenderedStill, TimelineResult, VisualSurface};
use std::sync::atomic::{AtomicU8, Ordering};

/// Renders a solid fill whose shade changes on every render
#[derive(Debug)]
pub struct SolidSurface {
    width: u32,
    height: u32,
    shade: AtomicU8,
}

impl SolidSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            shade: AtomicU8::new(0),
        }
    }
}

impl VisualSurface for SolidSurface {
    fn render(&self) -> TimelineResult<RenderedStill> {
        let shade = self.shade.fetch_add(16, Ordering::Relaxed);
        let pixel = [shade, shade, shade, 255];
        let rgba = pixel
            .iter()
            .copied()
            .cycle()
            .take(self.width as usize * self.height as usize * 4)
            .collect();

        Ok(RenderedStill {
            width: self.width,
            height: self.height,
            rgba,
        })
    }
}

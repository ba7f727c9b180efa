use crate::model::Color;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    SourceOver,
    Multiply,
    /// Clears covered pixels instead of painting over them.
    DestinationOut,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Brush {
    pub color: Color,
    pub blend: BlendMode,
    pub opacity: f32,
}

/// Pixels touched by one stroke (or stroke segment).
#[derive(Debug, Clone)]
pub struct CoverageMask {
    width: u32,
    height: u32,
    covered: Vec<bool>,
}

impl CoverageMask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            covered: vec![false; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn mark(&mut self, x: u32, y: u32) {
        if x < self.width && y < self.height {
            self.covered[(y * self.width + x) as usize] = true;
        }
    }

    pub fn is_covered(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.covered[(y * self.width + x) as usize]
    }

    pub fn count(&self) -> usize {
        self.covered.iter().filter(|c| **c).count()
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.covered
            .iter()
            .enumerate()
            .filter_map(|(i, covered)| covered.then_some(i))
    }
}

/// Render target the drawing controller paints into.
pub trait DrawingSurface: Send {
    fn size(&self) -> (u32, u32);

    /// Resets every pixel to transparent.
    fn clear(&mut self);

    fn resize(&mut self, width: u32, height: u32);

    fn composite(&mut self, mask: &CoverageMask, brush: Brush);
}

/// In-memory RGBA8 surface with straight (non-premultiplied) alpha.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RasterSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y * self.width + x) as usize * 4;
        Some([self.pixels[i], self.pixels[i + 1], self.pixels[i + 2], self.pixels[i + 3]])
    }

    /// Number of pixels with non-zero alpha.
    pub fn painted_pixels(&self) -> usize {
        self.pixels.chunks_exact(4).filter(|px| px[3] > 0).count()
    }
}

impl DrawingSurface for RasterSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn clear(&mut self) {
        self.pixels.fill(0);
    }

    fn resize(&mut self, width: u32, height: u32) {
        *self = RasterSurface::new(width, height);
    }

    fn composite(&mut self, mask: &CoverageMask, brush: Brush) {
        if mask.width() != self.width || mask.height() != self.height {
            tracing::warn!(
                mask_width = mask.width(),
                surface_width = self.width,
                "Skipping mask rendered for a different surface size"
            );
            return;
        }
        for index in mask.iter() {
            let px = &mut self.pixels[index * 4..index * 4 + 4];
            blend_pixel(px, brush);
        }
    }
}

fn blend_pixel(px: &mut [u8], brush: Brush) {
    let src = [brush.color.r, brush.color.g, brush.color.b];
    let alpha_s = brush.opacity.clamp(0.0, 1.0);
    let alpha_b = px[3] as f32 / 255.0;

    match brush.blend {
        BlendMode::DestinationOut => {
            let alpha_o = alpha_b * (1.0 - alpha_s);
            if alpha_o <= 0.0 {
                px.fill(0);
            } else {
                px[3] = to_byte(alpha_o);
            }
        }
        BlendMode::SourceOver | BlendMode::Multiply => {
            let alpha_o = alpha_s + alpha_b * (1.0 - alpha_s);
            if alpha_o <= 0.0 {
                return;
            }
            for channel in 0..3 {
                let cs = src[channel] as f32 / 255.0;
                let cb = px[channel] as f32 / 255.0;
                let mixed = match brush.blend {
                    BlendMode::Multiply => (1.0 - alpha_b) * cs + alpha_b * (cb * cs),
                    _ => cs,
                };
                let premultiplied = alpha_s * mixed + (1.0 - alpha_s) * alpha_b * cb;
                px[channel] = to_byte(premultiplied / alpha_o);
            }
            px[3] = to_byte(alpha_o);
        }
    }
}

fn to_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

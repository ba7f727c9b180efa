//! Stroke codec: pointer samples in, stroke records out, and the inverse
//! direction that paints stroke records onto a [`DrawingSurface`].

use super::surface::{BlendMode, Brush, CoverageMask, DrawingSurface};
use crate::model::{Color, ParticipantId, Point, Stroke, StrokeId, Timestamp, Tool};

pub const HIGHLIGHTER_OPACITY: f32 = 0.35;
pub const HIGHLIGHTER_WIDTH_FACTOR: f32 = 3.0;
const MIN_RADIUS_PX: f32 = 0.5;

/// Converts a surface pixel position into a normalized point.
pub fn normalize(x: f32, y: f32, width: u32, height: u32) -> Point {
    let axis = |v: f32, extent: u32| {
        if !v.is_finite() || extent == 0 {
            return 0.0;
        }
        (v / extent as f32).clamp(0.0, 1.0)
    };
    Point::new(axis(x, width), axis(y, height))
}

pub fn brush_for(tool: Tool, color: Color) -> Brush {
    match tool {
        Tool::Pen => Brush {
            color,
            blend: BlendMode::SourceOver,
            opacity: 1.0,
        },
        Tool::Highlighter => Brush {
            color,
            blend: BlendMode::Multiply,
            opacity: HIGHLIGHTER_OPACITY,
        },
        Tool::Eraser => Brush {
            color,
            blend: BlendMode::DestinationOut,
            opacity: 1.0,
        },
    }
}

/// Brush radius in pixels for a stroke on a surface `surface_width` wide.
pub fn radius_px(tool: Tool, width: f32, surface_width: u32) -> f32 {
    let factor = match tool {
        Tool::Highlighter => HIGHLIGHTER_WIDTH_FACTOR,
        Tool::Pen | Tool::Eraser => 1.0,
    };
    (width * factor * surface_width as f32 / 2.0).max(MIN_RADIUS_PX)
}

/// A structurally valid stroke: finite coordinates and a positive width.
pub fn is_well_formed(stroke: &Stroke) -> bool {
    !stroke.points.is_empty()
        && stroke.width.is_finite()
        && stroke.width > 0.0
        && stroke.points.iter().all(|p| p.x.is_finite() && p.y.is_finite())
}

/// Gesture being captured; becomes a [`Stroke`] on [`StrokeEncoder::finish`].
#[derive(Debug, Clone)]
pub struct StrokeEncoder {
    author_id: ParticipantId,
    tool: Tool,
    color: Color,
    width: f32,
    points: Vec<Point>,
}

impl StrokeEncoder {
    pub fn begin(author_id: impl Into<ParticipantId>, tool: Tool, color: Color, width: f32, first: Point) -> Self {
        Self {
            author_id: author_id.into(),
            tool,
            color,
            width,
            points: vec![first],
        }
    }

    /// Appends a sample and returns the segment it adds. Repeated samples at
    /// the same position are dropped.
    pub fn push(&mut self, point: Point) -> Option<(Point, Point)> {
        let last = *self.points.last()?;
        if last == point {
            return None;
        }
        self.points.push(point);
        Some((last, point))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn brush(&self) -> Brush {
        brush_for(self.tool, self.color)
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    /// A single sample is a tap, not a stroke.
    pub fn finish(self, stroke_id: StrokeId, created_at: Timestamp) -> Option<Stroke> {
        if self.points.len() < 2 {
            return None;
        }
        Some(Stroke {
            stroke_id,
            author_id: self.author_id,
            points: self.points,
            tool: self.tool,
            color: self.color,
            width: self.width,
            created_at,
        })
    }
}

/// Marks every pixel whose center lies within `radius` of the polyline.
pub fn rasterize(points: &[Point], radius: f32, width: u32, height: u32) -> CoverageMask {
    let mut mask = CoverageMask::new(width, height);
    let to_px = |p: &Point| (p.x * width as f32, p.y * height as f32);

    match points {
        [] => {}
        [only] => stamp_segment(&mut mask, to_px(only), to_px(only), radius),
        _ => {
            for pair in points.windows(2) {
                stamp_segment(&mut mask, to_px(&pair[0]), to_px(&pair[1]), radius);
            }
        }
    }
    mask
}

fn stamp_segment(mask: &mut CoverageMask, a: (f32, f32), b: (f32, f32), radius: f32) {
    let (width, height) = (mask.width(), mask.height());
    if width == 0 || height == 0 {
        return;
    }
    let min_x = (a.0.min(b.0) - radius).floor().max(0.0) as u32;
    let max_x = ((a.0.max(b.0) + radius).ceil().max(0.0) as u32).min(width - 1);
    let min_y = (a.1.min(b.1) - radius).floor().max(0.0) as u32;
    let max_y = ((a.1.max(b.1) + radius).ceil().max(0.0) as u32).min(height - 1);

    let radius_sq = radius * radius;
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let center = (x as f32 + 0.5, y as f32 + 0.5);
            if distance_sq_to_segment(center, a, b) <= radius_sq {
                mask.mark(x, y);
            }
        }
    }
}

fn distance_sq_to_segment(p: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a.0 + t * dx, a.1 + t * dy);
    (p.0 - cx).powi(2) + (p.1 - cy).powi(2)
}

/// Paints `points` with the given style; used for strokes and live previews.
pub fn paint<S: DrawingSurface + ?Sized>(surface: &mut S, points: &[Point], tool: Tool, color: Color, width: f32) {
    let (surface_width, surface_height) = surface.size();
    let radius = radius_px(tool, width, surface_width);
    let mask = rasterize(points, radius, surface_width, surface_height);
    surface.composite(&mask, brush_for(tool, color));
}

pub fn render<S: DrawingSurface + ?Sized>(surface: &mut S, stroke: &Stroke) {
    paint(surface, &stroke.points, stroke.tool, stroke.color, stroke.width);
}

/// Redraws `strokes` from a blank surface. Callers pass them in replay order.
pub fn replay<'a, S, I>(surface: &mut S, strokes: I)
where
    S: DrawingSurface + ?Sized,
    I: IntoIterator<Item = &'a Stroke>,
{
    surface.clear();
    for stroke in strokes {
        render(surface, stroke);
    }
}

use std::collections::HashSet;

use super::codec::{self, StrokeEncoder};
use super::surface::DrawingSurface;
use crate::model::{Color, ParticipantId, Point, Stroke, StrokeId, Timestamp, Tool};

pub const DEFAULT_WIDTH: f32 = 0.004;

/// Where a stroke landed in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogInsert {
    Duplicate,
    /// Sorted after every stroke already present.
    Appended,
    /// Sorted somewhere before the tail.
    Inserted,
}

/// Append-only stroke log kept in replay order, deduplicated by id.
#[derive(Debug, Default, Clone)]
pub struct StrokeLog {
    strokes: Vec<Stroke>,
    ids: HashSet<StrokeId>,
}

impl StrokeLog {
    pub fn insert(&mut self, stroke: Stroke) -> LogInsert {
        if !self.ids.insert(stroke.stroke_id.clone()) {
            return LogInsert::Duplicate;
        }
        let position = self
            .strokes
            .partition_point(|existing| existing.replay_order(&stroke).is_lt());
        let appended = position == self.strokes.len();
        self.strokes.insert(position, stroke);
        if appended {
            LogInsert::Appended
        } else {
            LogInsert::Inserted
        }
    }

    pub fn contains(&self, stroke_id: &str) -> bool {
        self.ids.contains(stroke_id)
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }
}

/// Owns the replicated stroke log and the local gesture in progress.
pub struct DrawingSurfaceController<S: DrawingSurface> {
    author_id: ParticipantId,
    surface: S,
    log: StrokeLog,
    pending: Option<StrokeEncoder>,
    enabled: bool,
    tool: Tool,
    color: Color,
    width: f32,
}

impl<S: DrawingSurface> DrawingSurfaceController<S> {
    pub fn new(author_id: impl Into<ParticipantId>, surface: S) -> Self {
        Self {
            author_id: author_id.into(),
            surface,
            log: StrokeLog::default(),
            pending: None,
            enabled: false,
            tool: Tool::Pen,
            color: Color::BLACK,
            width: DEFAULT_WIDTH,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn log(&self) -> &StrokeLog {
        &self.log
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn set_tool(&mut self, tool: Tool) {
        self.tool = tool;
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color;
    }

    /// Width as a fraction of the surface width.
    pub fn set_width(&mut self, width: f32) {
        if width.is_finite() && width > 0.0 {
            self.width = width;
        }
    }

    /// Disabling input drops any gesture in progress.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.cancel_stroke();
        }
    }

    fn to_point(&self, x: f32, y: f32) -> Point {
        let (width, height) = self.surface.size();
        codec::normalize(x, y, width, height)
    }

    /// Begins a gesture at a pixel position and paints its first dab.
    pub fn start_stroke(&mut self, x: f32, y: f32) -> bool {
        if !self.enabled {
            return false;
        }
        if self.pending.is_some() {
            self.cancel_stroke();
        }
        let point = self.to_point(x, y);
        let encoder = StrokeEncoder::begin(self.author_id.clone(), self.tool, self.color, self.width, point);
        codec::paint(&mut self.surface, &[point], self.tool, self.color, self.width);
        self.pending = Some(encoder);
        true
    }

    pub fn extend_stroke(&mut self, x: f32, y: f32) -> bool {
        let point = self.to_point(x, y);
        let Some(encoder) = self.pending.as_mut() else {
            return false;
        };
        if let Some((from, to)) = encoder.push(point) {
            let (tool, width) = (encoder.tool(), encoder.width());
            let color = encoder.brush().color;
            codec::paint(&mut self.surface, &[from, to], tool, color, width);
        }
        true
    }

    /// Finalizes the gesture. Taps yield `None` and leave no trace.
    ///
    /// The preview was painted segment by segment, so the surface is replayed
    /// from the log to match what every other replica will render.
    pub fn commit_stroke(&mut self, now: Timestamp) -> Option<Stroke> {
        let encoder = self.pending.take()?;
        let stroke = encoder.finish(uuid::Uuid::new_v4().to_string(), now);
        if let Some(stroke) = &stroke {
            self.log.insert(stroke.clone());
        }
        self.replay();
        stroke
    }

    pub fn cancel_stroke(&mut self) {
        if self.pending.take().is_some() {
            self.replay();
        }
    }

    /// Idempotent merge of a stroke from any replica, own echoes included.
    /// Returns whether the stroke was new.
    pub fn apply_remote_stroke(&mut self, stroke: Stroke) -> bool {
        if self.log.contains(&stroke.stroke_id) {
            return false;
        }
        if !codec::is_well_formed(&stroke) {
            tracing::warn!(
                stroke_id = %stroke.stroke_id,
                author_id = %stroke.author_id,
                "Dropping malformed stroke"
            );
            return false;
        }

        let incremental = self.pending.is_none();
        match self.log.insert(stroke.clone()) {
            LogInsert::Duplicate => false,
            LogInsert::Appended if incremental => {
                codec::render(&mut self.surface, &stroke);
                true
            }
            LogInsert::Appended | LogInsert::Inserted => {
                self.replay();
                true
            }
        }
    }

    /// Redraws the whole log, then the pending preview on top.
    pub fn replay(&mut self) {
        codec::replay(&mut self.surface, self.log.strokes());
        if let Some(pending) = &self.pending {
            let brush = pending.brush();
            codec::paint(
                &mut self.surface,
                pending.points(),
                pending.tool(),
                brush.color,
                pending.width(),
            );
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.surface.resize(width, height);
        self.replay();
    }

    /// Commits an eraser stroke covering the whole surface.
    pub fn clear_surface(&mut self, now: Timestamp) -> Option<Stroke> {
        if !self.enabled {
            return None;
        }
        self.pending = None;
        let stroke = Stroke {
            stroke_id: uuid::Uuid::new_v4().to_string(),
            author_id: self.author_id.clone(),
            points: vec![Point::new(0.5, 0.0), Point::new(0.5, 1.0)],
            tool: Tool::Eraser,
            color: Color::BLACK,
            width: 2.0,
            created_at: now,
        };
        self.log.insert(stroke.clone());
        self.replay();
        Some(stroke)
    }
}

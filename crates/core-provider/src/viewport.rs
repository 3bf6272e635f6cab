//! Pure viewport value.

/// Page box at a concrete scale and rotation. `width`/`height` are CSS
/// pixels already multiplied by `scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
    pub scale: f32,
    pub rotation: u16,
}

/// Overrides for [`Viewport::clone_with`]. Unset fields keep the source
/// value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewportCloneOpts {
    pub scale: Option<f32>,
    pub rotation: Option<u16>,
}

impl Viewport {
    pub fn new(width: f32, height: f32, scale: f32, rotation: u16) -> Self {
        Self {
            width,
            height,
            scale,
            rotation: rotation % 360,
        }
    }

    /// Width/height of the page box at scale 1.
    pub fn base_size(&self) -> (f32, f32) {
        (self.width / self.scale, self.height / self.scale)
    }

    /// Derive a viewport at a different scale and/or rotation. A rotation
    /// change of an odd quarter-turn mirrors the box (width and height
    /// swap).
    pub fn clone_with(&self, opts: ViewportCloneOpts) -> Viewport {
        let scale = opts.scale.unwrap_or(self.scale);
        let rotation = opts.rotation.unwrap_or(self.rotation) % 360;
        let (base_w, base_h) = self.base_size();
        let quarter_turns_delta = ((rotation as i32 - self.rotation as i32) / 90).rem_euclid(4);
        let (w, h) = if quarter_turns_delta % 2 == 1 {
            (base_h * scale, base_w * scale)
        } else {
            (base_w * scale, base_h * scale)
        };
        Viewport {
            width: w,
            height: h,
            scale,
            rotation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_with_rescales_from_base_size() {
        let vp = Viewport::new(612.0, 792.0, 1.0, 0);
        let doubled = vp.clone_with(ViewportCloneOpts {
            scale: Some(2.0),
            ..Default::default()
        });
        assert_eq!(doubled.width, 1224.0);
        assert_eq!(doubled.height, 1584.0);
        assert_eq!(doubled.scale, 2.0);
        assert_eq!(doubled.rotation, 0);
    }

    #[test]
    fn quarter_turn_mirrors_the_box() {
        let vp = Viewport::new(612.0, 792.0, 1.0, 0);
        let turned = vp.clone_with(ViewportCloneOpts {
            rotation: Some(90),
            ..Default::default()
        });
        assert_eq!(turned.width, 792.0);
        assert_eq!(turned.height, 612.0);

        let back = turned.clone_with(ViewportCloneOpts {
            rotation: Some(180),
            ..Default::default()
        });
        assert_eq!(back.width, 612.0);
        assert_eq!(back.height, 792.0);
    }

    #[test]
    fn half_turn_preserves_dimensions() {
        let vp = Viewport::new(300.0, 500.0, 1.5, 0);
        let flipped = vp.clone_with(ViewportCloneOpts {
            rotation: Some(180),
            ..Default::default()
        });
        assert_eq!(flipped.width, 300.0);
        assert_eq!(flipped.height, 500.0);
        assert_eq!(flipped.rotation, 180);
    }
}

/// Multiplier applied per zoom-in step; zooming out divides by it.
pub const ZOOM_STEP: f32 = 1.1;

/// Interactive view parameters. World coordinates are the normalized
/// point positions; `ndc = world * zoom + pan`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewState {
    pub zoom: f32,
    pub pan: [f32; 2],
    pub point_size: f32,
    pub value_range: (f32, f32),
    /// Pointer position (pixels) of the previous drag sample.
    last_pointer: Option<[f32; 2]>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan: [0.0, 0.0],
            point_size: 1.0,
            value_range: (0.0, 32767.0),
            last_pointer: None,
        }
    }
}

impl ViewState {
    /// Column-major 4x4: X/Y scaled by `zoom`, translated by `pan`.
    pub fn transform(&self) -> [f32; 16] {
        let z = self.zoom;
        [
            z, 0.0, 0.0, 0.0, //
            0.0, z, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            self.pan[0], self.pan[1], 0.0, 1.0,
        ]
    }

    pub fn world_to_ndc(&self, p: [f32; 2]) -> [f32; 2] {
        apply_transform(&self.transform(), p)
    }

    pub fn ndc_to_world(&self, ndc: [f32; 2]) -> [f32; 2] {
        [
            (ndc[0] - self.pan[0]) / self.zoom,
            (ndc[1] - self.pan[1]) / self.zoom,
        ]
    }

    pub fn reset(&mut self) {
        self.zoom = 1.0;
        self.pan = [0.0, 0.0];
        self.last_pointer = None;
    }

    /// Zooms by `factor` keeping the world point under `ndc` fixed.
    pub fn zoom_at_ndc(&mut self, ndc: [f32; 2], factor: f32) {
        if !(factor.is_finite() && factor > 0.0) {
            return;
        }
        self.zoom *= factor;
        self.pan[0] = ndc[0] - (ndc[0] - self.pan[0]) * factor;
        self.pan[1] = ndc[1] - (ndc[1] - self.pan[1]) * factor;
    }

    pub fn zoom_at_pixel(&mut self, pixel: [f32; 2], viewport_px: [f32; 2], factor: f32) {
        if let Some(ndc) = pixel_to_ndc(pixel, viewport_px) {
            self.zoom_at_ndc(ndc, factor);
        }
    }

    /// One wheel notch: in for positive `scroll`, out otherwise.
    pub fn wheel(&mut self, pixel: [f32; 2], viewport_px: [f32; 2], scroll: f32) {
        if scroll == 0.0 {
            return;
        }
        let factor = if scroll > 0.0 { ZOOM_STEP } else { 1.0 / ZOOM_STEP };
        self.zoom_at_pixel(pixel, viewport_px, factor);
    }

    pub fn pan_by_pixels(&mut self, delta_px: [f32; 2], viewport_px: [f32; 2]) {
        if viewport_px[0] <= 0.0 || viewport_px[1] <= 0.0 {
            return;
        }
        self.pan[0] += 2.0 * delta_px[0] / viewport_px[0];
        self.pan[1] -= 2.0 * delta_px[1] / viewport_px[1];
    }

    pub fn begin_drag(&mut self, pixel: [f32; 2]) {
        self.last_pointer = Some(pixel);
    }

    /// Pans by the distance moved since the last sample. Does nothing
    /// unless a drag is in progress.
    pub fn drag_to(&mut self, pixel: [f32; 2], viewport_px: [f32; 2]) {
        let Some(last) = self.last_pointer else {
            return;
        };
        self.pan_by_pixels([pixel[0] - last[0], pixel[1] - last[1]], viewport_px);
        self.last_pointer = Some(pixel);
    }

    pub fn end_drag(&mut self) {
        self.last_pointer = None;
    }

    pub fn is_dragging(&self) -> bool {
        self.last_pointer.is_some()
    }
}

/// Pixel (origin top-left, y down) to NDC (y up).
pub fn pixel_to_ndc(pixel: [f32; 2], viewport_px: [f32; 2]) -> Option<[f32; 2]> {
    if viewport_px[0] <= 0.0 || viewport_px[1] <= 0.0 {
        return None;
    }
    Some([
        2.0 * pixel[0] / viewport_px[0] - 1.0,
        1.0 - 2.0 * pixel[1] / viewport_px[1],
    ])
}

/// `m * (x, y, 0, 1)` projected back to x/y, `m` column-major.
pub fn apply_transform(m: &[f32; 16], p: [f32; 2]) -> [f32; 2] {
    [
        m[0] * p[0] + m[4] * p[1] + m[12],
        m[1] * p[0] + m[5] * p[1] + m[13],
    ]
}

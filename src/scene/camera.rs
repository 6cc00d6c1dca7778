//! Camera system

use glam::{Mat4, Vec3, Vec4};

/// Perspective camera driven by an externally supplied view matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    view: Mat4,
    fov_y: f32,
    aspect: f32,
    near: f32,
    far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            view: Mat4::look_at_rh(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y),
            fov_y: std::f32::consts::FRAC_PI_4, // 45 degrees
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    pub fn new(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        let mut camera = Self {
            aspect,
            ..Default::default()
        };
        camera.set_projection(fov_y_degrees, near, far);
        camera
    }

    pub fn set_view_matrix(&mut self, view: Mat4) {
        self.view = view;
    }

    /// Set field of view (degrees) and depth range.
    ///
    /// Depths are clamped so that `0 < near < far`.
    pub fn set_projection(&mut self, fov_y_degrees: f32, near: f32, far: f32) {
        let (clamped_near, clamped_far) = clamp_depth_range(near, far);
        if clamped_near != near || clamped_far != far {
            log::warn!(
                "Camera depth range {}..{} clamped to {}..{}",
                near,
                far,
                clamped_near,
                clamped_far
            );
        }
        self.fov_y = fov_y_degrees.clamp(1.0, 179.0).to_radians();
        self.near = clamped_near;
        self.far = clamped_far;
    }

    pub fn set_aspect(&mut self, width: f32, height: f32) {
        if width > 0.0 && height > 0.0 {
            self.aspect = width / height;
        }
    }

    pub fn fov_y(&self) -> f32 {
        self.fov_y
    }

    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    pub fn near(&self) -> f32 {
        self.near
    }

    pub fn far(&self) -> f32 {
        self.far
    }

    pub fn view_matrix(&self) -> Mat4 {
        self.view
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view
    }

    /// World-space eye position, recovered from the inverse view matrix
    pub fn location(&self) -> Vec3 {
        self.view.inverse().w_axis.truncate()
    }

    /// World-space viewing direction (view-space -Z)
    pub fn direction(&self) -> Vec3 {
        (-self.view.inverse().z_axis.truncate()).normalize_or_zero()
    }

    /// World-space corners of the frustum slice between two view depths.
    ///
    /// The first four corners lie on the `near` plane, the last four on `far`.
    pub fn frustum_corners(&self, near: f32, far: f32) -> [Vec3; 8] {
        let projection = Mat4::perspective_rh(self.fov_y, self.aspect, near, far);
        let inverse = (projection * self.view).inverse();

        let mut corners = [Vec3::ZERO; 8];
        let mut i = 0;
        for z in [0.0, 1.0] {
            for y in [-1.0, 1.0] {
                for x in [-1.0, 1.0] {
                    let p = inverse * Vec4::new(x, y, z, 1.0);
                    corners[i] = p.truncate() / p.w;
                    i += 1;
                }
            }
        }
        corners
    }

    /// Split distances for `count` shadow cascades, see [`cascade_borders`]
    pub fn cascade_borders(&self, count: usize, lambda: f32) -> Vec<f32> {
        cascade_borders(self.near, self.far, count, lambda)
    }
}

/// Smallest near plane distance a camera accepts
const MIN_NEAR: f32 = 1e-4;

/// Clamp a depth range so that `0 < near < far`
fn clamp_depth_range(near: f32, far: f32) -> (f32, f32) {
    let near = near.max(MIN_NEAR);
    (near, far.max(near * 1.001))
}

/// Split `[near, far]` into `count` cascades.
///
/// Each border blends the logarithmic split `near * (far / near)^(i / count)`
/// with the linear split by `lambda` (1.0 is purely logarithmic). The result
/// has `count + 1` strictly increasing entries with the endpoints pinned to
/// `near` and `far`. The range is clamped like [`Camera::set_projection`]
/// does, so a zero or negative `near` still gives finite borders.
pub fn cascade_borders(near: f32, far: f32, count: usize, lambda: f32) -> Vec<f32> {
    let (near, far) = clamp_depth_range(near, far);
    let count = count.max(1);
    let lambda = lambda.clamp(0.0, 1.0);
    let ratio = far / near;

    let mut borders: Vec<f32> = (0..=count)
        .map(|i| {
            let t = i as f32 / count as f32;
            let logarithmic = near * ratio.powf(t);
            let linear = near + (far - near) * t;
            lambda * logarithmic + (1.0 - lambda) * linear
        })
        .collect();

    borders[0] = near;
    borders[count] = far;
    borders
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_and_direction_invert_the_view() {
        let mut camera = Camera::default();
        let eye = Vec3::new(3.0, 4.0, -2.0);
        camera.set_view_matrix(Mat4::look_at_rh(eye, eye + Vec3::X, Vec3::Y));

        assert!(camera.location().abs_diff_eq(eye, 1e-4));
        assert!(camera.direction().abs_diff_eq(Vec3::X, 1e-4));
    }

    #[test]
    fn cascade_borders_are_pinned_and_increasing() {
        for lambda in [0.0, 0.5, 0.75, 1.0] {
            let borders = cascade_borders(0.1, 500.0, 4, lambda);
            assert_eq!(borders.len(), 5);
            assert_eq!(borders[0], 0.1);
            assert_eq!(borders[4], 500.0);
            assert!(borders.windows(2).all(|w| w[0] < w[1]), "{borders:?}");
        }
    }

    #[test]
    fn cascade_borders_survive_a_degenerate_range() {
        for (near, far) in [(0.0, 100.0), (-1.0, 100.0), (0.5, 0.5), (2.0, 1.0)] {
            let borders = cascade_borders(near, far, 4, 1.0);
            assert_eq!(borders.len(), 5);
            assert!(borders.iter().all(|b| b.is_finite() && *b > 0.0), "{:?}", borders);
            assert!(borders.windows(2).all(|w| w[0] < w[1]), "{:?}", borders);
        }
    }

    #[test]
    fn logarithmic_split_favours_the_camera() {
        let log = cascade_borders(1.0, 1000.0, 3, 1.0);
        let linear = cascade_borders(1.0, 1000.0, 3, 0.0);
        assert!((log[1] - 10.0).abs() < 1e-3);
        assert!((log[2] - 100.0).abs() < 1e-2);
        assert!(log[1] < linear[1]);
    }

    #[test]
    fn frustum_corners_sit_on_requested_planes() {
        let camera = Camera::new(60.0, 1.0, 0.5, 100.0);
        let corners = camera.frustum_corners(2.0, 10.0);
        let eye = camera.location();
        let dir = camera.direction();
        for corner in &corners[..4] {
            assert!(((*corner - eye).dot(dir) - 2.0).abs() < 1e-3);
        }
        for corner in &corners[4..] {
            assert!(((*corner - eye).dot(dir) - 10.0).abs() < 1e-2);
        }
    }

    #[test]
    fn degenerate_depth_range_is_clamped() {
        let camera = Camera::new(45.0, 1.0, 0.0, 0.0);
        assert!(camera.near() > 0.0);
        assert!(camera.far() > camera.near());
    }
}

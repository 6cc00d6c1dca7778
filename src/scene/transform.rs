//! Local node transform

use glam::{Mat4, Quat, Vec3};

/// Local transform of a scene node: scale, then orientation, then translation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub orientation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Default::default()
        }
    }

    pub fn with_orientation(mut self, orientation: Quat) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// `T * R * S`
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.orientation, self.translation)
    }

    /// Get forward direction (local -Z in parent space)
    pub fn forward(&self) -> Vec3 {
        self.orientation * -Vec3::Z
    }

    /// Rotate so that local -Z points at `target`
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let forward = (target - self.translation).normalize();
        let right = up.cross(-forward).normalize();
        let up = (-forward).cross(right);

        self.orientation = Quat::from_mat3(&glam::Mat3::from_cols(right, up, -forward));
    }
}

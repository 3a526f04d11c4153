//! Linear-delta coordinate map.
//!
//! Three towers at 120° symmetry carry sliding carriages; rods of length
//! `l` connect each carriage to the effector. The forward transform maps a
//! (bed-level corrected) Cartesian position to the three carriage heights;
//! the inverse intersects three spheres to recover the effector position
//! from carriage heights after homing.
//!
//! All lengths are micrometers.

use crate::error::MotionError;
use crate::matrix::{apply_f64, Matrix3};
use trident_common::config::GeometryConfig;

/// Tower angles: A at 90°, B at 210°, C at 330°.
const TOWER_ANGLES_DEG: [f64; 3] = [90.0, 210.0, 330.0];

#[derive(Debug, Clone)]
pub struct DeltaKinematics {
    /// Rod length [µm].
    l_um: f64,
    /// Rod length squared [µm²].
    l_sq: f64,
    /// Homed carriage height [µm].
    h_um: f64,
    /// Build envelope radius squared [µm²].
    build_radius_sq: f64,
    /// Carriage steps per meter.
    steps_per_m: f64,
    /// Extruder steps per meter.
    steps_per_m_e: f64,
    tower_x: [f64; 3],
    tower_y: [f64; 3],
    bed_level: Matrix3,
    bed_level_inv: [[f64; 3]; 3],
}

impl DeltaKinematics {
    pub fn new(geometry: &GeometryConfig, bed_level: Matrix3) -> Result<Self, MotionError> {
        let r = geometry.r_um as f64;
        let bed_level_inv = bed_level.inverse()?;
        let mut tower_x = [0.0; 3];
        let mut tower_y = [0.0; 3];
        for (i, angle) in TOWER_ANGLES_DEG.iter().enumerate() {
            let rad = angle.to_radians();
            tower_x[i] = r * rad.cos();
            tower_y[i] = r * rad.sin();
        }
        Ok(Self {
            l_um: geometry.l_um as f64,
            l_sq: (geometry.l_um as f64) * (geometry.l_um as f64),
            h_um: geometry.h_um as f64,
            build_radius_sq: (geometry.build_radius_um as f64)
                * (geometry.build_radius_um as f64),
            steps_per_m: geometry.steps_per_m,
            steps_per_m_e: geometry.steps_per_m_e,
            tower_x,
            tower_y,
            bed_level,
            bed_level_inv,
        })
    }

    /// XY position of tower `i`.
    pub fn tower_xy(&self, i: usize) -> (f64, f64) {
        (self.tower_x[i], self.tower_y[i])
    }

    /// Rod length squared [µm²].
    pub fn rod_length_sq(&self) -> f64 {
        self.l_sq
    }

    /// Homed carriage height [µm].
    pub fn home_height_um(&self) -> f64 {
        self.h_um
    }

    /// Carriage steps per meter.
    pub fn steps_per_m(&self) -> f64 {
        self.steps_per_m
    }

    /// Extruder steps per meter.
    pub fn steps_per_m_e(&self) -> f64 {
        self.steps_per_m_e
    }

    /// Bed-level corrected coordinates of a Cartesian position, with the
    /// envelope check applied.
    pub fn corrected(&self, cart: [f64; 3]) -> Result<[f64; 3], MotionError> {
        let c = self.bed_level.apply(cart);
        if c[0] * c[0] + c[1] * c[1] > self.build_radius_sq {
            return Err(MotionError::OutOfEnvelope {
                x_um: cart[0],
                y_um: cart[1],
                z_um: cart[2],
            });
        }
        Ok(c)
    }

    /// Carriage height on tower `i` for a corrected position.
    fn height_on_tower(&self, corrected: [f64; 3], i: usize) -> Result<f64, MotionError> {
        let dx = corrected[0] - self.tower_x[i];
        let dy = corrected[1] - self.tower_y[i];
        let radicand = self.l_sq - dx * dx - dy * dy;
        if radicand < 0.0 {
            return Err(MotionError::OutOfEnvelope {
                x_um: corrected[0],
                y_um: corrected[1],
                z_um: corrected[2],
            });
        }
        Ok(corrected[2] + radicand.sqrt())
    }

    /// All three carriage heights [µm] for a Cartesian position.
    pub fn carriage_heights(&self, cart: [f64; 3]) -> Result<[f64; 3], MotionError> {
        let c = self.corrected(cart)?;
        Ok([
            self.height_on_tower(c, 0)?,
            self.height_on_tower(c, 1)?,
            self.height_on_tower(c, 2)?,
        ])
    }

    /// Carriage step count for a height [µm].
    pub fn steps_for_height(&self, h_um: f64) -> i64 {
        (h_um * 1e-6 * self.steps_per_m).round() as i64
    }

    /// Carriage step counts for a Cartesian position.
    pub fn carriage_steps(&self, cart: [f64; 3]) -> Result<[i64; 3], MotionError> {
        let h = self.carriage_heights(cart)?;
        Ok([
            self.steps_for_height(h[0]),
            self.steps_for_height(h[1]),
            self.steps_for_height(h[2]),
        ])
    }

    /// Extruder step count for a filament position [µm].
    pub fn e_steps(&self, e_um: f64) -> i64 {
        (e_um * 1e-6 * self.steps_per_m_e).round() as i64
    }

    /// Effector position from the three carriage heights: the intersection
    /// of three spheres of radius `l` centered at the rod pivots, taking
    /// the solution below the carriages, then undoing the bed-level
    /// correction.
    pub fn cartesian_from_heights(&self, heights: [f64; 3]) -> Result<[f64; 3], MotionError> {
        let p1 = [self.tower_x[0], self.tower_y[0], heights[0]];
        let p2 = [self.tower_x[1], self.tower_y[1], heights[1]];
        let p3 = [self.tower_x[2], self.tower_y[2], heights[2]];

        let d21 = sub(p2, p1);
        let d = norm(d21);
        if d < 1.0 {
            return Err(MotionError::InvalidGeometry(
                "towers coincide".to_string(),
            ));
        }
        let ex = scale(d21, 1.0 / d);
        let d31 = sub(p3, p1);
        let i = dot(ex, d31);
        let ey_raw = sub(d31, scale(ex, i));
        let ey_norm = norm(ey_raw);
        if ey_norm < 1.0 {
            return Err(MotionError::InvalidGeometry(
                "towers are collinear".to_string(),
            ));
        }
        let ey = scale(ey_raw, 1.0 / ey_norm);
        let ez = cross(ex, ey);
        let j = dot(ey, d31);

        // Equal sphere radii collapse the usual trilateration formulas.
        let x = d / 2.0;
        let y = (i * i + j * j - 2.0 * i * x) / (2.0 * j);
        let z_sq = self.l_sq - x * x - y * y;
        if z_sq < 0.0 {
            return Err(MotionError::OutOfEnvelope {
                x_um: 0.0,
                y_um: 0.0,
                z_um: 0.0,
            });
        }
        let z = z_sq.sqrt();

        // Two mirror solutions; the effector hangs below the carriages.
        let a = add(add(p1, scale(ex, x)), add(scale(ey, y), scale(ez, z)));
        let b = add(add(p1, scale(ex, x)), add(scale(ey, y), scale(ez, -z)));
        let corrected = if a[2] < b[2] { a } else { b };
        Ok(apply_f64(&self.bed_level_inv, corrected))
    }

    /// Effector position with all carriages at the homed height.
    pub fn home_cartesian(&self) -> Result<[f64; 3], MotionError> {
        self.cartesian_from_heights([self.h_um; 3])
    }
}

#[inline]
fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}
#[inline]
fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}
#[inline]
fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}
#[inline]
fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}
#[inline]
fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}
#[inline]
fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

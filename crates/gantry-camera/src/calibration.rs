//! Fisheye calibration model and undistortion remap.
//!
//! A calibration artefact carries the 3×3 intrinsic matrix `K`, four
//! Kannala–Brandt distortion coefficients and the resolution the camera was
//! calibrated at. Two formats are accepted:
//!
//! - `.json`: `camera_matrix`, `distortion_coefficients` (flat or column),
//!   `resolution: { width, height }`, optional `rms_error`
//! - `.npz`: arrays with the same names; `resolution` is `[width, height]`
//!
//! The remap tables are computed once at load time with an identity
//! rectification and the same `K` as the new projection, so the output
//! keeps the input's field of view and size.

use gantry_core::data::CHANNELS;
use gantry_core::{AppResult, Frame, GantryError, Resolution};
use ndarray::{Array2, ArrayD, IxDyn, OwnedRepr};
use ndarray_npy::NpzReader;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use tracing::info;

/// Number of fisheye distortion coefficients.
pub const FISHEYE_COEFFICIENTS: usize = 4;

/// Distortion coefficients as stored: `[k1, k2, k3, k4]` or `[[k1], [k2], ...]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Coefficients {
    Flat(Vec<f64>),
    Column(Vec<Vec<f64>>),
}

impl Coefficients {
    fn flatten(self) -> Vec<f64> {
        match self {
            Coefficients::Flat(v) => v,
            Coefficients::Column(rows) => rows.into_iter().flatten().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonResolution {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct JsonCalibration {
    camera_matrix: Vec<Vec<f64>>,
    distortion_coefficients: Coefficients,
    resolution: JsonResolution,
    #[serde(default)]
    rms_error: Option<f64>,
}

/// Intrinsics, distortion and precomputed remap tables. Immutable once built.
#[derive(Debug, Clone)]
pub struct CalibrationModel {
    camera_matrix: [[f64; 3]; 3],
    distortion: [f64; FISHEYE_COEFFICIENTS],
    resolution: Resolution,
    rms_error: Option<f64>,
    map_x: Array2<f32>,
    map_y: Array2<f32>,
}

impl CalibrationModel {
    /// Load from a `.json` or `.npz` artefact, chosen by extension.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let model = match extension.as_deref() {
            Some("json") => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    GantryError::Configuration(format!(
                        "cannot read calibration {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_json_str(&text)?
            }
            Some("npz") => Self::from_npz(path)?,
            _ => {
                return Err(GantryError::Configuration(format!(
                    "unsupported calibration format: {} (expected .json or .npz)",
                    path.display()
                )))
            }
        };
        info!(
            path = %path.display(),
            resolution = %model.resolution,
            rms_error = ?model.rms_error,
            "Calibration loaded"
        );
        Ok(model)
    }

    /// Parse the JSON artefact format.
    pub fn from_json_str(text: &str) -> AppResult<Self> {
        let raw: JsonCalibration = serde_json::from_str(text)
            .map_err(|e| GantryError::Configuration(format!("invalid calibration JSON: {}", e)))?;
        if raw.camera_matrix.len() != 3 || raw.camera_matrix.iter().any(|row| row.len() != 3) {
            return Err(GantryError::Configuration(format!(
                "camera_matrix must be 3 rows of 3, got rows of {:?}",
                raw.camera_matrix.iter().map(Vec::len).collect::<Vec<_>>()
            )));
        }
        let k = matrix3(raw.camera_matrix.into_iter().flatten().collect())?;
        Self::new(
            k,
            &raw.distortion_coefficients.flatten(),
            Resolution::new(raw.resolution.width, raw.resolution.height),
            raw.rms_error,
        )
    }

    /// Read the packed-array artefact format.
    pub fn from_npz(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            GantryError::Configuration(format!(
                "cannot open calibration {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut npz = NpzReader::new(file).map_err(|e| {
            GantryError::Configuration(format!("invalid npz {}: {}", path.display(), e))
        })?;

        let k = matrix3(npz_array(&mut npz, "camera_matrix")?.iter().copied().collect())?;
        let d: Vec<f64> = npz_array(&mut npz, "distortion_coefficients")?
            .iter()
            .copied()
            .collect();
        let res = npz_array(&mut npz, "resolution")?;
        if res.len() != 2 {
            return Err(GantryError::Configuration(format!(
                "npz resolution must hold [width, height], got {} values",
                res.len()
            )));
        }
        let mut res = res.iter().copied();
        let width = dimension(res.next())?;
        let height = dimension(res.next())?;
        let rms_error = npz_array(&mut npz, "rms_error")
            .ok()
            .and_then(|a| a.iter().next().copied());

        Self::new(k, &d, Resolution::new(width, height), rms_error)
    }

    /// Build from parts and compute the remap tables.
    pub fn new(
        camera_matrix: [[f64; 3]; 3],
        distortion: &[f64],
        resolution: Resolution,
        rms_error: Option<f64>,
    ) -> AppResult<Self> {
        if distortion.len() != FISHEYE_COEFFICIENTS {
            return Err(GantryError::Configuration(format!(
                "fisheye model needs {} distortion coefficients, got {}",
                FISHEYE_COEFFICIENTS,
                distortion.len()
            )));
        }
        if resolution.width == 0 || resolution.height == 0 {
            return Err(GantryError::Configuration(format!(
                "calibration resolution {} is empty",
                resolution
            )));
        }
        if camera_matrix.iter().flatten().any(|v| !v.is_finite())
            || distortion.iter().any(|v| !v.is_finite())
        {
            return Err(GantryError::Configuration(
                "calibration contains non-finite values".into(),
            ));
        }
        let inverse = invert3(&camera_matrix).ok_or_else(|| {
            GantryError::Configuration("camera matrix is singular".into())
        })?;

        let d = [distortion[0], distortion[1], distortion[2], distortion[3]];
        let (map_x, map_y) = build_maps(&camera_matrix, &inverse, &d, resolution);
        Ok(Self {
            camera_matrix,
            distortion: d,
            resolution,
            rms_error,
            map_x,
            map_y,
        })
    }

    pub fn camera_matrix(&self) -> &[[f64; 3]; 3] {
        &self.camera_matrix
    }

    pub fn distortion(&self) -> &[f64; FISHEYE_COEFFICIENTS] {
        &self.distortion
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn rms_error(&self) -> Option<f64> {
        self.rms_error
    }

    /// Source coordinate sampled for output pixel `(x, y)`.
    pub fn source_coordinates(&self, x: u32, y: u32) -> Option<(f32, f32)> {
        let idx = [y as usize, x as usize];
        Some((*self.map_x.get(idx)?, *self.map_y.get(idx)?))
    }

    /// Remap `frame` through the precomputed tables.
    ///
    /// Output has the same size as the input. Samples falling outside the
    /// source are black.
    ///
    /// # Errors
    /// [`GantryError::ResolutionMismatch`] if the frame isn't exactly the
    /// calibration resolution.
    pub fn undistort(&self, frame: &Frame) -> AppResult<Frame> {
        if frame.resolution() != self.resolution {
            return Err(GantryError::resolution_mismatch(
                (self.resolution.width, self.resolution.height),
                (frame.width, frame.height),
            ));
        }
        let mut out = Frame::zeroed(self.resolution);
        let stride = out.stride();
        for ((row, xs), ys) in out
            .data
            .chunks_exact_mut(stride)
            .zip(self.map_x.rows())
            .zip(self.map_y.rows())
        {
            for ((px, &sx), &sy) in row.chunks_exact_mut(CHANNELS).zip(xs).zip(ys) {
                sample_bilinear(frame, sx, sy, px);
            }
        }
        Ok(out)
    }
}

fn matrix3(values: Vec<f64>) -> AppResult<[[f64; 3]; 3]> {
    if values.len() != 9 {
        return Err(GantryError::Configuration(format!(
            "camera_matrix must be 3x3, got {} values",
            values.len()
        )));
    }
    let mut k = [[0.0; 3]; 3];
    for (i, v) in values.into_iter().enumerate() {
        k[i / 3][i % 3] = v;
    }
    Ok(k)
}

fn dimension(value: Option<f64>) -> AppResult<u32> {
    match value {
        Some(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => {
            Ok(v as u32)
        }
        other => Err(GantryError::Configuration(format!(
            "invalid resolution value {:?}",
            other
        ))),
    }
}

/// Read one named array from an npz archive as `f64`, whatever its stored dtype.
fn npz_array(npz: &mut NpzReader<File>, key: &str) -> AppResult<ArrayD<f64>> {
    for name in [key.to_string(), format!("{}.npy", key)] {
        if let Ok(a) = npz.by_name::<OwnedRepr<f64>, IxDyn>(&name) {
            return Ok(a);
        }
        if let Ok(a) = npz.by_name::<OwnedRepr<f32>, IxDyn>(&name) {
            return Ok(a.mapv(f64::from));
        }
        if let Ok(a) = npz.by_name::<OwnedRepr<i64>, IxDyn>(&name) {
            return Ok(a.mapv(|v| v as f64));
        }
        if let Ok(a) = npz.by_name::<OwnedRepr<i32>, IxDyn>(&name) {
            return Ok(a.mapv(f64::from));
        }
    }
    Err(GantryError::Configuration(format!(
        "calibration archive has no readable `{}` array",
        key
    )))
}

fn invert3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < f64::EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ])
}

/// Per output pixel, where to sample the distorted input.
///
/// Output pixels are back-projected through `K⁻¹` onto the normalised plane,
/// pushed through the fisheye model `θd = θ(1 + k1θ² + k2θ⁴ + k3θ⁶ + k4θ⁸)`
/// and projected with `K` again.
fn build_maps(
    k: &[[f64; 3]; 3],
    k_inv: &[[f64; 3]; 3],
    d: &[f64; FISHEYE_COEFFICIENTS],
    resolution: Resolution,
) -> (Array2<f32>, Array2<f32>) {
    let (w, h) = (resolution.width as usize, resolution.height as usize);
    let (fx, fy) = (k[0][0], k[1][1]);
    let (cx, cy) = (k[0][2], k[1][2]);
    let skew = k[0][1] / fx;

    let mut map_x = Array2::<f32>::zeros((h, w));
    let mut map_y = Array2::<f32>::zeros((h, w));

    for v in 0..h {
        for u in 0..w {
            let (uf, vf) = (u as f64, v as f64);
            let hx = k_inv[0][0] * uf + k_inv[0][1] * vf + k_inv[0][2];
            let hy = k_inv[1][0] * uf + k_inv[1][1] * vf + k_inv[1][2];
            let hw = k_inv[2][0] * uf + k_inv[2][1] * vf + k_inv[2][2];
            let (x, y) = (hx / hw, hy / hw);

            let r = (x * x + y * y).sqrt();
            let theta = r.atan();
            let t2 = theta * theta;
            let theta_d = theta * (1.0 + t2 * (d[0] + t2 * (d[1] + t2 * (d[2] + t2 * d[3]))));
            let scale = if r > 1e-8 { theta_d / r } else { 1.0 };
            let (xd, yd) = (x * scale, y * scale);

            map_x[[v, u]] = (fx * (xd + skew * yd) + cx) as f32;
            map_y[[v, u]] = (fy * yd + cy) as f32;
        }
    }
    (map_x, map_y)
}

fn sample_bilinear(src: &Frame, sx: f32, sy: f32, out: &mut [u8]) {
    if !(sx.is_finite() && sy.is_finite()) {
        return;
    }
    let x0 = sx.floor();
    let y0 = sy.floor();
    let ax = sx - x0;
    let ay = sy - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let mut acc = [0.0f32; CHANNELS];
    for (dy, wy) in [(0, 1.0 - ay), (1, ay)] {
        for (dx, wx) in [(0, 1.0 - ax), (1, ax)] {
            let weight = wx * wy;
            if weight == 0.0 {
                continue;
            }
            let (x, y) = (x0 + dx, y0 + dy);
            if x < 0 || y < 0 || x >= src.width as i64 || y >= src.height as i64 {
                continue;
            }
            let offset = y as usize * src.stride() + x as usize * CHANNELS;
            for (c, a) in acc.iter_mut().enumerate() {
                *a += weight * f32::from(src.data[offset + c]);
            }
        }
    }
    for (o, a) in out.iter_mut().zip(acc) {
        *o = a.round().clamp(0.0, 255.0) as u8;
    }
}

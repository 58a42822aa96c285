use nalgebra::Vector3;
use rkyv::{Archive, Deserialize, Serialize};

/// A catalog star used to build quad indices.
///
/// Positions are ICRS RA/Dec at the catalog epoch; the magnitude is a generic
/// brightness used for brightest-first selection.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Star {
    pub id: u64,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub mag: f32,
}

impl Star {
    pub fn new(id: u64, ra_deg: f64, dec_deg: f64, mag: f32) -> Self {
        Self {
            id,
            ra_deg,
            dec_deg,
            mag,
        }
    }

    /// Unit vector pointing to the star's position on the celestial sphere.
    pub fn uvec(&self) -> Vector3<f64> {
        radec_to_uvec(self.ra_deg, self.dec_deg)
    }
}

/// Unit vector for an RA/Dec in degrees.
pub fn radec_to_uvec(ra_deg: f64, dec_deg: f64) -> Vector3<f64> {
    let (rasin, racos) = ra_deg.to_radians().sin_cos();
    let (decsin, deccos) = dec_deg.to_radians().sin_cos();
    Vector3::new(deccos * racos, deccos * rasin, decsin)
}

/// RA/Dec in degrees for a (possibly non-unit) direction. RA is in `[0, 360)`.
pub fn uvec_to_radec(v: &Vector3<f64>) -> (f64, f64) {
    let n = v.norm();
    let dec = (v.z / n).clamp(-1.0, 1.0).asin().to_degrees();
    let ra = v.y.atan2(v.x).to_degrees().rem_euclid(360.0);
    (ra, dec)
}

/// Great-circle separation in degrees.
pub fn angular_separation_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let a = radec_to_uvec(ra1, dec1);
    let b = radec_to_uvec(ra2, dec2);
    // atan2 form stays accurate at small angles
    a.cross(&b).norm().atan2(a.dot(&b)).to_degrees()
}

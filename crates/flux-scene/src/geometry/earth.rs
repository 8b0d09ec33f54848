//! WGS84 经纬高与地心地固坐标（ECEF）互转

use nalgebra::Vector3;

const A: f64 = 6_378_137.0;
const F: f64 = 1.0 / 298.257_223_563;

fn b() -> f64 {
    A * (1.0 - F)
}

fn e2() -> f64 {
    F * (2.0 - F)
}

/// (纬度°, 经度°, 高度 m) → ECEF
pub fn lla_to_ecef(lat: f64, lon: f64, alt: f64) -> Vector3<f64> {
    let (lat, lon) = (lat.to_radians(), lon.to_radians());
    let n = A / (1.0 - e2() * lat.sin().powi(2)).sqrt();
    Vector3::new(
        (n + alt) * lat.cos() * lon.cos(),
        (n + alt) * lat.cos() * lon.sin(),
        (n * (1.0 - e2()) + alt) * lat.sin(),
    )
}

/// ECEF → (纬度°, 经度°, 高度 m)，Heikkinen 闭式解，极轴附近退化为球面
pub fn ecef_to_lla(p: &Vector3<f64>) -> Vector3<f64> {
    let (x, y, z) = (p.x, p.y, p.z);
    let b = b();
    let e2 = e2();
    let ep2 = (A * A - b * b) / (b * b);
    let r = (x * x + y * y).sqrt();

    if r < 1e-9 {
        let lat = if z >= 0.0 { 90.0 } else { -90.0 };
        return Vector3::new(lat, 0.0, z.abs() - b);
    }

    let f = 54.0 * b * b * z * z;
    let g = r * r + (1.0 - e2) * z * z - e2 * (A * A - b * b);
    let c = e2 * e2 * f * r * r / (g * g * g);
    let s = (1.0 + c + (c * c + 2.0 * c).sqrt()).cbrt();
    let k = s + 1.0 + 1.0 / s;
    let pp = f / (3.0 * k * k * g * g);
    let q = (1.0 + 2.0 * e2 * e2 * pp).sqrt();
    let r0 = -(pp * e2 * r) / (1.0 + q)
        + (0.5 * A * A * (1.0 + 1.0 / q) - pp * (1.0 - e2) * z * z / (q * (1.0 + q)) - 0.5 * pp * r * r)
            .max(0.0)
            .sqrt();
    let u = ((r - e2 * r0).powi(2) + z * z).sqrt();
    let v = ((r - e2 * r0).powi(2) + (1.0 - e2) * z * z).sqrt();
    let z0 = b * b * z / (A * v);
    let alt = u * (1.0 - b * b / (A * v));
    let lat = ((z + ep2 * z0) / r).atan().to_degrees();
    let lon = y.atan2(x).to_degrees();
    Vector3::new(lat, lon, alt)
}

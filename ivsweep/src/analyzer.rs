//! Device parameters extracted from a current-voltage curve.

use anyhow::anyhow;

use crate::{Error, RawSample};
use ivsweep_protocol::{Report, ReportValue};

/// Standard test condition illumination in mW/cm^2
pub const ONE_SUN: f64 = 100.0;

pub trait Analyzer: Send + Sync {
    fn fit(&self, samples: &[RawSample]) -> crate::Result<Report>;
}

/// Extracts solar cell figures of merit by interpolating the curve's axis crossings.
///
/// The sign convention is the instrument's: current flowing out of the device under
/// illumination is negative.
pub struct IvAnalyzer {
    /// Device area in cm^2
    pub area: f64,
    pub irradiance: f64,
}

impl IvAnalyzer {
    pub fn new(area: f64) -> Self {
        Self {
            area,
            irradiance: ONE_SUN,
        }
    }
}

/// `y` at `x == 0` on the segment between `a` and `b`
fn interpolate_zero(a: (f64, f64), b: (f64, f64)) -> f64 {
    if a.0 == b.0 {
        return (a.1 + b.1) / 2.0;
    }
    a.1 - a.0 * (b.1 - a.1) / (b.0 - a.0)
}

fn crossing<F>(points: &[(f64, f64)], f: F) -> Option<f64>
where
    F: Fn((f64, f64)) -> (f64, f64),
{
    points.windows(2).find_map(|w| {
        let (a, b) = (f(w[0]), f(w[1]));
        if a.0 == 0.0 {
            Some(a.1)
        } else if a.0.signum() != b.0.signum() {
            Some(interpolate_zero(a, b))
        } else {
            None
        }
    })
}

impl Analyzer for IvAnalyzer {
    fn fit(&self, samples: &[RawSample]) -> crate::Result<Report> {
        if samples.len() < 3 {
            return Err(Error::argument(anyhow!("Need at least 3 points to analyze a curve")));
        }
        if !(self.area > 0.0) {
            return Err(Error::argument(anyhow!("Device area must be positive")));
        }
        // (voltage, generated current)
        let mut points: Vec<(f64, f64)> = samples
            .iter()
            .filter(|x| x.primary.is_finite() && x.secondary.is_finite())
            .map(|x| (x.primary, -x.secondary))
            .collect();
        points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let isc = crossing(&points, |p| p).ok_or_else(|| Error::internal(anyhow!("Curve does not cross V = 0")))?;
        let voc = crossing(&points, |(v, i)| (i, v))
            .ok_or_else(|| Error::internal(anyhow!("Curve does not cross I = 0")))?;
        let (vmp, imp) = points
            .iter()
            .filter(|(v, i)| *v >= 0.0 && *i >= 0.0)
            .max_by(|a, b| {
                (a.0 * a.1)
                    .partial_cmp(&(b.0 * b.1))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .ok_or_else(|| Error::internal(anyhow!("Curve has no power producing points")))?;
        let pmax = vmp * imp;
        if !(isc > 0.0 && voc > 0.0 && pmax > 0.0) {
            return Err(Error::internal(anyhow!("Device does not generate power")));
        }

        let mut ret = Report::new();
        let mut put = |k: &str, v: f64| {
            ret.insert(k.to_string(), ReportValue::Number(v));
        };
        put("isc[A]", isc);
        put("jsc[mA/cm^2]", isc * 1000.0 / self.area);
        put("voc[V]", voc);
        put("pmax[mW]", pmax * 1000.0);
        put("vmax[V]", vmp);
        put("imax[A]", imp);
        put("ff", pmax / (isc * voc));
        put("pce[%]", pmax * 1000.0 / (self.area * self.irradiance) * 100.0);
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(points: &[(f64, f64)]) -> Vec<RawSample> {
        points
            .iter()
            .enumerate()
            .map(|(k, (v, i))| RawSample {
                timestamp: k as f64,
                primary: *v,
                secondary: *i,
                status: 0.0,
            })
            .collect()
    }

    fn get(report: &Report, key: &str) -> f64 {
        report[key].as_number().unwrap()
    }

    #[test]
    fn rectangular_cell() {
        // isc 20 mA, voc 0.6 V, a sharp knee at 0.5 V
        let samples = curve(&[(-0.1, -0.02), (0.0, -0.02), (0.5, -0.02), (0.6, 0.0), (0.7, 0.05)]);
        let report = IvAnalyzer::new(0.5).fit(&samples).unwrap();
        assert!((get(&report, "isc[A]") - 0.02).abs() < 1e-12);
        assert!((get(&report, "voc[V]") - 0.6).abs() < 1e-12);
        assert!((get(&report, "pmax[mW]") - 10.0).abs() < 1e-9);
        assert!((get(&report, "ff") - 10.0 / 12.0).abs() < 1e-9);
        // 10 mW on 0.5 cm^2 under 50 mW
        assert!((get(&report, "pce[%]") - 20.0).abs() < 1e-9);
        assert!((get(&report, "jsc[mA/cm^2]") - 40.0).abs() < 1e-9);
    }

    #[test]
    fn interpolates_crossings() {
        let samples = curve(&[(0.2, -0.01), (-0.2, -0.03), (0.8, 0.01), (0.4, -0.01)]);
        let report = IvAnalyzer::new(1.0).fit(&samples).unwrap();
        assert!((get(&report, "isc[A]") - 0.02).abs() < 1e-12);
        assert!((get(&report, "voc[V]") - 0.6).abs() < 1e-12);
    }

    #[test]
    fn dark_curve_fails() {
        let samples = curve(&[(-0.2, -0.001), (0.0, 0.0001), (0.2, 0.001), (0.4, 0.01)]);
        assert!(IvAnalyzer::new(1.0).fit(&samples).is_err());
        assert!(IvAnalyzer::new(1.0).fit(&samples[..2]).is_err());
    }
}

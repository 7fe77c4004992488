/// Degrees <-> encoder counts for the ELL14 rotation mount.
///
/// Base unit is counts. Angles are wrapped into `[0, 360)` before converting,
/// so `-90` and `270` map to the same count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ell14UnitConverter {
    /// Degrees per count.
    pub slope: f64,
    /// Angle at count zero.
    pub offset: f64,
}

/// 143360 pulses per revolution.
pub const ELL14_COUNTS_PER_REVOLUTION: f64 = 143_360.0;

impl Default for Ell14UnitConverter {
    fn default() -> Self {
        Self {
            slope: 360.0 / ELL14_COUNTS_PER_REVOLUTION,
            offset: 0.0,
        }
    }
}

impl Ell14UnitConverter {
    /// Converter with a custom calibration.
    pub fn new(slope: f64, offset: f64) -> Self {
        Self { slope, offset }
    }

    /// Angle in degrees to counts.
    pub fn deg_to_counts(&self, degrees: f64) -> f64 {
        let wrapped = degrees.rem_euclid(360.0);
        (wrapped - self.offset) / self.slope
    }

    /// Counts to angle in degrees.
    pub fn counts_to_deg(&self, counts: f64) -> f64 {
        self.slope * counts + self.offset
    }
}

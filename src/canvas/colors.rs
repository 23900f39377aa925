/// Bottom of the displayed dynamic range.
pub const MIN_DB: f64 = -100.0;
/// Top of the displayed dynamic range.
pub const MAX_DB: f64 = 0.0;

/// Colour at `MIN_DB` and below.
pub const QUIET_RGB: [u8; 3] = [255, 255, 255];
/// Colour at `MAX_DB` and above.
pub const LOUD_RGB: [u8; 3] = [0, 0, 0];

/// Map a decibel intensity to an RGB triple.
///
/// Linear gradient from white at -100 dB to black at 0 dB. Each channel is
/// truncated toward zero, so -50 dB gives 127.
pub fn decibel_to_rgb(db: f64) -> [u8; 3] {
    if db >= MAX_DB {
        return LOUD_RGB;
    }
    if db < MIN_DB || db.is_nan() {
        return QUIET_RGB;
    }
    gradient(db, MIN_DB, MAX_DB, QUIET_RGB, LOUD_RGB)
}

fn gradient(value: f64, min: f64, max: f64, from: [u8; 3], to: [u8; 3]) -> [u8; 3] {
    let n = (value - min) / (max - min);
    let mix = |a: u8, b: u8| (a as f64 * (1.0 - n) + b as f64 * n) as u8;
    [mix(from[0], to[0]), mix(from[1], to[1]), mix(from[2], to[2])]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_endpoints() {
        assert_eq!(decibel_to_rgb(0.0), [0, 0, 0]);
        assert_eq!(decibel_to_rgb(12.0), [0, 0, 0]);
        assert_eq!(decibel_to_rgb(-100.0), [255, 255, 255]);
        assert_eq!(decibel_to_rgb(-250.0), [255, 255, 255]);
    }

    #[test]
    fn test_midpoint_truncates() {
        // 255 * 0.5 = 127.5, truncated
        assert_eq!(decibel_to_rgb(-50.0), [127, 127, 127]);
        assert_eq!(decibel_to_rgb(-75.0), [191, 191, 191]);
    }

    #[test]
    fn test_monotonic_darkening() {
        let mut last = 256u16;
        for step in 0..=100 {
            let db = -100.0 + step as f64;
            let v = decibel_to_rgb(db)[0] as u16;
            assert!(v <= last, "{db} dB brighter than previous");
            last = v;
        }
    }
}

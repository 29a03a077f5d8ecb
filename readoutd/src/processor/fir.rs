//! Integer lowpass FIR design for the trigger-primitive filter: a
//! Hamming-windowed sinc with the given tap count and cutoff (as a fraction
//! of the Nyquist frequency), scaled to integers by a power-of-two
//! multiplier.

const PI: f64 = 3.1416;

fn hamming(m: usize) -> Vec<f64> {
    (0..m)
        .map(|n| 0.54 - 0.46 * (2.0 * PI * n as f64 / (m as f64 - 1.0)).cos())
        .collect()
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

fn firwin(n: usize, cutoff: f64) -> Vec<f64> {
    let alpha = (n / 2) as f64;
    let window = hamming(n);
    let mut taps: Vec<f64> = (0..n)
        .map(|m| window[m] * sinc(cutoff * (m as f64 - alpha)))
        .collect();
    let sum: f64 = taps.iter().sum();
    for tap in taps.iter_mut() {
        *tap /= sum;
    }
    taps
}

/// Taps rounded to integers after scaling by `multiplier` (2^tap_exponent).
pub fn firwin_int(n: usize, cutoff: f64, multiplier: i32) -> Vec<i16> {
    firwin(n, cutoff)
        .into_iter()
        .map(|tap| (multiplier as f64 * tap).round() as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taps_are_symmetric_and_sum_near_multiplier() {
        let multiplier = 1 << 6;
        let taps = firwin_int(7, 0.1, multiplier);
        assert_eq!(taps.len(), 7);
        for i in 0..3 {
            assert_eq!(taps[i], taps[6 - i], "windowed sinc is symmetric");
        }
        let sum: i32 = taps.iter().map(|&t| t as i32).sum();
        // Integer rounding may lose a count or two against the multiplier.
        assert!((sum - multiplier).abs() <= taps.len() as i32);
    }

    #[test]
    fn dc_gain_is_positive_and_centre_tap_dominates() {
        let taps = firwin_int(7, 0.1, 1 << 6);
        let centre = taps[3];
        assert!(centre > 0);
        assert!(taps.iter().all(|&t| t <= centre));
    }
}

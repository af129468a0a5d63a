//! Colour space helpers: HSV for generating hues, CIE-Lab and ΔE76 for
//! judging how faithfully a device reproduces a colour.

pub type Rgb = [u8; 3];

pub const WHITE: Rgb = [255, 255, 255];

/// ΔE76 at or above this distance counts as a complete miss.
pub const MAX_DELTA_E: f32 = 100.0;

/// Converts a hue in degrees plus saturation/value in [0, 1] to RGB.
pub fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> Rgb {
    let hue = hue.rem_euclid(360.0);
    let s = saturation.clamp(0.0, 1.0);
    let v = value.clamp(0.0, 1.0);

    let c = v * s;
    let x = c * (1.0 - ((hue / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match (hue / 60.0) as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    [to_byte(r + m), to_byte(g + m), to_byte(b + m)]
}

fn to_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Linear interpolation between two colours, `t` clamped to [0, 1].
pub fn lerp_rgb(from: Rgb, to: Rgb, t: f32) -> Rgb {
    let t = t.clamp(0.0, 1.0);
    let mut out = [0u8; 3];
    for i in 0..3 {
        let value = from[i] as f32 + (to[i] as f32 - from[i] as f32) * t;
        out[i] = value.round().clamp(0.0, 255.0) as u8;
    }
    out
}

fn srgb_to_linear(channel: u8) -> f32 {
    let c = channel as f32 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// sRGB (D65) to CIE-Lab.
pub fn rgb_to_lab(rgb: Rgb) -> [f32; 3] {
    let r = srgb_to_linear(rgb[0]);
    let g = srgb_to_linear(rgb[1]);
    let b = srgb_to_linear(rgb[2]);

    let x = (0.4124 * r + 0.3576 * g + 0.1805 * b) / 0.95047;
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let z = (0.0193 * r + 0.1192 * g + 0.9505 * b) / 1.08883;

    let f = |t: f32| {
        if t > 0.008856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    };
    let (fx, fy, fz) = (f(x), f(y), f(z));

    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// CIE76 colour difference between two sRGB colours.
pub fn delta_e76(a: Rgb, b: Rgb) -> f32 {
    let la = rgb_to_lab(a);
    let lb = rgb_to_lab(b);
    ((la[0] - lb[0]).powi(2) + (la[1] - lb[1]).powi(2) + (la[2] - lb[2]).powi(2)).sqrt()
}

/// 1.0 for an exact match, falling linearly to 0.0 at [`MAX_DELTA_E`].
pub fn color_accuracy(commanded: Rgb, reported: Rgb) -> f32 {
    1.0 - (delta_e76(commanded, reported) / MAX_DELTA_E).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_primary_hues() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), [255, 0, 0]);
        assert_eq!(hsv_to_rgb(120.0, 1.0, 1.0), [0, 255, 0]);
        assert_eq!(hsv_to_rgb(240.0, 1.0, 1.0), [0, 0, 255]);
        assert_eq!(hsv_to_rgb(360.0, 0.0, 1.0), WHITE);
    }

    #[test]
    fn lab_of_white_and_black() {
        let white = rgb_to_lab(WHITE);
        assert!((white[0] - 100.0).abs() < 0.1);
        assert!(white[1].abs() < 0.5 && white[2].abs() < 0.5);
        assert!(rgb_to_lab([0, 0, 0])[0].abs() < 1e-3);
    }

    #[test]
    fn accuracy_is_bounded() {
        assert_eq!(color_accuracy([200, 10, 10], [200, 10, 10]), 1.0);
        assert!(color_accuracy(WHITE, [0, 0, 0]) < 1e-3);
        let near = color_accuracy([255, 0, 0], [245, 10, 5]);
        assert!(near > 0.9 && near < 1.0);
    }

    #[test]
    fn lerps_between_colours() {
        assert_eq!(lerp_rgb([0, 0, 0], [200, 100, 50], 0.5), [100, 50, 25]);
        assert_eq!(lerp_rgb([9, 9, 9], [200, 100, 50], 0.0), [9, 9, 9]);
    }
}

pub mod color;

use serde::{Deserialize, Serialize};

use crate::{analysis::FrequencySlice, LightSyncError, Mood, Result};

pub use color::Rgb;

const WARM_KELVIN: f32 = 2_200.0;
const COOL_KELVIN: f32 = 6_500.0;

/// Describes how audio features become light colours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ColorMapping {
    /// Bass pulls toward red, mids toward green and treble toward blue.
    FrequencyBands,
    /// A fixed palette per mood, indexed by the slice's spectral balance.
    MoodPalette,
    /// Caller-supplied palette, indexed like [`ColorMapping::MoodPalette`].
    Custom { palette: Vec<Rgb> },
}

impl Default for ColorMapping {
    fn default() -> Self {
        Self::FrequencyBands
    }
}

impl ColorMapping {
    pub fn validate(&self) -> Result<()> {
        match self {
            ColorMapping::Custom { palette } if palette.is_empty() => Err(LightSyncError::input(
                "custom colour mapping needs at least one colour",
            )),
            _ => Ok(()),
        }
    }

    /// Full-saturation target colour for one slice.
    pub fn color_for(&self, slice: &FrequencySlice, mood: Mood) -> Rgb {
        match self {
            ColorMapping::FrequencyBands => band_hue(slice),
            ColorMapping::MoodPalette => pick(mood_palette(mood), slice),
            ColorMapping::Custom { palette } => pick(palette, slice),
        }
    }
}

fn band_hue(slice: &FrequencySlice) -> Rgb {
    let total = slice.bass + slice.mid + slice.treble;
    if total <= f32::EPSILON {
        return color::WHITE;
    }

    // Weighted circular mean of the three band hues (0, 120, 240 degrees).
    let (mut x, mut y) = (0.0f32, 0.0f32);
    for (energy, hue) in [(slice.bass, 0.0f32), (slice.mid, 120.0), (slice.treble, 240.0)] {
        x += energy * hue.to_radians().cos();
        y += energy * hue.to_radians().sin();
    }
    let hue = y.atan2(x).to_degrees();

    let max = slice.bass.max(slice.mid).max(slice.treble);
    let min = slice.bass.min(slice.mid).min(slice.treble);
    let saturation = ((max - min) / max.max(f32::EPSILON)).clamp(0.35, 1.0);

    color::hsv_to_rgb(hue, saturation, 1.0)
}

/// Index grows with the share of mid and treble energy.
fn pick(palette: &[Rgb], slice: &FrequencySlice) -> Rgb {
    if palette.is_empty() {
        return color::WHITE;
    }
    let total = slice.bass + slice.mid + slice.treble;
    let brightness_share = if total > f32::EPSILON {
        (slice.mid + slice.treble) / total
    } else {
        0.0
    };
    let index = (brightness_share * (palette.len() - 1) as f32).round() as usize;
    palette[index.min(palette.len() - 1)]
}

/// Fixed colours associated with each mood.
pub fn mood_palette(mood: Mood) -> &'static [Rgb] {
    match mood {
        Mood::Calm => &[[40, 60, 160], [70, 110, 200], [120, 170, 230]],
        Mood::Dramatic => &[[90, 0, 40], [160, 20, 60], [230, 80, 40]],
        Mood::Relaxed => &[[30, 120, 90], [80, 170, 140], [180, 220, 200]],
        Mood::Happy => &[[255, 140, 0], [255, 210, 40], [120, 220, 255]],
        Mood::Energetic => &[[255, 0, 120], [0, 200, 255], [180, 255, 0]],
        Mood::Intense => &[[255, 0, 0], [255, 80, 0], [255, 255, 255]],
    }
}

/// Colour temperature for lights without RGB: bass-heavy material is warm,
/// treble-heavy material is cool.
pub fn color_temp_for(slice: &FrequencySlice) -> u16 {
    let total = slice.bass + slice.mid + slice.treble;
    let coolness = if total > f32::EPSILON {
        (slice.treble + 0.5 * slice.mid) / total
    } else {
        0.5
    };
    (WARM_KELVIN + (COOL_KELVIN - WARM_KELVIN) * coolness.clamp(0.0, 1.0)).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(bass: f32, mid: f32, treble: f32) -> FrequencySlice {
        FrequencySlice {
            timestamp: 0.0,
            bass,
            mid,
            treble,
            amplitude: 0.5,
        }
    }

    #[test]
    fn dominant_band_sets_hue() {
        let bass = ColorMapping::FrequencyBands.color_for(&slice(1.0, 0.0, 0.0), Mood::Happy);
        assert_eq!(bass, [255, 0, 0]);
        let treble = ColorMapping::FrequencyBands.color_for(&slice(0.0, 0.0, 1.0), Mood::Happy);
        assert_eq!(treble, [0, 0, 255]);
        let silent = ColorMapping::FrequencyBands.color_for(&slice(0.0, 0.0, 0.0), Mood::Happy);
        assert_eq!(silent, color::WHITE);
    }

    #[test]
    fn palettes_index_by_spectral_balance() {
        let mapping = ColorMapping::Custom {
            palette: vec![[1, 1, 1], [2, 2, 2], [3, 3, 3]],
        };
        assert_eq!(mapping.color_for(&slice(1.0, 0.0, 0.0), Mood::Calm), [1, 1, 1]);
        assert_eq!(mapping.color_for(&slice(0.0, 0.5, 0.5), Mood::Calm), [3, 3, 3]);

        let mood = ColorMapping::MoodPalette.color_for(&slice(1.0, 0.0, 0.0), Mood::Intense);
        assert_eq!(mood, mood_palette(Mood::Intense)[0]);
    }

    #[test]
    fn rejects_empty_custom_palette() {
        assert!(ColorMapping::Custom { palette: vec![] }.validate().is_err());
        assert!(ColorMapping::MoodPalette.validate().is_ok());
    }

    #[test]
    fn serialises_with_mode_tag() {
        let json = serde_json::to_string(&ColorMapping::Custom {
            palette: vec![[1, 2, 3]],
        })
        .unwrap();
        assert_eq!(json, r#"{"mode":"custom","palette":[[1,2,3]]}"#);
    }

    #[test]
    fn colour_temperature_tracks_treble() {
        assert_eq!(color_temp_for(&slice(1.0, 0.0, 0.0)), 2_200);
        assert_eq!(color_temp_for(&slice(0.0, 0.0, 1.0)), 6_500);
    }
}

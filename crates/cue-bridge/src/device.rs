//! Device Snapshot
//!
//! The value type the bridge keeps for every physical lighting device: its
//! identity as reported by the SDK and the average colour across its LEDs.

use serde::{Deserialize, Serialize};

/// An RGB colour, one byte per channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// A colour is "on" as soon as any channel is lit
    pub fn is_on(&self) -> bool {
        self.r > 0 || self.g > 0 || self.b > 0
    }

    /// Per-channel mean with integer division.
    ///
    /// Returns `None` for an empty input.
    pub fn average<'a, I>(colors: I) -> Option<Rgb>
    where
        I: IntoIterator<Item = &'a Rgb>,
    {
        let (mut r, mut g, mut b, mut n) = (0u64, 0u64, 0u64, 0u64);
        for c in colors {
            r += u64::from(c.r);
            g += u64::from(c.g);
            b += u64::from(c.b);
            n += 1;
        }
        if n == 0 {
            return None;
        }
        // The mean of u8 values always fits in a u8
        Some(Rgb::new((r / n) as u8, (g / n) as u8, (b / n) as u8))
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self::new(r, g, b)
    }
}

impl std::fmt::Display for Rgb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.r, self.g, self.b)
    }
}

/// Identity and averaged colour of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Model name reported by the SDK (e.g. "K70 RGB MK.2")
    pub model: String,
    /// Position of the device in the SDK's device list
    pub device_index: usize,
    /// Average colour of all LEDs on the device
    pub color: Rgb,
}

impl DeviceSnapshot {
    pub fn new(model: impl Into<String>, device_index: usize, color: Rgb) -> Self {
        Self {
            model: model.into(),
            device_index,
            color,
        }
    }

    /// Build a snapshot from per-LED colours as read from the SDK.
    ///
    /// A device without LEDs averages to black.
    pub fn from_leds(model: impl Into<String>, device_index: usize, leds: &[Rgb]) -> Self {
        Self::new(model, device_index, Rgb::average(leds).unwrap_or(Rgb::BLACK))
    }

    /// Replace the stored colour with the average of freshly read LED colours.
    ///
    /// Returns `true` if the averaged colour changed.
    pub fn refresh_from_leds(&mut self, leds: &[Rgb]) -> bool {
        let color = Rgb::average(leds).unwrap_or(Rgb::BLACK);
        let changed = color != self.color;
        self.color = color;
        changed
    }

    pub fn is_on(&self) -> bool {
        self.color.is_on()
    }
}

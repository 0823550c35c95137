//! Per-room presence state.
//!
//! Entries are keyed by user id, last write wins. Identity fields always
//! come from the authenticated connection; the client only contributes its
//! colour and cursor range.

use std::collections::HashMap;

use uuid::Uuid;

use crate::protocol::{PresenceEntry, PresenceUpdate};

/// Stable `#rrggbb` colour derived from a user id.
///
/// Saturation 0.7, lightness 0.6; only the hue varies with the id.
pub fn color_for_user(id: Uuid) -> String {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!("#{:02x}{:02x}{:02x}", to_byte(r), to_byte(g), to_byte(b))
}

/// Accepts `#rrggbb` only.
pub fn is_valid_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

fn to_byte(channel: f32) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Presence entries of one room.
#[derive(Debug, Default)]
pub struct PresenceMap {
    entries: HashMap<Uuid, PresenceEntry>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a local client update for `user_id` and return the stored entry.
    ///
    /// An invalid or missing colour falls back to the colour already on the
    /// entry, then to the user's stable colour.
    pub fn apply_local(&mut self, user_id: Uuid, name: &str, update: PresenceUpdate) -> PresenceEntry {
        let previous_color = self.entries.get(&user_id).map(|e| e.color.clone());
        let color = update
            .color
            .filter(|c| is_valid_color(c))
            .or(previous_color)
            .unwrap_or_else(|| color_for_user(user_id));

        let entry = PresenceEntry {
            user_id,
            name: name.to_string(),
            color,
            cursor: update.cursor,
        };
        self.entries.insert(user_id, entry.clone());
        entry
    }

    /// Store an entry received from a sibling instance as is.
    pub fn apply_remote(&mut self, entry: PresenceEntry) {
        self.entries.insert(entry.user_id, entry);
    }

    pub fn remove(&mut self, user_id: &Uuid) -> Option<PresenceEntry> {
        self.entries.remove(user_id)
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

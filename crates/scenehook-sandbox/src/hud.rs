// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Performance HUD envelope.
//!
//! The overlay is not a scene node of its own: it serializes as a directive
//! line followed by the untouched inner scene, and a consumer that ignores
//! the directive sees exactly the inner graph.

use scenehook_proto::{pack_rgba, HudOptions};

use crate::library::Scene;

/// Prefix of the directive line emitted by [`HudOverlay`].
pub const HUD_DIRECTIVE: &str = "#hud";

/// Wraps a scene with an on-screen performance HUD.
pub struct HudOverlay {
    inner: Box<dyn Scene>,
    options: HudOptions,
}

impl HudOverlay {
    /// Wrap `inner`.
    pub fn new(inner: Box<dyn Scene>, options: HudOptions) -> Self {
        Self { inner, options }
    }
}

impl Scene for HudOverlay {
    fn serialize(&self) -> String {
        let (num, den) = self.options.refresh_rate;
        format!(
            "{HUD_DIRECTIVE} measure_window={} refresh_rate={num}/{den} bg_color={:08X}\n{}",
            self.options.measure_window,
            pack_rgba(self.options.bg_color),
            self.inner.serialize()
        )
    }
}

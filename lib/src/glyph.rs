//! Special Unicode characters used for display with ASCII fallbacks
//! in case we're not in a UTF-8 locale.

use std::fmt::Display;

/// Outcome indicator dot printed during cleanup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Glyph {
    Ok,
    Nok,
    Neutral,
}

impl Glyph {
    #[allow(dead_code)]
    pub(crate) fn as_ascii(&self) -> &'static str {
        match self {
            Glyph::Ok => "+",
            Glyph::Nok => "x",
            Glyph::Neutral => ".",
        }
    }

    pub(crate) fn as_utf8(&self) -> &'static str {
        match self {
            Glyph::Ok => "●",
            Glyph::Nok => "✗",
            Glyph::Neutral => "·",
        }
    }
}

impl Display for Glyph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_utf8())
    }
}

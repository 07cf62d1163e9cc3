//! Shared UI icons/emoji, with plain-ASCII fallbacks for non-UTF8 terminals.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "* ");
pub static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
pub static HOURGLASS: Emoji<'_, '_> = Emoji("⏳ ", "[...] ");
pub static WARNING: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN] ");

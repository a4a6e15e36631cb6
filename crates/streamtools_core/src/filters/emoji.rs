#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};
use unicode_segmentation::UnicodeSegmentation;

const ZWJ: u32 = 0x200D;
const VARIATION_SELECTOR_16: u32 = 0xFE0F;
const COMBINING_KEYCAP: u32 = 0x20E3;

/// Codepoint ranges treated as emoji without any data file.
const BUILTIN_RANGES: &[(u32, u32)] = &[
	(0x00A9, 0x00A9),
	(0x00AE, 0x00AE),
	(0x203C, 0x203C),
	(0x2049, 0x2049),
	(0x2122, 0x2122),
	(0x2139, 0x2139),
	(0x2194, 0x2199),
	(0x21A9, 0x21AA),
	(0x231A, 0x231B),
	(0x2328, 0x2328),
	(0x23CF, 0x23CF),
	(0x23E9, 0x23F3),
	(0x23F8, 0x23FA),
	(0x24C2, 0x24C2),
	(0x25AA, 0x25AB),
	(0x25B6, 0x25B6),
	(0x25C0, 0x25C0),
	(0x25FB, 0x25FE),
	(0x2600, 0x27BF),
	(0x2934, 0x2935),
	(0x2B05, 0x2B07),
	(0x2B1B, 0x2B1C),
	(0x2B50, 0x2B50),
	(0x2B55, 0x2B55),
	(0x3030, 0x3030),
	(0x303D, 0x303D),
	(0x3297, 0x3297),
	(0x3299, 0x3299),
	(0x1F000, 0x1FAFF),
];

/// Codepoints that only appear inside emoji sequences.
pub fn is_emoji_component(cp: u32) -> bool {
	matches!(
		cp,
		ZWJ | VARIATION_SELECTOR_16
			| COMBINING_KEYCAP
			| 0x1F3FB..=0x1F3FF
			| 0xE0020..=0xE007F
			| 0x1F1E6..=0x1F1FF
	)
}

fn is_keycap_base(cp: u32) -> bool {
	matches!(cp, 0x23 | 0x2A | 0x30..=0x39)
}

/// Uppercase hex per codepoint, at least four digits, space separated.
pub fn hex_sequence(grapheme: &str) -> String {
	grapheme
		.chars()
		.map(|c| format!("{:04X}", c as u32))
		.collect::<Vec<_>>()
		.join(" ")
}

/// Known emoji codepoints and sequences.
#[derive(Debug, Clone)]
pub struct EmojiAllowlist {
	ranges: Vec<(u32, u32)>,
	sequences: HashSet<String>,
}

impl Default for EmojiAllowlist {
	fn default() -> Self {
		Self::builtin()
	}
}

impl EmojiAllowlist {
	pub fn builtin() -> Self {
		Self {
			ranges: BUILTIN_RANGES.to_vec(),
			sequences: HashSet::new(),
		}
	}

	/// Built-in list, extended from `path` when given.
	pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
		let mut list = Self::builtin();
		if let Some(path) = path {
			let data = fs::read_to_string(path).with_context(|| format!("read emoji data {}", path.display()))?;
			let added = list.extend_from_data(&data);
			info!(path = %path.display(), added, "emoji allowlist extended");
		}
		Ok(list)
	}

	/// Parse unicode.org emoji data lines (`1F600..1F64F ; ...`, `1F468 200D 1F469 ; ...`).
	/// Returns the number of entries added.
	pub fn extend_from_data(&mut self, data: &str) -> usize {
		let mut added = 0;
		for line in data.lines() {
			let line = line.split('#').next().unwrap_or_default();
			let field = line.split(';').next().unwrap_or_default().trim();
			if field.is_empty() {
				continue;
			}

			if let Some((lo, hi)) = field.split_once("..") {
				if let (Ok(lo), Ok(hi)) = (u32::from_str_radix(lo.trim(), 16), u32::from_str_radix(hi.trim(), 16))
					&& lo <= hi
				{
					self.ranges.push((lo, hi));
					added += 1;
				}
				continue;
			}

			let cps: Result<Vec<u32>, _> = field.split_whitespace().map(|h| u32::from_str_radix(h, 16)).collect();
			match cps.as_deref() {
				Ok([single]) => {
					self.ranges.push((*single, *single));
					added += 1;
				}
				Ok(seq) if !seq.is_empty() => {
					let key = seq.iter().map(|cp| format!("{cp:04X}")).collect::<Vec<_>>().join(" ");
					self.sequences.insert(key);
					added += 1;
				}
				_ => debug!(line = field, "emoji data: unparsable line skipped"),
			}
		}
		added
	}

	pub fn contains_codepoint(&self, cp: u32) -> bool {
		self.ranges.iter().any(|&(lo, hi)| (lo..=hi).contains(&cp))
	}

	pub fn contains_sequence(&self, hex: &str) -> bool {
		self.sequences.contains(hex)
	}

	/// ASCII, a listed emoji, or a sequence built only from emoji and components.
	pub fn accepts_grapheme(&self, grapheme: &str) -> bool {
		let cps: Vec<u32> = grapheme.chars().map(|c| c as u32).collect();
		match cps.as_slice() {
			[] => true,
			[cp] => *cp <= 127 || self.contains_codepoint(*cp),
			_ if cps.iter().all(|cp| *cp <= 127) => true,
			_ => {
				if self.contains_sequence(&hex_sequence(grapheme)) {
					return true;
				}
				let keycap = cps.contains(&COMBINING_KEYCAP);
				cps.iter()
					.all(|&cp| self.contains_codepoint(cp) || is_emoji_component(cp) || (keycap && is_keycap_base(cp)))
			}
		}
	}

	/// First grapheme the list does not accept.
	pub fn first_rejected<'a>(&self, text: &'a str) -> Option<&'a str> {
		text.graphemes(true).find(|g| !self.accepts_grapheme(g))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hex_sequences_are_padded_uppercase() {
		assert_eq!(hex_sequence("a"), "0061");
		assert_eq!(hex_sequence("😀"), "1F600");
		assert_eq!(hex_sequence("👍🏽"), "1F44D 1F3FD");
	}

	#[test]
	fn builtin_accepts_common_emoji_and_rejects_letters() {
		let list = EmojiAllowlist::builtin();
		assert!(list.first_rejected("hello 😀").is_none());
		assert!(list.first_rejected("gg 👍🏽 ❤️").is_none());
		assert!(list.first_rejected("👨‍👩‍👧 family").is_none());
		assert!(list.first_rejected("🇺🇸 #️⃣").is_none());
		assert_eq!(list.first_rejected("héllo"), Some("é"));
		assert_eq!(list.first_rejected("пример"), Some("п"));
	}

	#[test]
	fn decomposed_accents_are_rejected() {
		let list = EmojiAllowlist::builtin();
		assert!(list.first_rejected("he\u{301}llo").is_some());
	}

	#[test]
	fn data_file_extends_ranges_and_sequences() {
		let mut list = EmojiAllowlist::builtin();
		let data = "\
# comment line
00E9          ; Basic_Emoji ; pretend
0400..04FF    ; Basic_Emoji ; pretend cyrillic
0065 0301     ; RGI_Emoji_Sequence ; pretend
garbage ; nope
";
		assert_eq!(list.extend_from_data(data), 3);
		assert!(list.first_rejected("héllo").is_none());
		assert!(list.first_rejected("пример").is_none());
		assert!(list.contains_sequence("0065 0301"));
		assert!(list.first_rejected("he\u{301}llo").is_none());
	}
}

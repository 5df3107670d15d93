#![forbid(unsafe_code)]

use crossterm::style::{Color, Stylize};
use lurker_domain::{ChatEvent, StreamerHandle};
use rand::Rng;

const PALETTE: [Color; 6] = [
	Color::Red,
	Color::Green,
	Color::Yellow,
	Color::Cyan,
	Color::Blue,
	Color::Magenta,
];

/// Echo one streamed chat message, tinted with the sender's identity color
/// when it is valid `#RRGGBB` hex, otherwise a random palette color.
pub fn print_chat_line(streamer: &StreamerHandle, event: &ChatEvent) {
	let color = event
		.sender_color
		.as_deref()
		.and_then(parse_hex_color)
		.unwrap_or_else(random_color);

	let line = format!("{}:{}: {}", streamer, event.sender, event.content);
	println!("{}", line.with(color));

	for link in &event.links {
		let link_line = format!("[{}] {} link: {}", streamer, event.sender, link);
		println!("{}", link_line.with(Color::Yellow).bold());
	}
}

fn parse_hex_color(hex: &str) -> Option<Color> {
	let hex = hex.strip_prefix('#')?;
	if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
		return None;
	}

	let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
	let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
	let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
	Some(Color::Rgb { r, g, b })
}

fn random_color() -> Color {
	PALETTE[rand::thread_rng().gen_range(0..PALETTE.len())]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_well_formed_hex_colors() {
		assert_eq!(parse_hex_color("#ff0000"), Some(Color::Rgb { r: 255, g: 0, b: 0 }));
		assert_eq!(parse_hex_color("#00FF7f"), Some(Color::Rgb { r: 0, g: 255, b: 127 }));
	}

	#[test]
	fn rejects_malformed_hex_colors() {
		assert_eq!(parse_hex_color("ff0000"), None);
		assert_eq!(parse_hex_color("#fff"), None);
		assert_eq!(parse_hex_color("#zzzzzz"), None);
		assert_eq!(parse_hex_color("#ff00001"), None);
	}
}

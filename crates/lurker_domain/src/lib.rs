#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid uuid: {0}")]
	InvalidUuid(String),
}

/// Streamer handle on the upstream platform (channel slug).
///
/// Handles are case-insensitive upstream; they are normalized to lowercase
/// so the manager registry and durable storage agree on the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamerHandle(String);

impl StreamerHandle {
	/// Create a non-empty, lowercased `StreamerHandle`.
	pub fn new(handle: impl Into<String>) -> Result<Self, ParseIdError> {
		let handle = handle.into();
		let trimmed = handle.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for StreamerHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for StreamerHandle {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		StreamerHandle::new(s)
	}
}

macro_rules! uuid_id {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub Uuid);

		impl $name {
			/// Create a new random id.
			pub fn new_v4() -> Self {
				Self(Uuid::new_v4())
			}

			pub fn as_uuid(&self) -> Uuid {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				Uuid::parse_str(s).map(Self).map_err(|_| ParseIdError::InvalidUuid(s.to_string()))
			}
		}

		impl From<Uuid> for $name {
			fn from(v: Uuid) -> Self {
				Self(v)
			}
		}
	};
}

uuid_id!(
	/// Authenticated end-user identifier.
	UserId
);
uuid_id!(
	/// Durable streamer row identifier.
	StreamerId
);
uuid_id!(
	/// Durable listener row identifier.
	ListenerId
);

/// One user's time-bounded request to follow a streamer.
///
/// Interests are immutable once created; adding another interest for the
/// same user replaces the prior one in the listener's interest map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
	pub user_id: UserId,
	pub request_time: DateTime<Utc>,
	pub end_time: DateTime<Utc>,
}

impl Interest {
	pub fn new(user_id: UserId, request_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
		debug_assert!(end_time > request_time, "interest end_time must be after request_time");
		Self {
			user_id,
			request_time,
			end_time,
		}
	}

	/// Whether the interest is still live at `now`.
	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		now < self.end_time
	}
}

/// A decoded upstream chat message, immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
	/// Platform-native message id.
	pub platform_id: String,

	/// Durable listener row this message is attributed to.
	pub listener_id: ListenerId,

	pub sender: String,

	/// Sender identity color as sent by the platform (`#RRGGBB`), if any.
	pub sender_color: Option<String>,

	pub content: String,

	pub timestamp: DateTime<Utc>,

	pub has_link: bool,

	pub links: Vec<String>,
}

//! Marker-file modes and the wire tokens subscribers match on.

use std::{fmt, io};

use tracing::warn;

/// The detector's current belief about marker-file presence.
///
/// Owned and mutated by exactly one detector instance; never persisted
/// across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
	#[default]
	Unknown,
	Present,
	Absent,
}

/// Events delivered to subscribers, one frame per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEvent {
	/// The marker file appeared.
	FilePresent,
	/// The marker file disappeared.
	FileAbsent,
	/// Periodic heartbeat, independent of file activity.
	Alive,
}

impl ModeEvent {
	/// The exact token sent on the wire. Consumers match on these strings.
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::FilePresent => "file-present",
			Self::FileAbsent => "file-absent",
			Self::Alive => "alive",
		}
	}

	pub fn from_token(token: &str) -> Option<Self> {
		match token {
			"file-present" => Some(Self::FilePresent),
			"file-absent" => Some(Self::FileAbsent),
			"alive" => Some(Self::Alive),
			_ => None,
		}
	}
}

impl fmt::Display for ModeEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl Mode {
	/// Applies the outcome of a marker-file stat to the current mode,
	/// returning the transition event to emit, if any.
	///
	/// The mode-equality check here is the sole deduplication mechanism:
	/// redundant raw signals for one logical change map to the same stat
	/// result and are absorbed. Stat failures other than not-found are
	/// transient environmental errors and change nothing.
	pub fn apply<T>(&mut self, stat: &io::Result<T>) -> Option<ModeEvent> {
		match stat {
			Ok(_) => (*self != Self::Present).then(|| {
				*self = Self::Present;
				ModeEvent::FilePresent
			}),
			Err(e) if e.kind() == io::ErrorKind::NotFound => (*self != Self::Absent).then(|| {
				*self = Self::Absent;
				ModeEvent::FileAbsent
			}),
			Err(e) => {
				warn!(error = %e, "Transient error while checking marker file;");
				None
			}
		}
	}
}

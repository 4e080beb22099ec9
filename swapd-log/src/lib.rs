
#[macro_use] extern crate serde;

#[macro_use]
mod macros;
mod msgs;
mod serde_utils;

pub use crate::msgs::*;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::ser::{Serialize, SerializeMap, Serializer};


/// The "target" field used for structured logging.
pub const SLOG_TARGET: &str = "swapd-slog";

/// The key-value key holding the structured log message type.
const LOGID_FIELD: &str = "slog_id";
/// The key-value key holding the serialized structured log message.
const DATA_FIELD: &str = "slog_data";

/// Trait implemented by all our structured log messages.
pub trait LogMsg: Sized + Send + fmt::Debug + Serialize + DeserializeOwned + 'static {
	const LOGID: &'static str;
	const LEVEL: log::Level;
	const MSG: &'static str;
}

/// Log the structured message.
///
/// Use the [slog] macro instead of calling this directly.
pub fn log<T: LogMsg>(obj: &T, module: &str, file: &str, line: u32) {
	let kv = [
		(LOGID_FIELD, log::kv::Value::from(T::LOGID)),
		(DATA_FIELD, log::kv::Value::from_serde(obj)),
	];
	log::logger().log(&log::Record::builder()
		.args(format_args!("{}", T::MSG))
		.level(T::LEVEL)
		.target(SLOG_TARGET)
		.module_path(Some(module))
		.file(Some(file))
		.line(Some(line))
		.key_values(&kv)
		.build()
	);
}

/// A wrapper around a [log::Record] that implements [serde::Serialize].
///
/// Used to write our log files as JSON lines.
pub struct RecordSerializeWrapper<'a>(pub &'a log::Record<'a>);

impl<'a> Serialize for RecordSerializeWrapper<'a> {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		let mut m = s.serialize_map(None)?;
		m.serialize_entry("msg", self.0.args())?;
		m.serialize_entry("level", &self.0.level())?;
		m.serialize_entry("target", self.0.target())?;
		if let Some(module) = self.0.module_path() {
			m.serialize_entry("module", module)?;
		}
		if let Some(file) = self.0.file() {
			m.serialize_entry("file", file)?;
		}
		if let Some(line) = self.0.line() {
			m.serialize_entry("line", &line)?;
		}
		let kv = self.0.key_values();
		if let Some(id) = kv.get(LOGID_FIELD.into()) {
			m.serialize_entry(LOGID_FIELD, &id)?;
		}
		if let Some(data) = kv.get(DATA_FIELD.into()) {
			m.serialize_entry(DATA_FIELD, &data)?;
		}
		m.end()
	}
}

#[derive(Debug)]
pub enum RecordParseError {
	WrongType,
	Json(serde_json::Error),
}

impl fmt::Display for RecordParseError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			RecordParseError::WrongType => f.write_str("log record is of a different type"),
			RecordParseError::Json(e) => write!(f, "invalid log record json: {}", e),
		}
	}
}

impl std::error::Error for RecordParseError {}

pub fn parse_record(record: &str) -> Result<ParsedRecord, RecordParseError> {
	serde_json::from_str(record).map_err(RecordParseError::Json)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedRecord {
	pub msg: String,
	pub level: log::Level,
	pub target: String,
	pub module: Option<String>,
	pub file: Option<String>,
	pub line: Option<u32>,
	// structured stuff
	pub slog_id: Option<String>,
	pub slog_data: Option<serde_json::Value>,
}

impl ParsedRecord {
	/// Whether this is a structured log message
	pub fn is_slog(&self) -> bool {
		self.slog_id.is_some()
	}

	/// Check whether this log message if of the given structure log type.
	pub fn is<T: LogMsg>(&self) -> bool {
		self.slog_id.as_deref() == Some(T::LOGID)
	}

	/// Try to parse the log message into the given structured log type.
	pub fn try_as<T: LogMsg>(&self) -> Result<T, RecordParseError> {
		if !self.is::<T>() {
			return Err(RecordParseError::WrongType);
		}

		let data = self.slog_data.clone().unwrap_or(serde_json::Value::Null);
		serde_json::from_value(data).map_err(RecordParseError::Json)
	}
}

//! Line classification for shell output.
//!
//! [`OutputParser`] accepts bytes in whatever chunks the pipe delivers,
//! reassembles complete lines, and turns each one into an [`OutputEvent`].
//! Classification runs in a fixed order:
//!
//! 1. Structured block content, while a block is open.
//! 2. Echo filtering: continuation lines (`>>`), prompt lines (`PS ...>`)
//!    and lines the session itself just wrote become [`OutputEvent::Raw`].
//! 3. The ordered [`RuleSet`]; first match wins.
//! 4. Sentinels of the armed command.
//! 5. Everything else is [`OutputEvent::Raw`].
//!
//! Events are pulled lazily with [`OutputParser::next_event`], so the
//! result is identical however the input was split.

use std::collections::VecDeque;
use std::ops::Range;

use regex::Regex;
use serde_json::Value;

use crate::launcher::{AUTH_FAILED_MARKER, CONNECTED_MARKER};

/// Longest line kept before it is cut and classified on its own.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Default size cap for a structured block.
pub const DEFAULT_BLOCK_LIMIT: usize = 8 * 1024 * 1024;

const ECHO_LEDGER_LEN: usize = 64;

/// Prompts that mean the remote directory is waiting for a second factor.
pub const DEFAULT_SECOND_FACTOR_PATTERNS: &[&str] = &[
	r"(?i)enter (the )?(verification|security|one-time|sms) code",
	r"(?i)verification code\s*:",
	r"(?i)approve (the )?sign[- ]in request",
	r"(?i)enter the code .* to authenticate",
];

/// A classified output line.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
	Raw(String),
	SecondFactorPrompt(String),
	Connected,
	AuthRejected(String),
	BlockStart,
	BlockLine(String),
	BlockEnd(Result<Value, MalformedBlock>),
	CommandFailed(String),
}

/// A structured block whose body was not valid JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedBlock {
	pub message: String,
	pub raw: String,
}

/// How a rule recognizes its line.
#[derive(Debug, Clone)]
pub enum Matcher {
	Exact(String),
	Prefix(String),
	Contains(String),
	Pattern(Regex),
}

impl Matcher {
	/// Byte range of the match inside `line`.
	fn find(&self, line: &str) -> Option<Range<usize>> {
		match self {
			Matcher::Exact(text) => (line == text).then(|| 0..line.len()),
			Matcher::Prefix(text) => line.starts_with(text.as_str()).then(|| 0..text.len()),
			Matcher::Contains(text) => line.find(text.as_str()).map(|start| start..start + text.len()),
			Matcher::Pattern(regex) => regex.find(line).map(|m| m.range()),
		}
	}
}

/// What a matching rule means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
	SecondFactorPrompt,
	Connected,
	AuthRejected,
}

#[derive(Debug, Clone)]
pub struct Rule {
	pub kind: RuleKind,
	pub matcher: Matcher,
}

/// Ordered classification rules. First match wins.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
	rules: Vec<Rule>,
}

impl RuleSet {
	pub fn empty() -> Self {
		Self::default()
	}

	/// Built-in prompt patterns followed by the bootstrap markers.
	pub fn standard() -> Self {
		let mut rules = Self::empty();
		for pattern in DEFAULT_SECOND_FACTOR_PATTERNS {
			if let Ok(regex) = Regex::new(pattern) {
				rules.push(RuleKind::SecondFactorPrompt, Matcher::Pattern(regex));
			}
		}
		rules.push_markers();
		rules
	}

	/// Replaces the built-in prompt patterns with `patterns`.
	pub fn with_prompt_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
		let mut rules = Self::empty();
		for pattern in patterns {
			rules.push(RuleKind::SecondFactorPrompt, Matcher::Pattern(Regex::new(pattern.as_ref())?));
		}
		rules.push_markers();
		Ok(rules)
	}

	fn push_markers(&mut self) {
		self.push(RuleKind::Connected, Matcher::Contains(CONNECTED_MARKER.to_string()));
		self.push(RuleKind::AuthRejected, Matcher::Contains(AUTH_FAILED_MARKER.to_string()));
	}

	pub fn push(&mut self, kind: RuleKind, matcher: Matcher) -> &mut Self {
		self.rules.push(Rule { kind, matcher });
		self
	}

	pub fn len(&self) -> usize {
		self.rules.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rules.is_empty()
	}

	fn classify(&self, line: &str) -> Option<OutputEvent> {
		self.rules.iter().find_map(|rule| {
			let range = rule.matcher.find(line)?;
			Some(match rule.kind {
				RuleKind::SecondFactorPrompt => OutputEvent::SecondFactorPrompt(line.trim().to_string()),
				RuleKind::Connected => OutputEvent::Connected,
				RuleKind::AuthRejected => OutputEvent::AuthRejected(line[range.end..].trim().to_string()),
			})
		})
	}
}

/// Start, end and failure markers for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
	pub begin: String,
	pub end: String,
	pub fail: String,
}

impl Sentinels {
	pub fn for_tag(tag: &str) -> Self {
		Self {
			begin: format!("<<<TS:BEGIN:{tag}>>>"),
			end: format!("<<<TS:END:{tag}>>>"),
			fail: format!("<<<TS:FAIL:{tag}>>>"),
		}
	}
}

#[derive(Debug)]
struct OpenBlock {
	body: String,
	overflowed: bool,
}

/// Incremental classifier for one output stream.
#[derive(Debug)]
pub struct OutputParser {
	rules: RuleSet,
	buffer: Vec<u8>,
	eof: bool,
	armed: Option<Sentinels>,
	block: Option<OpenBlock>,
	block_limit: usize,
	echoes: VecDeque<String>,
}

impl OutputParser {
	pub fn new(rules: RuleSet) -> Self {
		Self {
			rules,
			buffer: Vec::new(),
			eof: false,
			armed: None,
			block: None,
			block_limit: DEFAULT_BLOCK_LIMIT,
			echoes: VecDeque::new(),
		}
	}

	pub fn with_block_limit(mut self, limit: usize) -> Self {
		self.block_limit = limit;
		self
	}

	/// Appends raw bytes. Call [`next_event`](Self::next_event) to consume them.
	pub fn feed(&mut self, chunk: &[u8]) {
		self.buffer.extend_from_slice(chunk);
	}

	/// Marks end of input so a trailing unterminated line is classified.
	pub fn finish(&mut self) {
		self.eof = true;
	}

	/// Expects the sentinels of the command now in flight.
	pub fn arm(&mut self, sentinels: Sentinels) {
		self.armed = Some(sentinels);
		self.block = None;
	}

	/// Stops recognizing sentinels and drops any partially read block.
	pub fn disarm(&mut self) {
		self.armed = None;
		self.block = None;
	}

	pub fn is_armed(&self) -> bool {
		self.armed.is_some()
	}

	/// Records text the session wrote so its echo is not classified.
	pub fn note_written(&mut self, text: &str) {
		for line in text.lines() {
			let line = line.trim();
			if line.is_empty() {
				continue;
			}
			if self.echoes.len() == ECHO_LEDGER_LEN {
				self.echoes.pop_front();
			}
			self.echoes.push_back(line.to_string());
		}
	}

	/// Lazily yields events for every complete line fed so far.
	pub fn drain(&mut self) -> impl Iterator<Item = OutputEvent> + '_ {
		std::iter::from_fn(move || self.next_event())
	}

	pub fn next_event(&mut self) -> Option<OutputEvent> {
		match self.take_line() {
			Some(line) => Some(self.classify(line)),
			None if self.eof && self.block.is_some() => {
				self.block = None;
				self.armed = None;
				Some(OutputEvent::BlockEnd(Err(MalformedBlock {
					message: "output ended inside a structured block".to_string(),
					raw: String::new(),
				})))
			}
			None => None,
		}
	}

	fn take_line(&mut self) -> Option<String> {
		let window = self.buffer.len().min(MAX_LINE_BYTES);
		let (take, skip) = match self.buffer[..window].iter().position(|&b| b == b'\n') {
			Some(pos) => (pos, 1),
			None if self.buffer.len() >= MAX_LINE_BYTES => (MAX_LINE_BYTES, 0),
			None if self.eof && !self.buffer.is_empty() => (self.buffer.len(), 0),
			None => return None,
		};

		let mut line: Vec<u8> = self.buffer.drain(..take + skip).take(take).collect();
		if line.last() == Some(&b'\r') {
			line.pop();
		}
		Some(String::from_utf8_lossy(&line).into_owned())
	}

	fn classify(&mut self, line: String) -> OutputEvent {
		if self.block.is_some() {
			return self.continue_block(line);
		}

		let trimmed = line.trim();
		if self.is_echo(trimmed) {
			return OutputEvent::Raw(line);
		}

		if let Some(event) = self.rules.classify(trimmed) {
			return event;
		}

		if let Some(sentinels) = &self.armed {
			if trimmed == sentinels.begin {
				self.block = Some(OpenBlock {
					body: String::new(),
					overflowed: false,
				});
				return OutputEvent::BlockStart;
			}
			if let Some(message) = trimmed.strip_prefix(sentinels.fail.as_str()) {
				let message = message.trim().to_string();
				self.armed = None;
				return OutputEvent::CommandFailed(message);
			}
		}

		OutputEvent::Raw(line)
	}

	fn continue_block(&mut self, line: String) -> OutputEvent {
		let is_end = self.armed.as_ref().is_some_and(|s| line.trim() == s.end);
		if !is_end {
			if let Some(block) = self.block.as_mut() {
				if block.body.len() + line.len() + 1 > self.block_limit {
					block.overflowed = true;
				} else {
					block.body.push_str(&line);
					block.body.push('\n');
				}
			}
			return OutputEvent::BlockLine(line);
		}

		self.armed = None;
		let Some(block) = self.block.take() else {
			return OutputEvent::Raw(line);
		};

		if block.overflowed {
			return OutputEvent::BlockEnd(Err(MalformedBlock {
				message: format!("structured block exceeded {} bytes", self.block_limit),
				raw: String::new(),
			}));
		}

		let result = serde_json::from_str::<Value>(&block.body).map_err(|e| MalformedBlock {
			message: e.to_string(),
			raw: block.body.trim_end().to_string(),
		});
		OutputEvent::BlockEnd(result)
	}

	fn is_echo(&mut self, trimmed: &str) -> bool {
		if trimmed.starts_with(">>") || is_prompt_line(trimmed) {
			return true;
		}
		if let Some(pos) = self.echoes.iter().position(|written| written == trimmed) {
			self.echoes.remove(pos);
			return true;
		}
		false
	}
}

/// `PS C:\>` or `PS /home/admin> Get-CsOnlineUser ...`.
fn is_prompt_line(line: &str) -> bool {
	line.strip_prefix("PS ")
		.and_then(|rest| rest.find('>').map(|pos| !rest[..pos].is_empty()))
		.unwrap_or(false)
}

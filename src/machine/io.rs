//! IO channels, which connect IO microinstructions to the outside world.
//!
//! The interface for channels is defined with the [`IoChannel`] trait.
//! A channel can supply integers and characters, and accept integers and characters.
//!
//! Besides the trait, this module includes:
//! - [`BufferedChannel`]: A channel holding its input and output in shared buffers.
//! - [`ChannelIo`]: A channel that reads from and writes to crossbeam channels on helper threads.
//!
//! Integer input is tokenized: leading whitespace is skipped and then one integer is read.
//! Integers may be signed and may be written in decimal, hexadecimal (`0x1F`),
//! or binary (`0b101`).
//!
//! ```
//! use cpusim_engine::machine::io::{BufferedChannel, IoChannel};
//!
//! let mut chan = BufferedChannel::new();
//! chan.push_input("  12 -0x1F\n");
//! assert_eq!(chan.read_integer(), Ok(12));
//! assert_eq!(chan.read_integer(), Ok(-31));
//! assert!(chan.read_integer().is_err());
//!
//! chan.write_integer(-5);
//! chan.write_char('!');
//! assert_eq!(chan.take_output(), "-5\n!");
//! ```

use std::borrow::Cow;
use std::collections::VecDeque;
use std::num::IntErrorKind;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::thread::JoinHandle;

use crossbeam_channel as cbc;
use logos::{Lexer, Logos};

/// A source and sink of values for IO microinstructions.
///
/// Reads may block (e.g., while waiting on a user to type something).
pub trait IoChannel: Send {
    /// Reads one integer.
    fn read_integer(&mut self) -> Result<i64, InputErr>;
    /// Reads one character.
    fn read_char(&mut self) -> Result<char, InputErr>;
    /// Writes an integer.
    fn write_integer(&mut self, value: i64);
    /// Writes a character.
    fn write_char(&mut self, c: char);
    /// Discards any pending input and output.
    fn reset(&mut self);
}
impl dyn IoChannel {} // assert IoChannel is dyn safe

/// Errors that can occur while reading input from an [`IoChannel`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InputErr {
    /// The channel has no more input.
    Exhausted,
    /// The channel was closed.
    Closed,
    /// The input text is not an integer.
    #[default]
    InvalidInteger,
    /// The input text has a prefix (`0x`, `0b`) but no digits.
    EmptyDigits,
    /// The input integer does not fit in 64 bits.
    DoesNotFit,
}
impl std::fmt::Display for InputErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputErr::Exhausted      => f.write_str("no input available"),
            InputErr::Closed         => f.write_str("input channel closed"),
            InputErr::InvalidInteger => f.write_str("input is not a valid integer"),
            InputErr::EmptyDigits    => f.write_str("integer has no digits"),
            InputErr::DoesNotFit     => f.write_str("integer does not fit in 64 bits"),
        }
    }
}
impl std::error::Error for InputErr {}
impl crate::err::Error for InputErr {
    fn help(&self) -> Option<Cow<str>> {
        match self {
            InputErr::Exhausted      => Some("provide more input to the channel before executing".into()),
            InputErr::Closed         => None,
            InputErr::InvalidInteger => Some("integers can be written in decimal, hex (0x1F), or binary (0b101)".into()),
            InputErr::EmptyDigits    => Some("add digits after the prefix".into()),
            InputErr::DoesNotFit     => Some(format!("integers must be between {} and {}", i64::MIN, i64::MAX).into()),
        }
    }
}

#[derive(Debug, Logos, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+", error = InputErr)]
enum InputToken {
    // This regex spans over malformed integers (e.g., 12ab) as well.
    // They are validated (and rejected) by the callback.
    #[regex(r"[+-]?\w+", lex_integer)]
    Integer(i64),
}

fn lex_integer(lx: &Lexer<'_, InputToken>) -> Result<i64, InputErr> {
    let text = lx.slice();
    let (sign, unsigned) = match text.strip_prefix(['+', '-']) {
        Some(rest) => (&text[..1], rest),
        None => ("", text),
    };
    let (radix, digits) = if let Some(d) = unsigned.strip_prefix("0x").or_else(|| unsigned.strip_prefix("0X")) {
        (16, d)
    } else if let Some(d) = unsigned.strip_prefix("0b").or_else(|| unsigned.strip_prefix("0B")) {
        (2, d)
    } else {
        (10, unsigned)
    };
    if digits.is_empty() {
        return Err(match radix {
            10 => InputErr::InvalidInteger,
            _  => InputErr::EmptyDigits
        });
    }

    i64::from_str_radix(&format!("{sign}{digits}"), radix)
        .map_err(|e| match e.kind() {
            IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => InputErr::DoesNotFit,
            IntErrorKind::Empty => InputErr::EmptyDigits,
            _ => InputErr::InvalidInteger,
        })
}

/// Reads one integer off the front of `text`, removing it.
///
/// Returns `None` if the text holds no token (only whitespace).
fn take_integer(text: &mut String) -> Option<Result<i64, InputErr>> {
    let (token, end) = {
        let mut lexer = InputToken::lexer(text.as_str());
        (lexer.next()?, lexer.span().end)
    };

    text.drain(..end);
    Some(token.map(|InputToken::Integer(n)| n))
}
/// Reads one character off the front of `text`, removing it.
fn take_char(text: &mut String) -> Option<char> {
    let c = text.chars().next()?;
    text.drain(..c.len_utf8());
    Some(c)
}

fn lock_buf(buf: &RwLock<String>) -> RwLockWriteGuard<'_, String> {
    buf.write().unwrap_or_else(|e| e.into_inner())
}

/// A channel that reads from an input buffer and writes to an output buffer.
///
/// The buffers are shared, so a clone of this channel (or the buffers from
/// [`BufferedChannel::get_input`] and [`BufferedChannel::get_output`])
/// can be used to feed input and collect output while the machine owns the channel.
///
/// Reading from an empty input buffer fails with [`InputErr::Exhausted`].
#[derive(Debug, Clone, Default)]
pub struct BufferedChannel {
    input: Arc<RwLock<String>>,
    output: Arc<RwLock<String>>
}
impl BufferedChannel {
    /// Creates a new buffered channel.
    pub fn new() -> Self {
        Self { input: Default::default(), output: Default::default() }
    }
    /// Creates a new buffered channel from already defined buffers.
    pub fn with_bufs(input: Arc<RwLock<String>>, output: Arc<RwLock<String>>) -> Self {
        Self { input, output }
    }

    /// Gets a reference to the input buffer.
    pub fn get_input(&self) -> &Arc<RwLock<String>> {
        &self.input
    }
    /// Gets a reference to the output buffer.
    pub fn get_output(&self) -> &Arc<RwLock<String>> {
        &self.output
    }
    /// Appends text to the input buffer.
    pub fn push_input(&self, text: &str) {
        lock_buf(&self.input).push_str(text);
    }
    /// Takes everything written to the output buffer so far.
    pub fn take_output(&self) -> String {
        std::mem::take(&mut *lock_buf(&self.output))
    }
}
impl IoChannel for BufferedChannel {
    fn read_integer(&mut self) -> Result<i64, InputErr> {
        take_integer(&mut lock_buf(&self.input))
            .unwrap_or(Err(InputErr::Exhausted))
    }

    fn read_char(&mut self) -> Result<char, InputErr> {
        take_char(&mut lock_buf(&self.input))
            .ok_or(InputErr::Exhausted)
    }

    fn write_integer(&mut self, value: i64) {
        let mut out = lock_buf(&self.output);
        out.push_str(&value.to_string());
        out.push('\n');
    }

    fn write_char(&mut self, c: char) {
        lock_buf(&self.output).push(c);
    }

    fn reset(&mut self) {
        lock_buf(&self.input).clear();
        lock_buf(&self.output).clear();
    }
}

/// A helper struct for [`ChannelIo::new`],
/// indicating the channel is closed and no more reads/writes will come from it.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stop;

/// A channel that reads lines from a reader thread and sends output to a writer thread.
///
/// Reads block until the reader supplies enough text.
pub struct ChannelIo {
    pending: String,
    read_data: cbc::Receiver<String>,
    #[allow(unused)]
    read_handler: JoinHandle<()>,

    write_data: Option<cbc::Sender<String>>,
    write_handler: Option<JoinHandle<()>>
}
impl ChannelIo {
    /// Creates a new channel with the given reader and writer.
    ///
    /// The reader function is called on a helper thread every time the previous text was
    /// consumed by the channel. It should block until text is ready, or return `Stop`
    /// if there is nothing more to read.
    ///
    /// The writer function is called on a helper thread for every piece of output.
    pub fn new(
        mut reader: impl FnMut() -> Result<String, Stop> + Send + 'static,
        mut writer: impl FnMut(String) -> Result<(), Stop> + Send + 'static
    ) -> Self {
        let (read_tx, read_rx) = cbc::bounded(1);
        let (write_tx, write_rx) = cbc::unbounded::<String>();

        let read_handler = std::thread::spawn(move || loop {
            let Ok(text) = reader() else { return };
            let Ok(()) = read_tx.send(text) else { return };
        });

        let write_handler = std::thread::spawn(move || {
            for text in write_rx {
                let Ok(()) = writer(text) else { return };
            }
        });

        Self {
            pending: String::new(),
            read_data: read_rx,
            read_handler,
            write_data: Some(write_tx),
            write_handler: Some(write_handler)
        }
    }

    /// Creates a channel whose input is stdin (line by line) and whose output is stdout.
    pub fn stdio() -> Self {
        use std::io::{self, BufRead, Write};

        Self::new(
            || {
                let mut line = String::new();
                match io::stdin().lock().read_line(&mut line) {
                    Ok(0) | Err(_) => Err(Stop),
                    Ok(_) => Ok(line)
                }
            },
            |text| {
                let mut stdout = io::stdout().lock();
                stdout.write_all(text.as_bytes()).map_err(|_| Stop)?;
                stdout.flush().map_err(|_| Stop)
            }
        )
    }

    fn fill(&mut self) -> Result<(), InputErr> {
        let text = self.read_data.recv().map_err(|_| InputErr::Closed)?;
        self.pending.push_str(&text);
        Ok(())
    }
    fn send(&self, text: String) {
        // If the writer stopped, output is dropped.
        if let Some(tx) = &self.write_data {
            let _ = tx.send(text);
        }
    }
}
impl IoChannel for ChannelIo {
    fn read_integer(&mut self) -> Result<i64, InputErr> {
        loop {
            if let Some(result) = take_integer(&mut self.pending) {
                return result;
            }
            self.fill()?;
        }
    }

    fn read_char(&mut self) -> Result<char, InputErr> {
        loop {
            if let Some(c) = take_char(&mut self.pending) {
                return Ok(c);
            }
            self.fill()?;
        }
    }

    fn write_integer(&mut self, value: i64) {
        self.send(format!("{value}\n"));
    }

    fn write_char(&mut self, c: char) {
        self.send(c.to_string());
    }

    fn reset(&mut self) {
        self.pending.clear();
        while self.read_data.try_recv().is_ok() {}
    }
}
impl Drop for ChannelIo {
    fn drop(&mut self) {
        // Disconnect the writer so its thread finishes, then wait for pending output.
        // The reader thread is not joined, since it may be blocked on a read.
        self.write_data.take();
        if let Some(handle) = self.write_handler.take() {
            let _ = handle.join();
        }
    }
}

/// Handle to an IO channel owned by a machine.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) usize);

/// A value read from a channel, kept so a backed-up read can be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoToken {
    Integer(i64),
    Char(char)
}

struct ChannelSlot {
    name: String,
    device: Box<dyn IoChannel>,
    replay: VecDeque<IoToken>
}
impl ChannelSlot {
    /// Takes the next replayed token if it is of the kind being read.
    ///
    /// A read of the other kind means execution has diverged from the reads that were
    /// backed up, so the rest of the replay queue is dropped.
    fn take_replay(&mut self, kind: impl Fn(&IoToken) -> bool) -> Option<IoToken> {
        let front = self.replay.pop_front()?;
        if kind(&front) {
            return Some(front);
        }
        tracing::warn!(channel = %self.name, dropped = self.replay.len() + 1, "discarding replayed input of a different kind");
        self.replay.clear();
        None
    }
}
impl std::fmt::Debug for ChannelSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSlot")
            .field("name", &self.name)
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}

/// The IO channels of a machine.
///
/// Input that was read by a microinstruction that was later backed up
/// is replayed before any new input is requested from the channel.
#[derive(Debug, Default)]
pub struct Channels {
    slots: Vec<ChannelSlot>
}
impl Channels {
    pub(crate) fn add(&mut self, name: String, device: Box<dyn IoChannel>) -> ChannelId {
        self.slots.push(ChannelSlot { name, device, replay: VecDeque::new() });
        ChannelId(self.slots.len() - 1)
    }
    pub(crate) fn contains(&self, id: ChannelId) -> bool {
        id.0 < self.slots.len()
    }

    /// The number of channels.
    pub fn len(&self) -> usize {
        self.slots.len()
    }
    /// Whether there are no channels.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
    /// The name of a channel.
    pub fn name(&self, id: ChannelId) -> Option<&str> {
        self.slots.get(id.0).map(|s| &*s.name)
    }
    /// Looks up a channel by name.
    pub fn by_name(&self, name: &str) -> Option<ChannelId> {
        self.slots.iter().position(|s| s.name == name).map(ChannelId)
    }
    /// Gets a channel's device.
    pub fn device_mut(&mut self, id: ChannelId) -> Option<&mut (dyn IoChannel + 'static)> {
        self.slots.get_mut(id.0).map(|s| s.device.as_mut())
    }

    pub(crate) fn read_integer(&mut self, id: ChannelId) -> Result<i64, InputErr> {
        let slot = self.slots.get_mut(id.0).ok_or(InputErr::Closed)?;
        match slot.take_replay(|t| matches!(t, IoToken::Integer(_))) {
            Some(IoToken::Integer(n)) => Ok(n),
            _ => slot.device.read_integer()
        }
    }
    pub(crate) fn read_char(&mut self, id: ChannelId) -> Result<char, InputErr> {
        let slot = self.slots.get_mut(id.0).ok_or(InputErr::Closed)?;
        match slot.take_replay(|t| matches!(t, IoToken::Char(_))) {
            Some(IoToken::Char(c)) => Ok(c),
            _ => slot.device.read_char()
        }
    }
    pub(crate) fn write_integer(&mut self, id: ChannelId, value: i64) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.device.write_integer(value);
        }
    }
    pub(crate) fn write_char(&mut self, id: ChannelId, c: char) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.device.write_char(c);
        }
    }
    /// Puts a value back in front of a channel's input.
    pub(crate) fn unread(&mut self, id: ChannelId, token: IoToken) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.replay.push_front(token);
        }
    }

    /// Resets every channel, discarding pending and replayed input.
    pub fn reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.replay.clear();
            slot.device.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(text: &str) -> Vec<Result<i64, InputErr>> {
        let mut text = text.to_string();
        std::iter::from_fn(|| take_integer(&mut text)).collect()
    }

    #[test]
    fn test_integer_tokens() {
        assert_eq!(lex_all("1 -2 +3\t0x10 0b11 -0b1"), [Ok(1), Ok(-2), Ok(3), Ok(16), Ok(3), Ok(-1)]);
        assert_eq!(lex_all("9223372036854775807 -9223372036854775808"), [Ok(i64::MAX), Ok(i64::MIN)]);
        assert_eq!(lex_all("9223372036854775808"), [Err(InputErr::DoesNotFit)]);
        assert_eq!(lex_all("12ab"), [Err(InputErr::InvalidInteger)]);
        assert_eq!(lex_all("0x"), [Err(InputErr::EmptyDigits)]);
        assert_eq!(lex_all("0b102"), [Err(InputErr::InvalidInteger)]);
        assert_eq!(lex_all("   \n"), []);
    }

    #[test]
    fn test_buffered_chars() {
        let mut chan = BufferedChannel::new();
        chan.push_input("aé");
        assert_eq!(chan.read_char(), Ok('a'));
        assert_eq!(chan.read_char(), Ok('é'));
        assert_eq!(chan.read_char(), Err(InputErr::Exhausted));

        chan.push_input("x");
        chan.reset();
        assert_eq!(chan.read_char(), Err(InputErr::Exhausted));
    }

    #[test]
    fn test_replay() {
        let chan = BufferedChannel::new();
        chan.push_input("5 6");

        let mut channels = Channels::default();
        let id = channels.add("console".to_string(), Box::new(chan));
        assert_eq!(channels.by_name("console"), Some(id));

        assert_eq!(channels.read_integer(id), Ok(5));
        channels.unread(id, IoToken::Integer(5));
        assert_eq!(channels.read_integer(id), Ok(5));
        assert_eq!(channels.read_integer(id), Ok(6));

        channels.unread(id, IoToken::Char('q'));
        channels.reset_all();
        assert_eq!(channels.read_char(id), Err(InputErr::Exhausted));
    }

    #[test]
    fn test_replay_of_other_kind_is_dropped() {
        let chan = BufferedChannel::new();
        chan.push_input("x 7");

        let mut channels = Channels::default();
        let id = channels.add("console".to_string(), Box::new(chan));
        channels.unread(id, IoToken::Integer(2));
        channels.unread(id, IoToken::Integer(1));

        // a character read skips the stale integers and goes to the device
        assert_eq!(channels.read_char(id), Ok('x'));
        assert_eq!(channels.read_integer(id), Ok(7));
        assert_eq!(channels.read_integer(id), Err(InputErr::Exhausted));
    }

    #[test]
    fn test_channel_io() {
        let (out_tx, out_rx) = cbc::unbounded();
        let mut lines = vec!["42\n".to_string(), "7".to_string()].into_iter();

        let mut chan = ChannelIo::new(
            move || lines.next().ok_or(Stop),
            move |text| out_tx.send(text).map_err(|_| Stop)
        );
        assert_eq!(chan.read_integer(), Ok(42));
        assert_eq!(chan.read_char(), Ok('\n'));
        assert_eq!(chan.read_integer(), Ok(7));
        assert_eq!(chan.read_integer(), Err(InputErr::Closed));

        chan.write_integer(10);
        chan.write_char('a');
        drop(chan);
        let output: String = out_rx.iter().collect();
        assert_eq!(output, "10\na");
    }
}

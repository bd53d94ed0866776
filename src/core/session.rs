//! Session management
//!
//! A session owns a pty and a screen buffer. A reader thread pulls the
//! child's output, decodes it and applies it to the buffer; everything the
//! owner needs to know about is published as [`SessionEvent`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use super::pty::{self, LaunchCommand, Pty, PtyError};
use super::term::{BufferEvent, CharReader, ScreenBuffer, TerminalCode, TerminalSize, VtParser};
use crate::config::{Environment, Profile};

/// Size of a single read from the pty
const READ_CHUNK: usize = 4096;

/// Variable telling nested shells they run inside the emulator
pub const SESSION_ENV_VAR: &str = "TTERM";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("Session I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Session is closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Connected,
    Errored,
    Closed,
}

impl SessionState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Errored | Self::Closed)
    }
}

#[derive(Clone, Debug)]
pub enum SessionEventKind {
    /// A chunk of output has been applied to the buffer
    OutputReceived,
    TitleChanged(String),
    Bell,
    BufferSizeChanged(TerminalSize),
    /// The read loop ended; carries the read error if there was one
    Finished(Option<Arc<io::Error>>),
}

#[derive(Clone, Debug)]
pub struct SessionEvent {
    pub session: SessionId,
    pub kind: SessionEventKind,
}

/// Incremental decoder from child output bytes to terminal codes.
///
/// Multibyte characters and escape sequences may be split anywhere across
/// chunks; the unfinished tail is carried over to the next call.
#[derive(Default)]
pub struct OutputDecoder {
    utf8_carry: Vec<u8>,
    pending: Vec<char>,
    parser: VtParser,
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Vec<TerminalCode> {
        self.utf8_carry.extend_from_slice(bytes);
        self.decode_utf8();

        let mut reader = CharReader::new(&self.pending);
        let codes = self.parser.parse(&mut reader);
        let consumed = reader.offset();
        self.pending.drain(..consumed);
        codes
    }

    /// Move every complete character from the byte carry to `pending`
    fn decode_utf8(&mut self) {
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.utf8_carry[start..]) {
                Ok(s) => {
                    self.pending.extend(s.chars());
                    start = self.utf8_carry.len();
                    break;
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    if let Ok(s) = std::str::from_utf8(&self.utf8_carry[start..valid]) {
                        self.pending.extend(s.chars());
                    }
                    match e.error_len() {
                        Some(len) => {
                            self.pending.push(char::REPLACEMENT_CHARACTER);
                            start = valid + len;
                        }
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.utf8_carry.drain(..start);
    }
}

/// State shared with the reader thread
struct Shared {
    state: Mutex<SessionState>,
    title: Mutex<String>,
    error: Mutex<Option<Arc<io::Error>>>,
    closing: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A shell session
pub struct Session {
    id: SessionId,
    buffer: Arc<Mutex<ScreenBuffer>>,
    pty: Box<dyn Pty>,
    writer: Box<dyn Write + Send>,
    shared: Arc<Shared>,
    events: Sender<SessionEvent>,
    reader_thread: Option<JoinHandle<()>>,
}

impl Session {
    /// Start `launch` in a native pty
    pub fn spawn(
        id: SessionId,
        size: TerminalSize,
        launch: &LaunchCommand,
        events: Sender<SessionEvent>,
    ) -> Result<Self, SessionError> {
        let pty = pty::spawn(size, launch)?;
        Self::with_pty(id, size, pty, events)
    }

    /// Run a session over an already started pty
    pub fn with_pty(
        id: SessionId,
        size: TerminalSize,
        mut pty: Box<dyn Pty>,
        events: Sender<SessionEvent>,
    ) -> Result<Self, SessionError> {
        let reader = pty.take_reader()?;
        let writer = pty.take_writer()?;

        let buffer = Arc::new(Mutex::new(ScreenBuffer::new(size)));
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Starting),
            title: Mutex::new(String::new()),
            error: Mutex::new(None),
            closing: AtomicBool::new(false),
        });

        let pump = OutputPump {
            id,
            reader,
            decoder: OutputDecoder::new(),
            buffer: buffer.clone(),
            shared: shared.clone(),
            events: events.clone(),
        };

        *lock(&shared.state) = SessionState::Connected;
        let reader_thread = thread::Builder::new()
            .name(format!("session-{}-reader", id.0))
            .spawn(move || pump.run());

        let reader_thread = match reader_thread {
            Ok(handle) => handle,
            Err(e) => {
                *lock(&shared.state) = SessionState::Errored;
                pty.close();
                return Err(e.into());
            }
        };

        tracing::info!("Session {} started ({})", id, size);

        Ok(Self {
            id,
            buffer,
            pty,
            writer,
            shared,
            events,
            reader_thread: Some(reader_thread),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Shared handle to the screen buffer
    pub fn buffer(&self) -> &Arc<Mutex<ScreenBuffer>> {
        &self.buffer
    }

    /// Lock the screen buffer. The reader thread is held off until the
    /// guard is dropped.
    pub fn lock_buffer(&self) -> MutexGuard<'_, ScreenBuffer> {
        lock(&self.buffer)
    }

    pub fn size(&self) -> TerminalSize {
        self.lock_buffer().size()
    }

    /// Resize the pty and the buffer together
    pub fn resize(&mut self, size: TerminalSize) -> Result<(), SessionError> {
        {
            let mut buffer = lock(&self.buffer);
            if buffer.size() == size {
                return Ok(());
            }
            self.pty.resize(size)?;
            buffer.resize(size);
        }
        tracing::debug!("Session {} resized to {}", self.id, size);
        self.emit(SessionEventKind::BufferSizeChanged(size));
        Ok(())
    }

    /// Send text to the child's input
    pub fn write(&mut self, text: &str) -> Result<(), SessionError> {
        self.write_bytes(text.as_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn title(&self) -> String {
        lock(&self.shared.title).clone()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// The read error that ended an errored session
    pub fn error(&self) -> Option<Arc<io::Error>> {
        lock(&self.shared.error).clone()
    }

    /// Stop the session: close the pty and wait for the reader thread
    pub fn close(&mut self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Closing session {}", self.id);

        self.pty.close();
        if let Some(handle) = self.reader_thread.take() {
            if handle.join().is_err() {
                tracing::error!("Reader thread of session {} panicked", self.id);
            }
        }
    }

    fn emit(&self, kind: SessionEventKind) {
        let _ = self.events.send(SessionEvent {
            session: self.id,
            kind,
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader-thread half of a session
struct OutputPump {
    id: SessionId,
    reader: Box<dyn Read + Send>,
    decoder: OutputDecoder,
    buffer: Arc<Mutex<ScreenBuffer>>,
    shared: Arc<Shared>,
    events: Sender<SessionEvent>,
}

impl OutputPump {
    fn run(mut self) {
        let mut chunk = vec![0u8; READ_CHUNK];
        let result = loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => break Ok(()),
                Ok(n) => self.receive(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.finish(result);
    }

    fn receive(&mut self, bytes: &[u8]) {
        let codes = self.decoder.decode(bytes);
        tracing::trace!("Session {}: {} bytes, {} codes", self.id, bytes.len(), codes.len());

        let mut effects = Vec::new();
        {
            let mut buffer = lock(&self.buffer);
            for code in codes {
                if let Some(effect) = buffer.apply(code) {
                    effects.push(effect);
                }
            }
        }

        for effect in effects {
            match effect {
                BufferEvent::Bell => self.emit(SessionEventKind::Bell),
                BufferEvent::TitleChanged(title) => {
                    *lock(&self.shared.title) = title.clone();
                    self.emit(SessionEventKind::TitleChanged(title));
                }
            }
        }
        self.emit(SessionEventKind::OutputReceived);
    }

    fn finish(&self, result: io::Result<()>) {
        let error = match result {
            Ok(()) => None,
            Err(e) if self.shared.closing.load(Ordering::SeqCst) => {
                tracing::debug!("Session {} read ended during close: {}", self.id, e);
                None
            }
            Err(e) => Some(Arc::new(e)),
        };

        let state = match &error {
            None => {
                tracing::info!("Session {} closed", self.id);
                SessionState::Closed
            }
            Some(e) => {
                tracing::warn!("Session {} failed: {}", self.id, e);
                SessionState::Errored
            }
        };

        *lock(&self.shared.error) = error.clone();
        *lock(&self.shared.state) = state;
        self.emit(SessionEventKind::Finished(error));
    }

    fn emit(&self, kind: SessionEventKind) {
        let _ = self.events.send(SessionEvent {
            session: self.id,
            kind,
        });
    }
}

/// Keeps track of the live sessions and collects their events
pub struct SessionManager {
    sessions: BTreeMap<SessionId, Session>,
    next_id: u64,
    environment: Environment,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl SessionManager {
    /// `environment` is the snapshot profiles are expanded against
    pub fn new(environment: Environment) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            sessions: BTreeMap::new(),
            next_id: 1,
            environment,
            events_tx,
            events_rx,
        }
    }

    fn allocate_id(&mut self) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Resolve `profile` and start it in a native pty
    pub fn create_session(
        &mut self,
        size: TerminalSize,
        profile: &Profile,
    ) -> Result<SessionId, SessionError> {
        let mut launch = profile.expand(&self.environment);
        launch
            .environment
            .set(SESSION_ENV_VAR, std::process::id().to_string());

        let id = self.allocate_id();
        let session = Session::spawn(id, size, &launch, self.events_tx.clone())?;
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Track a session over an already started pty
    pub fn adopt(&mut self, size: TerminalSize, pty: Box<dyn Pty>) -> Result<SessionId, SessionError> {
        let id = self.allocate_id();
        let session = Session::with_pty(id, size, pty, self.events_tx.clone())?;
        self.sessions.insert(id, session);
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Live session ids, oldest first
    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drain pending events without blocking
    pub fn poll_events(&mut self) -> Vec<SessionEvent> {
        let events: Vec<_> = self.events_rx.try_iter().collect();
        self.retire_finished(&events);
        events
    }

    /// Wait up to `timeout` for the first event, then drain the rest
    pub fn wait_events(&mut self, timeout: Duration) -> Vec<SessionEvent> {
        let mut events = match self.events_rx.recv_timeout(timeout) {
            Ok(event) => vec![event],
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Vec::new(),
        };
        events.extend(self.events_rx.try_iter());
        self.retire_finished(&events);
        events
    }

    fn retire_finished(&mut self, events: &[SessionEvent]) {
        for event in events {
            if let SessionEventKind::Finished(_) = event.kind {
                if self.sessions.remove(&event.session).is_some() {
                    tracing::info!("Session {} removed", event.session);
                }
            }
        }
    }

    /// Close every session
    pub fn close_all(&mut self) {
        for session in self.sessions.values_mut() {
            session.close();
        }
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Message {
        Chunk(Vec<u8>),
        HangUp,
        Fail,
    }

    /// Pty fed from a channel; input is discarded
    struct FakePty {
        feed: Sender<Message>,
        reader: Option<FakeReader>,
    }

    struct FakeReader {
        rx: Receiver<Message>,
    }

    impl Read for FakeReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.rx.recv() {
                Ok(Message::Chunk(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Ok(Message::Fail) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
                Ok(Message::HangUp) | Err(_) => Ok(0),
            }
        }
    }

    impl Pty for FakePty {
        fn take_reader(&mut self) -> pty::Result<Box<dyn Read + Send>> {
            match self.reader.take() {
                Some(reader) => Ok(Box::new(reader)),
                None => Err(PtyError::AlreadyTaken("reader")),
            }
        }

        fn take_writer(&mut self) -> pty::Result<Box<dyn Write + Send>> {
            Ok(Box::new(io::sink()))
        }

        fn resize(&mut self, _size: TerminalSize) -> pty::Result<()> {
            Ok(())
        }

        fn close(&mut self) {
            let _ = self.feed.send(Message::HangUp);
        }
    }

    fn fake_pty() -> (Box<dyn Pty>, Sender<Message>) {
        let (tx, rx) = mpsc::channel();
        let pty = FakePty {
            feed: tx.clone(),
            reader: Some(FakeReader { rx }),
        };
        (Box::new(pty), tx)
    }

    fn wait_finished(rx: &Receiver<SessionEvent>) -> Vec<SessionEventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            let done = matches!(event.kind, SessionEventKind::Finished(_));
            kinds.push(event.kind);
            if done {
                break;
            }
        }
        kinds
    }

    #[test]
    fn test_decoder_carries_split_utf8() {
        let mut decoder = OutputDecoder::new();
        let bytes = "añ€😀".as_bytes();

        let mut text = String::new();
        for byte in bytes {
            for code in decoder.decode(std::slice::from_ref(byte)) {
                if let TerminalCode::Text(s) = code {
                    text.push_str(&s);
                }
            }
        }
        assert_eq!(text, "añ€😀");
    }

    #[test]
    fn test_decoder_carries_split_sequence() {
        let mut decoder = OutputDecoder::new();
        assert!(decoder.decode(b"\x1b[3").is_empty());
        assert_eq!(
            decoder.decode(b"1mred"),
            vec![
                TerminalCode::SetGraphicsMode(vec![31]),
                TerminalCode::Text("red".to_string()),
            ]
        );
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(
            decoder.decode(b"a\xffb"),
            vec![TerminalCode::Text("a\u{fffd}b".to_string())]
        );
    }

    #[test]
    fn test_session_applies_output_and_finishes_once() {
        let (pty, feed) = fake_pty();
        let (tx, rx) = mpsc::channel();
        let mut session =
            Session::with_pty(SessionId(7), TerminalSize::new(20, 4), pty, tx).unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        feed.send(Message::Chunk(b"\x1b]0;shell\x07hi\x07".to_vec())).unwrap();
        feed.send(Message::HangUp).unwrap();

        let kinds = wait_finished(&rx);
        assert!(matches!(kinds[0], SessionEventKind::TitleChanged(ref t) if t == "shell"));
        assert!(matches!(kinds[1], SessionEventKind::Bell));
        assert!(matches!(kinds[2], SessionEventKind::OutputReceived));
        assert!(matches!(kinds[3], SessionEventKind::Finished(None)));

        assert_eq!(session.title(), "shell");
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.lock_buffer().line_text(0, 0, 2).unwrap(), "hi");

        session.close();
        session.close();
        assert!(rx.try_recv().is_err());
        assert!(matches!(session.write("x"), Err(SessionError::Closed)));
    }

    #[test]
    fn test_read_error_marks_session_errored() {
        let (pty, feed) = fake_pty();
        let (tx, rx) = mpsc::channel();
        let session = Session::with_pty(SessionId(1), TerminalSize::default(), pty, tx).unwrap();

        feed.send(Message::Fail).unwrap();
        let kinds = wait_finished(&rx);
        match kinds.last() {
            Some(SessionEventKind::Finished(Some(e))) => {
                assert_eq!(e.kind(), io::ErrorKind::BrokenPipe)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Errored);
        assert!(session.error().is_some());
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (pty, _feed) = fake_pty();
        let (tx, rx) = mpsc::channel();
        let mut session = Session::with_pty(SessionId(1), TerminalSize::default(), pty, tx).unwrap();

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        let kinds: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds.len(), 1);
        assert!(matches!(kinds[0], SessionEventKind::Finished(None)));
    }

    #[test]
    fn test_resize_emits_size_change() {
        let (pty, _feed) = fake_pty();
        let (tx, rx) = mpsc::channel();
        let mut session = Session::with_pty(SessionId(1), TerminalSize::default(), pty, tx).unwrap();

        session.resize(TerminalSize::default()).unwrap();
        session.resize(TerminalSize::new(100, 30)).unwrap();
        assert_eq!(session.size(), TerminalSize::new(100, 30));

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.session, SessionId(1));
        assert!(matches!(
            event.kind,
            SessionEventKind::BufferSizeChanged(size) if size == TerminalSize::new(100, 30)
        ));
    }

    #[test]
    fn test_manager_retires_finished_sessions() {
        let mut manager = SessionManager::new(Environment::new());
        let (pty_a, feed_a) = fake_pty();
        let (pty_b, _feed_b) = fake_pty();
        let a = manager.adopt(TerminalSize::default(), pty_a).unwrap();
        let b = manager.adopt(TerminalSize::default(), pty_b).unwrap();
        assert_eq!(manager.sessions(), vec![a, b]);

        feed_a.send(Message::HangUp).unwrap();
        let mut finished = false;
        for _ in 0..50 {
            let events = manager.wait_events(Duration::from_millis(100));
            if events
                .iter()
                .any(|e| e.session == a && matches!(e.kind, SessionEventKind::Finished(_)))
            {
                finished = true;
                break;
            }
        }
        assert!(finished);
        assert_eq!(manager.sessions(), vec![b]);
        assert!(manager.get(a).is_none());
        assert!(manager.get(b).is_some());

        manager.close_all();
        assert!(manager.is_empty());
    }
}

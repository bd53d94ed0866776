//! Sessions driven end to end through an in-memory pty.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tterm::core::pty::{self, Pty, PtyError};
use tterm::core::session::OutputDecoder;
use tterm::core::term::{ColourId, ScreenBuffer, TerminalCode};
use tterm::{
    Environment, Session, SessionEvent, SessionEventKind, SessionId, SessionManager,
    SessionState, TerminalSize,
};

enum Feed {
    Chunk(Vec<u8>),
    HangUp,
    Fail,
}

struct MemoryPty {
    feed: Sender<Feed>,
    reader: Option<MemoryReader>,
    written: Sender<Vec<u8>>,
}

struct MemoryReader(Receiver<Feed>);

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.recv() {
            Ok(Feed::Chunk(bytes)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Ok(Feed::Fail) => Err(io::Error::new(io::ErrorKind::ConnectionReset, "child vanished")),
            Ok(Feed::HangUp) | Err(_) => Ok(0),
        }
    }
}

struct MemoryWriter(Sender<Vec<u8>>);

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.0.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Pty for MemoryPty {
    fn take_reader(&mut self) -> pty::Result<Box<dyn Read + Send>> {
        match self.reader.take() {
            Some(reader) => Ok(Box::new(reader)),
            None => Err(PtyError::AlreadyTaken("reader")),
        }
    }

    fn take_writer(&mut self) -> pty::Result<Box<dyn Write + Send>> {
        Ok(Box::new(MemoryWriter(self.written.clone())))
    }

    fn resize(&mut self, _size: TerminalSize) -> pty::Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.feed.send(Feed::HangUp);
    }
}

/// A pty plus the handles to feed its output and observe its input
fn memory_pty() -> (Box<dyn Pty>, Sender<Feed>, Receiver<Vec<u8>>) {
    let (feed, output) = mpsc::channel();
    let (written, input) = mpsc::channel();
    let pty = MemoryPty {
        feed: feed.clone(),
        reader: Some(MemoryReader(output)),
        written,
    };
    (Box::new(pty), feed, input)
}

fn next_event(rx: &Receiver<SessionEvent>) -> SessionEventKind {
    rx.recv_timeout(Duration::from_secs(10))
        .expect("session event")
        .kind
}

fn until_finished(rx: &Receiver<SessionEvent>) -> Vec<SessionEventKind> {
    let mut kinds = Vec::new();
    loop {
        let kind = next_event(rx);
        let done = matches!(kind, SessionEventKind::Finished(_));
        kinds.push(kind);
        if done {
            return kinds;
        }
    }
}

fn apply_all(buffer: &mut ScreenBuffer, codes: Vec<TerminalCode>) {
    for code in codes {
        buffer.apply(code);
    }
}

#[test]
fn hello_world_lands_on_two_rows() {
    let (pty, feed, _input) = memory_pty();
    let (tx, rx) = mpsc::channel();
    let session = Session::with_pty(SessionId(1), TerminalSize::new(80, 24), pty, tx).unwrap();

    feed.send(Feed::Chunk(b"hello\r\nworld".to_vec())).unwrap();
    assert!(matches!(next_event(&rx), SessionEventKind::OutputReceived));

    let buffer = session.lock_buffer();
    let first = buffer.formatted_line(0);
    assert_eq!(first.len(), 1);
    assert_eq!(first.text(), format!("{:<80}", "hello"));
    assert!(buffer.formatted_line(1).text().starts_with("world"));
    assert_eq!((buffer.cursor_x(), buffer.cursor_y()), (5, 1));
}

#[test]
fn colour_runs_split_into_tags() {
    let (pty, feed, _input) = memory_pty();
    let (tx, rx) = mpsc::channel();
    let session = Session::with_pty(SessionId(1), TerminalSize::new(80, 24), pty, tx).unwrap();

    feed.send(Feed::Chunk(b"\x1b[31mred\x1b[0mplain".to_vec())).unwrap();
    assert!(matches!(next_event(&rx), SessionEventKind::OutputReceived));

    let mut buffer = session.lock_buffer();
    buffer.show_cursor = false;
    let line = buffer.formatted_line(0);
    let tags = line.as_slice();
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[0].text, "red");
    assert_eq!(tags[0].attrs.foreground, ColourId(1));
    assert!(tags[1].text.starts_with("plain"));
    assert_eq!(tags[1].attrs.foreground, ColourId::DEFAULT);
}

#[test]
fn sequences_split_across_chunks_are_reassembled() {
    let (pty, feed, _input) = memory_pty();
    let (tx, rx) = mpsc::channel();
    let session = Session::with_pty(SessionId(1), TerminalSize::new(20, 4), pty, tx).unwrap();

    // ESC [ 3 2 m, then "é" split between its two bytes
    for chunk in [&b"\x1b["[..], b"32", b"mcaf\xc3", b"\xa9"] {
        feed.send(Feed::Chunk(chunk.to_vec())).unwrap();
    }
    feed.send(Feed::HangUp).unwrap();
    let kinds = until_finished(&rx);
    assert_eq!(kinds.len(), 5);

    let buffer = session.lock_buffer();
    assert_eq!(buffer.line_text(0, 0, 4).unwrap(), "café");
    assert_eq!(buffer.current_attrs.foreground, ColourId(2));
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn decoder_output_matches_unsplit_input() {
    let input = "\x1b[1;34mbold blue\x1b[0m\r\n\x1b]0;title\x07\x1b[2Jdone ✓".as_bytes();

    let mut whole = ScreenBuffer::new(TerminalSize::new(30, 5));
    apply_all(&mut whole, OutputDecoder::new().decode(input));

    for split in 1..input.len() {
        let mut decoder = OutputDecoder::new();
        let mut pieces = ScreenBuffer::new(TerminalSize::new(30, 5));
        apply_all(&mut pieces, decoder.decode(&input[..split]));
        apply_all(&mut pieces, decoder.decode(&input[split..]));

        for y in 0..5 {
            assert_eq!(pieces.formatted_line(y), whole.formatted_line(y), "split at {}", split);
        }
    }
}

#[test]
fn concurrent_output_never_exposes_torn_rows() {
    const CHUNKS: usize = 10_000;
    let size = TerminalSize::new(40, 5);

    let (pty, feed, input) = memory_pty();
    let (tx, rx) = mpsc::channel();
    let mut session = Session::with_pty(SessionId(1), size, pty, tx).unwrap();
    session.lock_buffer().show_cursor = false;

    let stop = Arc::new(AtomicBool::new(false));
    let snapshots = {
        let buffer = Arc::clone(session.buffer());
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut taken = 0usize;
            while !stop.load(Ordering::SeqCst) {
                let line = buffer.lock().unwrap().formatted_line(0);
                assert_eq!(line.len(), 1);
                let text = line.text();
                let first = text.chars().next().unwrap();
                assert!(text.chars().all(|c| c == first), "torn row {:?}", text);
                taken += 1;
            }
            taken
        })
    };

    let producer = thread::spawn(move || {
        for i in 0..CHUNKS {
            let letter = char::from(b'a' + (i % 26) as u8);
            let mut chunk = b"\x1b[H".to_vec();
            chunk.extend(std::iter::repeat(letter as u8).take(40));
            feed.send(Feed::Chunk(chunk)).unwrap();
        }
        feed.send(Feed::HangUp).unwrap();
    });

    for _ in 0..100 {
        session.write("ls\r").unwrap();
    }

    let kinds = until_finished(&rx);
    producer.join().unwrap();
    stop.store(true, Ordering::SeqCst);
    assert!(snapshots.join().unwrap() > 0);

    let outputs = kinds
        .iter()
        .filter(|kind| matches!(kind, SessionEventKind::OutputReceived))
        .count();
    assert_eq!(outputs, CHUNKS);
    assert!(matches!(kinds.last(), Some(SessionEventKind::Finished(None))));

    let sent: Vec<u8> = input.try_iter().flatten().collect();
    assert_eq!(sent, b"ls\r".repeat(100));

    let expected = char::from(b'a' + ((CHUNKS - 1) % 26) as u8);
    assert_eq!(
        session.lock_buffer().line_text(0, 0, 40).unwrap(),
        expected.to_string().repeat(40)
    );
}

#[test]
fn read_failure_finishes_with_error() {
    let (pty, feed, _input) = memory_pty();
    let (tx, rx) = mpsc::channel();
    let session = Session::with_pty(SessionId(3), TerminalSize::default(), pty, tx).unwrap();

    feed.send(Feed::Chunk(b"partial".to_vec())).unwrap();
    feed.send(Feed::Fail).unwrap();

    let kinds = until_finished(&rx);
    match kinds.last() {
        Some(SessionEventKind::Finished(Some(e))) => {
            assert_eq!(e.kind(), io::ErrorKind::ConnectionReset)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Errored);
    assert_eq!(session.lock_buffer().line_text(0, 0, 7).unwrap(), "partial");
}

#[test]
fn manager_retires_finished_sessions() {
    let mut manager = SessionManager::new(Environment::new());
    let (first_pty, first_feed, _first_input) = memory_pty();
    let (second_pty, _second_feed, _second_input) = memory_pty();

    let first = manager.adopt(TerminalSize::new(20, 4), first_pty).unwrap();
    let second = manager.adopt(TerminalSize::new(20, 4), second_pty).unwrap();
    assert_ne!(first, second);
    assert_eq!(manager.sessions(), vec![first, second]);

    let buffer = Arc::clone(manager.get(first).unwrap().buffer());
    first_feed.send(Feed::Chunk(b"bye".to_vec())).unwrap();
    first_feed.send(Feed::HangUp).unwrap();

    let mut seen = Vec::new();
    while !seen
        .iter()
        .any(|e: &SessionEvent| matches!(e.kind, SessionEventKind::Finished(_)))
    {
        let events = manager.wait_events(Duration::from_secs(10));
        assert!(!events.is_empty(), "no events before timeout");
        seen.extend(events);
    }

    assert!(seen.iter().all(|e| e.session == first));
    assert!(manager.get(first).is_none());
    assert_eq!(manager.sessions(), vec![second]);
    assert_eq!(buffer.lock().unwrap().line_text(0, 0, 3).unwrap(), "bye");

    manager.close_all();
    assert!(manager.is_empty());
}

#[test]
#[cfg(not(windows))]
fn close_returns_while_background_job_holds_terminal() {
    use std::time::Instant;
    use tterm::core::pty::LaunchCommand;

    let launch = LaunchCommand {
        program: "/bin/sh".to_string(),
        arguments: vec![
            "-c".to_string(),
            "trap '' HUP; sleep 30 & echo started; sleep 30".to_string(),
        ],
        working_directory: None,
        environment: Environment::from_os(),
    };
    let (tx, rx) = mpsc::channel();
    let mut session = Session::spawn(SessionId(1), TerminalSize::new(40, 5), &launch, tx).unwrap();

    while session.lock_buffer().line_text(0, 0, 7).unwrap() != "started" {
        assert!(matches!(next_event(&rx), SessionEventKind::OutputReceived));
    }

    let started = Instant::now();
    session.close();
    assert!(started.elapsed() < Duration::from_secs(5), "close took {:?}", started.elapsed());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(until_finished(&rx).last(), Some(SessionEventKind::Finished(None))));
}

//! Local terminal plumbing: raw mode, key encoding, and the render loop.

use std::io::{self, Write};

use bytes::Bytes;
use crossterm::event::{
    self, DisableBracketedPaste, EnableBracketedPaste, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

use porthole_core::exec::Geometry;
use porthole_core::reconnect::{TabCommand, TabEvent};

/// The local terminal size, or the classic default when it cannot be read.
pub fn current_geometry() -> Geometry {
    match crossterm::terminal::size() {
        Ok((cols, rows)) => Geometry::new(cols, rows),
        Err(_) => Geometry::default(),
    }
}

/// Holds the terminal in raw mode with bracketed paste for its lifetime.
pub struct RawGuard;

impl RawGuard {
    pub fn new() -> io::Result<Self> {
        enable_raw_mode()?;
        execute!(io::stdout(), EnableBracketedPaste)?;
        Ok(Self)
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        let _ = execute!(io::stdout(), DisableBracketedPaste);
        let _ = disable_raw_mode();
    }
}

/// Detach is Ctrl-], the escape telnet users already know.
fn is_detach(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char(']')
}

/// Reads terminal events on a dedicated thread and forwards them as tab
/// commands. Ends when the user detaches or the tab hangs up.
pub fn spawn_input_thread(commands: UnboundedSender<TabCommand>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        let event = match event::read() {
            Ok(event) => event,
            Err(err) => {
                debug!("input read failed: {}", err);
                let _ = commands.send(TabCommand::Close);
                break;
            }
        };
        match event {
            Event::Key(key) => {
                if key.kind == KeyEventKind::Release {
                    continue;
                }
                if is_detach(&key) {
                    let _ = commands.send(TabCommand::Close);
                    break;
                }
                if let Some(bytes) = encode_key(key) {
                    if commands
                        .send(TabCommand::Input(Bytes::from(bytes)))
                        .is_err()
                    {
                        break;
                    }
                }
            }
            Event::Paste(text) => {
                if commands.send(TabCommand::Paste(text)).is_err() {
                    break;
                }
            }
            Event::Resize(cols, rows) => {
                if commands
                    .send(TabCommand::Resize(Geometry::new(cols, rows)))
                    .is_err()
                {
                    break;
                }
            }
            _ => {}
        }
    })
}

/// Maps a key press to the bytes a terminal puts on the wire.
fn encode_key(key: KeyEvent) -> Option<Vec<u8>> {
    match key.code {
        KeyCode::Char(c) => {
            let mut bytes = Vec::new();
            if key.modifiers.contains(KeyModifiers::ALT) {
                bytes.push(0x1b);
            }
            if key.modifiers.contains(KeyModifiers::CONTROL) {
                let lower = c.to_ascii_lowercase();
                if ('a'..='z').contains(&lower) {
                    bytes.push((lower as u8 - b'a') + 1);
                } else {
                    return None;
                }
            } else {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            Some(bytes)
        }
        KeyCode::Enter => Some(vec![b'\r']),
        KeyCode::Tab => Some(vec![b'\t']),
        KeyCode::Backspace => Some(vec![0x7f]),
        KeyCode::Esc => Some(vec![0x1b]),
        KeyCode::Up => Some(b"\x1b[A".to_vec()),
        KeyCode::Down => Some(b"\x1b[B".to_vec()),
        KeyCode::Right => Some(b"\x1b[C".to_vec()),
        KeyCode::Left => Some(b"\x1b[D".to_vec()),
        KeyCode::Home => Some(b"\x1b[H".to_vec()),
        KeyCode::End => Some(b"\x1b[F".to_vec()),
        KeyCode::PageUp => Some(b"\x1b[5~".to_vec()),
        KeyCode::PageDown => Some(b"\x1b[6~".to_vec()),
        KeyCode::Delete => Some(b"\x1b[3~".to_vec()),
        KeyCode::Insert => Some(b"\x1b[2~".to_vec()),
        _ => None,
    }
}

/// Writes remote output to the local terminal and narrates connection
/// state changes between sessions.
pub async fn render_loop(
    mut output: UnboundedReceiver<Bytes>,
    mut events: UnboundedReceiver<TabEvent>,
) {
    let mut stdout = io::stdout();
    let mut output_done = false;
    let mut events_done = false;
    while !(output_done && events_done) {
        tokio::select! {
            chunk = output.recv(), if !output_done => match chunk {
                Some(chunk) => {
                    let _ = stdout.write_all(&chunk);
                    let _ = stdout.flush();
                }
                None => output_done = true,
            },
            event = events.recv(), if !events_done => match event {
                Some(event) => status_line(&mut stdout, &describe(&event)),
                None => events_done = true,
            },
        }
    }
}

fn describe(event: &TabEvent) -> String {
    match event {
        TabEvent::Connected => "connected".to_string(),
        TabEvent::Reconnecting {
            attempt,
            max_attempts,
            delay,
        } => format!("connection lost, retry {attempt}/{max_attempts} in {delay:?}"),
        TabEvent::Exhausted => "connection lost for good".to_string(),
    }
}

/// Raw mode means we draw our own line breaks.
fn status_line(stdout: &mut impl Write, message: &str) {
    let _ = write!(stdout, "\r\n[porthole] {message}\r\n");
    let _ = stdout.flush();
}

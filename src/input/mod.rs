// SPDX-License-Identifier: GPL-3.0-only

//! Keyboard control over a raw terminal.

use rustix::termios::{self, LocalModes, OptionalActions, SpecialCodeIndex, Termios};
use std::{
    io,
    os::fd::{AsFd, BorrowedFd},
};
use tracing::{debug, warn};

use crate::keystone::{Corner, Direction, KeystoneCommand};

const ESC: u8 = 0x1b;
const CTRL_C: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Keystone(KeystoneCommand),
    SaveKeystone,
    LoadKeystone,
    TogglePause,
    Quit,
}

fn key_action(key: u8) -> Option<Action> {
    let command = match key.to_ascii_lowercase() {
        b'w' => KeystoneCommand::Move(Direction::Up),
        b's' => KeystoneCommand::Move(Direction::Down),
        b'a' => KeystoneCommand::Move(Direction::Left),
        b'd' => KeystoneCommand::Move(Direction::Right),
        b'1'..=b'4' => KeystoneCommand::Select(Corner::from_index((key - b'1') as usize)?),
        b'k' => KeystoneCommand::Toggle,
        b'+' | b'=' => KeystoneCommand::IncreaseStep,
        b'-' | b'_' => KeystoneCommand::DecreaseStep,
        b'r' => KeystoneCommand::Reset,
        b'b' => KeystoneCommand::ToggleBorder,
        b'[' => KeystoneCommand::NarrowBorder,
        b']' => KeystoneCommand::WidenBorder,
        b'm' => KeystoneCommand::ToggleMarkers,
        b'p' => return Some(Action::SaveKeystone),
        b'l' => return Some(Action::LoadKeystone),
        b' ' => return Some(Action::TogglePause),
        b'q' | CTRL_C => return Some(Action::Quit),
        _ => return None,
    };
    Some(Action::Keystone(command))
}

/// Translates bytes read from the terminal into actions.
///
/// Escape sequences are expected to arrive within a single read, a lone escape quits.
pub fn parse_keys(bytes: &[u8]) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != ESC {
            actions.extend(key_action(bytes[i]));
            i += 1;
            continue;
        }

        match bytes.get(i + 1) {
            Some(b'[') | Some(b'O') => {
                let direction = match bytes.get(i + 2) {
                    Some(b'A') => Some(Direction::Up),
                    Some(b'B') => Some(Direction::Down),
                    Some(b'C') => Some(Direction::Right),
                    Some(b'D') => Some(Direction::Left),
                    _ => None,
                };
                if let Some(direction) = direction {
                    actions.push(Action::Keystone(KeystoneCommand::Move(direction)));
                    i += 3;
                } else {
                    // skip an unknown CSI sequence up to its final byte
                    let end = bytes[i + 2..]
                        .iter()
                        .position(|b| (0x40..=0x7e).contains(b))
                        .map_or(bytes.len(), |pos| i + 2 + pos + 1);
                    debug!(sequence = ?&bytes[i..end], "Ignoring escape sequence.");
                    i = end;
                }
            }
            _ => {
                actions.push(Action::Quit);
                i += 1;
            }
        }
    }
    actions
}

/// Puts a terminal into non-canonical mode without echo, restoring it when dropped.
pub struct RawTerminal<Fd: AsFd> {
    fd: Fd,
    saved: Termios,
}

impl<Fd: AsFd> std::fmt::Debug for RawTerminal<Fd> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTerminal").finish_non_exhaustive()
    }
}

impl<Fd: AsFd> RawTerminal<Fd> {
    /// Returns `Ok(None)` if `fd` is not a terminal.
    pub fn new(fd: Fd) -> io::Result<Option<Self>> {
        if !termios::isatty(&fd) {
            return Ok(None);
        }
        let saved = termios::tcgetattr(&fd)?;
        let mut raw = saved.clone();
        raw.local_modes.remove(LocalModes::ICANON | LocalModes::ECHO);
        // reads return whatever is there, without waiting
        raw.special_codes[SpecialCodeIndex::VMIN] = 0;
        raw.special_codes[SpecialCodeIndex::VTIME] = 0;
        termios::tcsetattr(&fd, OptionalActions::Now, &raw)?;
        Ok(Some(RawTerminal { fd, saved }))
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Reads and translates whatever keys are pending.
    pub fn read_actions(&self) -> io::Result<Vec<Action>> {
        let mut buf = [0u8; 64];
        let read = match rustix::io::read(&self.fd, &mut buf) {
            Ok(read) => read,
            Err(rustix::io::Errno::AGAIN) | Err(rustix::io::Errno::INTR) => 0,
            Err(err) => return Err(err.into()),
        };
        Ok(parse_keys(&buf[..read]))
    }
}

impl<Fd: AsFd> Drop for RawTerminal<Fd> {
    fn drop(&mut self) {
        if let Err(err) = termios::tcsetattr(&self.fd, OptionalActions::Now, &self.saved) {
            warn!(?err, "Failed to restore terminal settings.");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn keystone(command: KeystoneCommand) -> Action {
        Action::Keystone(command)
    }

    #[test]
    fn letters_and_arrows_move_the_corner() {
        assert_eq!(
            parse_keys(b"wA\x1b[D\x1b[C\x1bOB"),
            vec![
                keystone(KeystoneCommand::Move(Direction::Up)),
                keystone(KeystoneCommand::Move(Direction::Left)),
                keystone(KeystoneCommand::Move(Direction::Left)),
                keystone(KeystoneCommand::Move(Direction::Right)),
                keystone(KeystoneCommand::Move(Direction::Down)),
            ]
        );
    }

    #[test]
    fn corner_selection() {
        assert_eq!(
            parse_keys(b"14"),
            vec![
                keystone(KeystoneCommand::Select(Corner::TopLeft)),
                keystone(KeystoneCommand::Select(Corner::BottomRight)),
            ]
        );
        assert!(parse_keys(b"5").is_empty());
    }

    #[test]
    fn command_set() {
        assert_eq!(
            parse_keys(b"k+-rb[]mpl q"),
            vec![
                keystone(KeystoneCommand::Toggle),
                keystone(KeystoneCommand::IncreaseStep),
                keystone(KeystoneCommand::DecreaseStep),
                keystone(KeystoneCommand::Reset),
                keystone(KeystoneCommand::ToggleBorder),
                keystone(KeystoneCommand::NarrowBorder),
                keystone(KeystoneCommand::WidenBorder),
                keystone(KeystoneCommand::ToggleMarkers),
                Action::SaveKeystone,
                Action::LoadKeystone,
                Action::TogglePause,
                Action::Quit,
            ]
        );
    }

    #[test]
    fn escape_handling() {
        assert_eq!(parse_keys(b"\x1b"), vec![Action::Quit]);
        assert_eq!(parse_keys(b"\x03"), vec![Action::Quit]);
        // page up is not bound, and must not leak its final byte as a key press
        assert_eq!(parse_keys(b"\x1b[5~k"), vec![keystone(KeystoneCommand::Toggle)]);
        assert!(parse_keys(b"\x1b[").is_empty());
    }
}

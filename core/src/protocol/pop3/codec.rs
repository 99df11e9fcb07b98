/*
 * codec.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Splintermail, an end-to-end encrypted email service.
 *
 * Splintermail is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Splintermail is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Splintermail.  If not, see <http://www.gnu.org/licenses/>.
 */

//! POP3 dot stuffing (RFC 1939 §3: lines starting with `.` get an extra
//! `.`) and the reverse, with multi-line terminator detection. The codec
//! never parses commands; framing is CRLF lines.

/// Dot-stuff `raw` into `out`. Only complete lines are consumed; when
/// `finish` is false a trailing partial line stays in `raw` for the next
/// call, so every call starts at a line boundary.
pub fn pop3_encode(raw: &mut Vec<u8>, out: &mut Vec<u8>, finish: bool) {
    let end = if finish {
        raw.len()
    } else {
        match raw.iter().rposition(|&b| b == b'\n') {
            Some(i) => i + 1,
            None => 0,
        }
    };
    let mut line_start = true;
    for &b in &raw[..end] {
        if line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        line_start = b == b'\n';
    }
    raw.drain(..end);
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    /// At the beginning of a line (initial state, or just after CRLF).
    LineStart,
    /// Line began with `.`; could be stuffing or the terminator.
    SawDot,
    /// Saw `.` then CR; one more LF makes the terminator.
    SawDotCr,
    /// Mid-line.
    Mid,
    /// Saw CR mid-line, waiting for LF.
    SawCr,
}

/// Streaming dot-unstuffer. Restartable across arbitrary chunk boundaries;
/// the `\r\n.\r\n` terminator is consumed and never emitted.
pub struct Pop3Decoder {
    state: State,
}

impl Pop3Decoder {
    pub fn new() -> Self {
        Self {
            state: State::LineStart,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::LineStart;
    }

    /// Decode `wire` into `out`. Returns (bytes consumed, terminator
    /// found). On terminator, consumption stops just past the final LF;
    /// any following bytes belong to the next exchange.
    pub fn decode(&mut self, wire: &[u8], out: &mut Vec<u8>) -> (usize, bool) {
        for (i, &b) in wire.iter().enumerate() {
            match self.state {
                State::LineStart => {
                    if b == b'.' {
                        self.state = State::SawDot;
                    } else {
                        out.push(b);
                        self.state = if b == b'\r' { State::SawCr } else { State::Mid };
                    }
                }
                State::SawDot => {
                    if b == b'\r' {
                        self.state = State::SawDotCr;
                    } else if b == b'.' {
                        // stuffed line: drop the first dot
                        out.push(b'.');
                        self.state = State::Mid;
                    } else {
                        out.push(b'.');
                        out.push(b);
                        self.state = State::Mid;
                    }
                }
                State::SawDotCr => {
                    if b == b'\n' {
                        self.state = State::LineStart;
                        return (i + 1, true);
                    }
                    out.push(b'.');
                    out.push(b'\r');
                    out.push(b);
                    self.state = if b == b'\r' { State::SawCr } else { State::Mid };
                }
                State::Mid => {
                    out.push(b);
                    if b == b'\r' {
                        self.state = State::SawCr;
                    }
                }
                State::SawCr => {
                    out.push(b);
                    self.state = if b == b'\n' {
                        State::LineStart
                    } else if b == b'\r' {
                        State::SawCr
                    } else {
                        State::Mid
                    };
                }
            }
        }
        (wire.len(), false)
    }
}

impl Default for Pop3Decoder {
    fn default() -> Self {
        Self::new()
    }
}

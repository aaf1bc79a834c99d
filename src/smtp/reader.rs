//-
// Copyright (c) 2024, The Mailsink Authors
//
// This file is part of Mailsink.
//
// Mailsink is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Mailsink is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY  WARRANTY; without  even the  implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailsink. If not, see <http://www.gnu.org/licenses/>.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::support::error::Error;

/// Reads CRLF-terminated lines from the peer stream, enforcing the
/// per-message byte ceiling.
///
/// Lines are returned as raw bytes without the terminator. A lone LF also
/// terminates a line. EOF before a terminator yields whatever was buffered;
/// the next read yields end-of-stream.
pub struct LineReader<R> {
    input: BufReader<R>,
    budget: Option<u64>,
    consumed: u64,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(input: R, budget: Option<u64>) -> Self {
        Self {
            input: BufReader::new(input),
            budget,
            consumed: 0,
        }
    }

    /// Reads the next line, or `None` at end of stream.
    ///
    /// When the cumulative bytes read since the last `reset_budget` would
    /// exceed the ceiling, fails with `Error::SizeExceeded` without
    /// buffering the rest of the oversized input.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut line = Vec::new();

        let n = match self.budget {
            Some(budget) => {
                let allowance = budget.saturating_sub(self.consumed) + 1;
                (&mut self.input)
                    .take(allowance)
                    .read_until(b'\n', &mut line)
                    .await? as u64
            },
            None => self.input.read_until(b'\n', &mut line).await? as u64,
        };

        self.consumed += n;
        if self.budget.is_some_and(|budget| self.consumed > budget) {
            return Err(Error::SizeExceeded);
        }

        if n == 0 {
            return Ok(None);
        }

        if line.ends_with(b"\n") {
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
        }

        Ok(Some(line))
    }

    /// Re-arms the byte ceiling for the next message.
    pub fn reset_budget(&mut self) {
        self.consumed = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn read_all(data: &[u8], budget: Option<u64>) -> Vec<Vec<u8>> {
        let mut reader = LineReader::new(data, budget);
        let mut lines = Vec::new();
        futures::executor::block_on(async {
            while let Some(line) = reader.next_line().await.unwrap() {
                lines.push(line);
            }
        });
        lines
    }

    #[test]
    fn strips_crlf_and_lone_lf() {
        assert_eq!(
            vec![b"foo".to_vec(), b"bar".to_vec(), b"baz".to_vec()],
            read_all(b"foo\r\nbar\nbaz\r\n", None),
        );
    }

    #[test]
    fn preserves_interior_cr() {
        assert_eq!(vec![b"foo\rbar".to_vec()], read_all(b"foo\rbar\r\n", None));
    }

    #[test]
    fn empty_lines_are_returned() {
        assert_eq!(
            vec![b"".to_vec(), b"x".to_vec()],
            read_all(b"\r\nx\r\n", None),
        );
    }

    #[test]
    fn eof_before_terminator_yields_buffered_bytes() {
        assert_eq!(
            vec![b"complete".to_vec(), b"partial".to_vec()],
            read_all(b"complete\r\npartial", None),
        );
    }

    #[test]
    fn budget_exceeded_fails() {
        let mut reader = LineReader::new(&b"0123456789\r\nmore\r\n"[..], Some(8));
        futures::executor::block_on(async {
            assert!(matches!(
                reader.next_line().await,
                Err(Error::SizeExceeded)
            ));
        });
    }

    #[test]
    fn budget_counts_terminators() {
        // "ab\r\n" is four bytes; a budget of three must reject it.
        let mut reader = LineReader::new(&b"ab\r\n"[..], Some(3));
        futures::executor::block_on(async {
            assert!(matches!(
                reader.next_line().await,
                Err(Error::SizeExceeded)
            ));
        });

        let mut reader = LineReader::new(&b"ab\r\n"[..], Some(4));
        futures::executor::block_on(async {
            assert_eq!(
                Some(b"ab".to_vec()),
                reader.next_line().await.unwrap()
            );
        });
    }

    #[test]
    fn reset_budget_rearms_the_ceiling() {
        let mut reader =
            LineReader::new(&b"aaaa\r\nbbbb\r\n"[..], Some(6));
        futures::executor::block_on(async {
            assert_eq!(
                Some(b"aaaa".to_vec()),
                reader.next_line().await.unwrap()
            );
            reader.reset_budget();
            assert_eq!(
                Some(b"bbbb".to_vec()),
                reader.next_line().await.unwrap()
            );
        });
    }

    #[test]
    fn oversized_line_is_not_buffered_whole() {
        // A line far beyond the ceiling must fail as soon as the ceiling is
        // crossed rather than being accumulated in memory first.
        let mut data = vec![b'x'; 1024 * 1024];
        data.extend_from_slice(b"\r\n");
        let mut reader = LineReader::new(&data[..], Some(64));
        futures::executor::block_on(async {
            assert!(matches!(
                reader.next_line().await,
                Err(Error::SizeExceeded)
            ));
        });
    }
}

// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Console front end.
//!
//! Classifies input lines into control commands and generation prompts
//! and feeds the engine queues. `/quit`, `/stop` and `/reset` are the
//! recognized commands; any other non-empty line, slash-prefixed or not,
//! becomes a prompt. Reaching end of input behaves like `/quit` so the
//! engine always gets its shutdown command.

use crate::engine::{Command, Task, TaskKind};
use crate::error::ErrorKind;
use crate::queue::BoundedQueue;

use ii_logging::macros::*;

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Marker printed when a generation request is dropped
pub const QUEUE_FULL_WARNING: &str = "[Warning] Task queue full, dropping request\n";

/// Backoff while the command queue drains; the engine pops commands at
/// least once per token period
const COMMAND_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Classification of one console line
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Line {
    Command(Command),
    Prompt(Vec<u8>),
    Empty,
}

pub fn classify(line: &str) -> Line {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Line::Empty;
    }
    match trimmed {
        "/quit" => Line::Command(Command::Shutdown),
        "/stop" => Line::Command(Command::Stop),
        "/reset" => Line::Command(Command::Reset),
        _ => Line::Prompt(trimmed.as_bytes().to_vec()),
    }
}

pub struct Shell {
    tasks: Arc<BoundedQueue<Task>>,
    commands: Arc<BoundedQueue<Command>>,
    sink: Box<dyn Write + Send>,
    next_task_id: u32,
}

impl Shell {
    pub fn new(
        tasks: Arc<BoundedQueue<Task>>,
        commands: Arc<BoundedQueue<Command>>,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            tasks,
            commands,
            sink,
            next_task_id: 1,
        }
    }

    /// Consumes console lines until `/quit` or end of input. A shutdown
    /// command is always enqueued before returning.
    pub fn run<R: BufRead>(&mut self, input: R) {
        let mut shutdown_sent = false;
        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("console read failed: {}", e);
                    break;
                }
            };
            match classify(&line) {
                Line::Empty => {}
                Line::Command(command) => {
                    self.send_command(command);
                    if command == Command::Shutdown {
                        shutdown_sent = true;
                        break;
                    }
                }
                Line::Prompt(prompt) => {
                    if prompt.starts_with(b"/") {
                        debug!(
                            "unknown command {:?} treated as prompt",
                            String::from_utf8_lossy(&prompt)
                        );
                    }
                    self.submit_task(prompt);
                }
            }
        }
        if !shutdown_sent {
            self.send_command(Command::Shutdown);
        }
    }

    /// Commands must reach the engine; retry until the queue drains
    fn send_command(&mut self, command: Command) {
        let mut command = command;
        loop {
            match self.commands.try_push(command) {
                Ok(()) => return,
                Err(rejected) => {
                    command = rejected;
                    thread::sleep(COMMAND_RETRY_SLEEP);
                }
            }
        }
    }

    fn submit_task(&mut self, prompt: Vec<u8>) {
        let task = Task {
            id: self.next_task_id,
            kind: TaskKind::Generate,
            prompt,
        };
        match self.tasks.try_push(task) {
            Ok(()) => {
                self.next_task_id += 1;
            }
            Err(task) => {
                warn!("{}, dropping task {}", ErrorKind::QueueFull("task"), task.id);
                if self
                    .sink
                    .write_all(QUEUE_FULL_WARNING.as_bytes())
                    .and_then(|_| self.sink.flush())
                    .is_err()
                {
                    warn!("output sink write failed");
                }
            }
        }
    }
}

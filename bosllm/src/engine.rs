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

//! Control loop driving the accelerator.
//!
//! The engine consumes the task and command queues, sequences the
//! driver through configure/start/poll/stream and pushes detokenized
//! output to the sink. Commands preempt a running generation at token
//! boundaries: cancellation is cooperative, checked once per token
//! period, and never aborts the in-flight hardware cycle.

use crate::hal::AcceleratorDriver;
use crate::irq::IrqService;
use crate::queue::BoundedQueue;
use crate::tokenizer;

use ii_logging::macros::*;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Task queue depth
pub const TASK_QUEUE_CAPACITY: usize = 100;

/// Command queue depth
pub const COMMAND_QUEUE_CAPACITY: usize = 10;

/// Sleep between queue polls while idle
const IDLE_SLEEP: Duration = Duration::from_millis(100);

const MARKER_GENERATING: &str = "[Generating] ";
const MARKER_EOS: &str = "[EOS]\n";
const MARKER_ABORTED: &str = "[Aborted]\n";
const MARKER_MEMORY_CLEARED: &str = "[Memory cleared]\n";
const MARKER_MAX_TOKENS: &str = "[Max tokens reached]\n";

/// Out-of-band control signal, preempts generation
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    Stop,
    Reset,
    Shutdown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskKind {
    Generate,
}

/// One text generation request
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Task {
    pub id: u32,
    pub kind: TaskKind,
    pub prompt: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Idle,
    Generating,
    ShuttingDown,
}

struct EngineState {
    status: Status,
    current_task_id: Option<u32>,
    cancel_flag: bool,
    reset_pending: bool,
}

impl EngineState {
    fn new() -> Self {
        Self {
            status: Status::Idle,
            current_task_id: None,
            cancel_flag: false,
            reset_pending: false,
        }
    }

    fn invariants_hold(&self) -> bool {
        match self.status {
            Status::Generating => self.current_task_id.is_some(),
            Status::Idle => {
                self.current_task_id.is_none() && !self.cancel_flag && !self.reset_pending
            }
            Status::ShuttingDown => true,
        }
    }
}

/// Wakeup the interrupt service uses to pace the engine instead of the
/// fixed poll sleep
pub struct TokenEvent {
    signal: Mutex<bool>,
    condvar: Condvar,
}

impl TokenEvent {
    pub fn new() -> Self {
        Self {
            signal: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Called from interrupt callbacks, must not block
    pub fn notify(&self) {
        let mut signaled = self.signal.lock().expect("token event lock failed");
        *signaled = true;
        self.condvar.notify_one();
    }

    /// Waits for a notification or `timeout`, consuming the signal
    fn wait(&self, timeout: Duration) {
        let mut signaled = self.signal.lock().expect("token event lock failed");
        if !*signaled {
            let (guard, _) = self
                .condvar
                .wait_timeout(signaled, timeout)
                .expect("token event lock failed");
            signaled = guard;
        }
        *signaled = false;
    }
}

pub struct Engine {
    tasks: Arc<BoundedQueue<Task>>,
    commands: Arc<BoundedQueue<Command>>,
    driver: AcceleratorDriver,
    sink: Box<dyn Write + Send>,
    state: EngineState,
    max_tokens: u32,
    poll_interval: Duration,
    token_event: Option<Arc<TokenEvent>>,
    fatal_error: Arc<AtomicBool>,
    irq: Option<IrqService>,
}

impl Engine {
    pub fn new(
        tasks: Arc<BoundedQueue<Task>>,
        commands: Arc<BoundedQueue<Command>>,
        driver: AcceleratorDriver,
        sink: Box<dyn Write + Send>,
        max_tokens: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tasks,
            commands,
            driver,
            sink,
            state: EngineState::new(),
            max_tokens,
            poll_interval,
            token_event: None,
            fatal_error: Arc::new(AtomicBool::new(false)),
            irq: None,
        }
    }

    /// Switches pacing from the poll sleep to interrupt wakeups
    pub fn set_token_event(&mut self, event: Arc<TokenEvent>) {
        self.token_event = Some(event);
    }

    /// Hands the interrupt service to the engine; it is stopped during
    /// shutdown, after the last driver access
    pub fn set_irq_service(&mut self, service: IrqService) {
        self.irq = Some(service);
    }

    /// Flag raised by the ERROR interrupt callback. Once set, the engine
    /// aborts the running generation and shuts down.
    pub fn fatal_error_flag(&self) -> Arc<AtomicBool> {
        self.fatal_error.clone()
    }

    /// Runs the state machine until shutdown
    pub fn run(mut self) {
        info!("engine running");
        while self.state.status != Status::ShuttingDown {
            self.idle_step();
        }
        self.driver.reset();
        if let Some(mut irq) = self.irq.take() {
            irq.stop();
        }
        info!("engine stopped");
    }

    /// One round of the top-level loop: commands first, then at most one
    /// task
    fn idle_step(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            match command {
                Command::Shutdown => {
                    info!("shutdown requested");
                    self.state.status = Status::ShuttingDown;
                    return;
                }
                Command::Reset => {
                    self.driver.reset();
                    self.emit(MARKER_MEMORY_CLEARED);
                }
                // nothing to stop while idle
                Command::Stop => {}
            }
        }

        if let Some(task) = self.tasks.try_pop() {
            self.state.current_task_id = Some(task.id);
            self.state.status = Status::Generating;
            debug_assert!(self.state.invariants_hold());

            self.generate(task);

            self.state.cancel_flag = false;
            self.state.reset_pending = false;
            self.state.current_task_id = None;
            if self.state.status != Status::ShuttingDown {
                self.state.status = Status::Idle;
            }
            debug_assert!(self.state.invariants_hold());
        } else {
            thread::sleep(IDLE_SLEEP);
        }
    }

    /// Streams one generation. Exactly one terminal marker is emitted on
    /// every path out of here.
    fn generate(&mut self, task: Task) {
        debug!(
            "task {}: generating from {} prompt bytes",
            task.id,
            task.prompt.len()
        );
        let prompt = tokenizer::encode(&task.prompt);
        self.driver.start_inference(task.id, &prompt);
        self.emit(MARKER_GENERATING);

        for _ in 0..self.max_tokens {
            self.drain_commands_generating();

            if self.fatal_error.load(Ordering::SeqCst) {
                error!("fatal hardware error reported by interrupt service");
                self.emit(MARKER_ABORTED);
                self.state.status = Status::ShuttingDown;
                return;
            }
            if self.state.cancel_flag {
                self.emit(MARKER_ABORTED);
                if self.state.reset_pending {
                    self.driver.reset();
                    self.emit(MARKER_MEMORY_CLEARED);
                }
                return;
            }

            let mut token = 0u32;
            if self.driver.next_token(&mut token) {
                if token == tokenizer::EOS_TOKEN {
                    self.emit(MARKER_EOS);
                    return;
                }
                match tokenizer::decode(token) {
                    Some(symbol) => self.emit(&symbol.to_string()),
                    None => debug!("task {}: token {} outside byte range", task.id, token),
                }
            } else if self.driver.status().is_error() {
                error!(
                    "task {}: device error 0x{:x}",
                    task.id,
                    self.driver.status().error_code
                );
                self.emit(MARKER_ABORTED);
                return;
            } else if self.driver.is_done() {
                // completed without a trailing EOS token
                self.emit(MARKER_EOS);
                return;
            }

            self.pace();
        }
        self.emit(MARKER_MAX_TOKENS);
    }

    fn drain_commands_generating(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            match command {
                Command::Shutdown => {
                    self.state.cancel_flag = true;
                    self.state.status = Status::ShuttingDown;
                }
                Command::Reset => {
                    self.state.cancel_flag = true;
                    self.state.reset_pending = true;
                }
                Command::Stop => {
                    self.state.cancel_flag = true;
                }
            }
        }
    }

    fn pace(&self) {
        match &self.token_event {
            Some(event) => event.wait(self.poll_interval),
            None => thread::sleep(self.poll_interval),
        }
    }

    /// Console output is unbuffered: every marker and token is flushed
    /// immediately
    fn emit(&mut self, text: &str) {
        let result = self
            .sink
            .write_all(text.as_bytes())
            .and_then(|_| self.sink.flush());
        if result.is_err() {
            warn!("output sink write failed");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{MemoryLayout, RegionSpec};
    use crate::hal::sim::SimRegisters;
    use crate::mem::{MemoryManager, RegionKind};
    use std::io;
    use std::time::Instant;

    #[derive(Clone)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn new() -> Self {
            SharedSink(Arc::new(Mutex::new(Vec::new())))
        }

        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        tasks: Arc<BoundedQueue<Task>>,
        commands: Arc<BoundedQueue<Command>>,
        sim: Arc<SimRegisters>,
        mem: Arc<MemoryManager>,
        output: SharedSink,
        fatal: Arc<AtomicBool>,
        handle: thread::JoinHandle<()>,
    }

    fn test_layout() -> MemoryLayout {
        MemoryLayout {
            weights: RegionSpec {
                phys: 0x1000_0000,
                size: 4096,
            },
            kv_cache: RegionSpec {
                phys: 0x3000_0000,
                size: 4096,
            },
            input_buffer: RegionSpec {
                phys: 0x2000_0000,
                size: 1024,
            },
            output_buffer: RegionSpec {
                phys: 0x2000_4000,
                size: 1024,
            },
        }
    }

    fn spawn_engine(eos_after: u32, max_tokens: u32) -> Harness {
        let sim = Arc::new(SimRegisters::new(eos_after));
        let mem = Arc::new(MemoryManager::new_heap(&test_layout()).expect("reservation failed"));
        let mut driver = AcceleratorDriver::new(sim.clone(), mem.clone());
        driver.configure(0x2000_0000, 0x2000_4000, 0x3000_0000, 128, max_tokens);

        let tasks = Arc::new(BoundedQueue::new(TASK_QUEUE_CAPACITY));
        let commands = Arc::new(BoundedQueue::new(COMMAND_QUEUE_CAPACITY));
        let output = SharedSink::new();
        let engine = Engine::new(
            tasks.clone(),
            commands.clone(),
            driver,
            Box::new(output.clone()),
            max_tokens,
            Duration::from_millis(2),
        );
        let fatal = engine.fatal_error_flag();
        let handle = thread::spawn(move || engine.run());
        Harness {
            tasks,
            commands,
            sim,
            mem,
            output,
            fatal,
            handle,
        }
    }

    fn wait_for(output: &SharedSink, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !output.contents().contains(needle) {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {:?} in {:?}",
                needle,
                output.contents()
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn push_task(harness: &Harness, id: u32, prompt: &[u8]) {
        harness
            .tasks
            .try_push(Task {
                id,
                kind: TaskKind::Generate,
                prompt: prompt.to_vec(),
            })
            .expect("task push failed");
    }

    fn shutdown(harness: Harness) -> String {
        while harness.commands.try_push(Command::Shutdown).is_err() {
            thread::sleep(Duration::from_millis(5));
        }
        harness.handle.join().expect("engine thread panicked");
        harness.output.contents()
    }

    #[test]
    fn test_generate_happy_path() {
        let harness = spawn_engine(5, 50);
        push_task(&harness, 1, b"hi");
        wait_for(&harness.output, MARKER_EOS);
        let output = shutdown(harness);
        // task id 1 seeds the alphabet walk at 'b'
        assert_eq!(output, "[Generating] bcdef[EOS]\n");
    }

    #[test]
    fn test_max_tokens_reached() {
        let harness = spawn_engine(100, 4);
        push_task(&harness, 1, b"hi");
        wait_for(&harness.output, MARKER_MAX_TOKENS);
        let output = shutdown(harness);
        assert_eq!(output, "[Generating] bcde[Max tokens reached]\n");
    }

    #[test]
    fn test_exactly_one_terminal_marker_per_task() {
        let harness = spawn_engine(3, 50);
        push_task(&harness, 1, b"first");
        push_task(&harness, 2, b"second");
        wait_for(&harness.output, MARKER_EOS);
        // wait until the second task terminated as well
        let deadline = Instant::now() + Duration::from_secs(5);
        while harness.output.contents().matches(MARKER_EOS).count() < 2 {
            assert!(Instant::now() < deadline, "second task never finished");
            thread::sleep(Duration::from_millis(5));
        }
        let output = shutdown(harness);
        let terminal_markers = output.matches(MARKER_EOS).count()
            + output.matches(MARKER_ABORTED).count()
            + output.matches(MARKER_MAX_TOKENS).count();
        assert_eq!(terminal_markers, 2);
        assert_eq!(output.matches(MARKER_GENERATING).count(), 2);
    }

    #[test]
    fn test_stop_aborts_without_clearing_kv() {
        let harness = spawn_engine(1000, 1000);
        let kv = *harness.mem.region(RegionKind::KvCache);
        (unsafe { kv.as_mut_slice() })[0] = 0xAA;

        push_task(&harness, 2, b"a long prompt");
        wait_for(&harness.output, MARKER_GENERATING);
        thread::sleep(Duration::from_millis(20));
        harness
            .commands
            .try_push(Command::Stop)
            .expect("command push failed");
        wait_for(&harness.output, MARKER_ABORTED);

        // the KV cache survives a plain stop
        assert_eq!(unsafe { kv.as_mut_slice() }[0], 0xAA);
        assert!(!harness.output.contents().contains(MARKER_MEMORY_CLEARED));

        // engine is back at idle and still serves commands
        harness
            .commands
            .try_push(Command::Reset)
            .expect("command push failed");
        wait_for(&harness.output, MARKER_MEMORY_CLEARED);
        shutdown(harness);
    }

    #[test]
    fn test_reset_aborts_and_clears_kv() {
        let harness = spawn_engine(1000, 1000);
        let kv = *harness.mem.region(RegionKind::KvCache);
        (unsafe { kv.as_mut_slice() })[0] = 0xAA;

        push_task(&harness, 2, b"a long prompt");
        wait_for(&harness.output, MARKER_GENERATING);
        thread::sleep(Duration::from_millis(20));
        harness
            .commands
            .try_push(Command::Reset)
            .expect("command push failed");
        wait_for(&harness.output, MARKER_MEMORY_CLEARED);

        let contents = harness.output.contents();
        let aborted = contents.find(MARKER_ABORTED).expect("no abort marker");
        let cleared = contents
            .find(MARKER_MEMORY_CLEARED)
            .expect("no clear marker");
        assert!(aborted < cleared);
        assert!(unsafe { kv.as_mut_slice() }.iter().all(|&b| b == 0));
        shutdown(harness);
    }

    #[test]
    fn test_shutdown_during_generation() {
        let harness = spawn_engine(1000, 1000);
        push_task(&harness, 1, b"prompt");
        wait_for(&harness.output, MARKER_GENERATING);
        harness
            .commands
            .try_push(Command::Shutdown)
            .expect("command push failed");
        harness.handle.join().expect("engine thread panicked");
        assert!(harness.output.contents().contains(MARKER_ABORTED));
        // device was reset on the way out
        assert_eq!(harness.sim.peek(crate::regs::AP_CTRL), 0);
    }

    #[test]
    fn test_idle_reset_emits_notice() {
        let harness = spawn_engine(4, 50);
        harness
            .commands
            .try_push(Command::Reset)
            .expect("command push failed");
        wait_for(&harness.output, MARKER_MEMORY_CLEARED);
        shutdown(harness);
    }

    #[test]
    fn test_device_error_returns_to_idle() {
        let harness = spawn_engine(1000, 1000);
        push_task(&harness, 1, b"prompt");
        wait_for(&harness.output, MARKER_GENERATING);
        harness.sim.inject_error(0x42);
        wait_for(&harness.output, MARKER_ABORTED);

        // non-fatal: the engine returns to idle and picks up more work
        push_task(&harness, 2, b"next");
        let deadline = Instant::now() + Duration::from_secs(5);
        while harness.output.contents().matches(MARKER_GENERATING).count() < 2 {
            assert!(Instant::now() < deadline, "second task never started");
            thread::sleep(Duration::from_millis(5));
        }
        let output = shutdown(harness);
        assert!(output.matches(MARKER_ABORTED).count() >= 2);
    }

    #[test]
    fn test_fatal_error_flag_shuts_down() {
        let harness = spawn_engine(1000, 1000);
        push_task(&harness, 1, b"prompt");
        wait_for(&harness.output, MARKER_GENERATING);
        harness.fatal.store(true, Ordering::SeqCst);
        harness.handle.join().expect("engine thread panicked");
        assert!(harness.output.contents().contains(MARKER_ABORTED));
    }
}

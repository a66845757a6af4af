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

//! In-process register backend with synthetic status progression.
//!
//! Used on hosts without the accelerator and in tests. A `START` write
//! latches the configuration block; every status-valid poll then
//! advances the token counter by one, emitting a deterministic
//! lowercase-alphabet walk seeded by the task id and finishing with the
//! EOS token after the configured count. The driver on top behaves
//! identically against this backend and real hardware.

use super::Registers;
use crate::cfgio::{status_flags, ConfigIn};
use crate::regs::{self, ap_ctrl, irq};
use crate::tokenizer;

use std::sync::Mutex;

/// Content tokens generated per task before EOS
pub const DEFAULT_EOS_AFTER: u32 = 16;

pub struct SimRegisters {
    state: Mutex<SimState>,
}

struct SimState {
    regs: [u32; regs::REG_WINDOW_SIZE / 4],
    running: bool,
    tokens_out: u32,
    eos_after: u32,
    record_writes: bool,
    write_log: Vec<(usize, u32)>,
}

impl SimState {
    fn config(&self) -> ConfigIn {
        let base = regs::CONFIG_BASE / 4;
        let mut words = [0u32; regs::CONFIG_WORDS];
        words.copy_from_slice(&self.regs[base..base + regs::CONFIG_WORDS]);
        ConfigIn::unpack(&words)
    }

    /// Produces the next status image. Called on every status-valid poll
    /// while a task is running.
    fn advance(&mut self) {
        self.tokens_out += 1;
        let task_id = self.config().task_id;

        let (token, flags) = if self.tokens_out > self.eos_after {
            self.running = false;
            self.regs[regs::AP_CTRL / 4] |= ap_ctrl::DONE | ap_ctrl::IDLE;
            self.regs[regs::ISR / 4] |= irq::DONE;
            (
                tokenizer::EOS_TOKEN,
                status_flags::VALID | status_flags::DONE,
            )
        } else {
            self.regs[regs::ISR / 4] |= irq::TOKEN_READY;
            (
                u32::from(b'a') + task_id.wrapping_add(self.tokens_out - 1) % 26,
                status_flags::VALID,
            )
        };

        let status = regs::STATUS_BASE / 4;
        self.regs[status] = token;
        self.regs[status + 1] = self.tokens_out;
        self.regs[status + 2] = 0;
        self.regs[status + 3] = flags;
        self.regs[regs::STATUS_VALID / 4] = 1;
    }

    fn start(&mut self) {
        self.running = true;
        self.tokens_out = 0;
        self.regs[regs::AP_CTRL / 4] = ap_ctrl::START;
        self.regs[regs::STATUS_VALID / 4] = 0;
        let status = regs::STATUS_BASE / 4;
        for word in self.regs[status..status + regs::STATUS_WORDS].iter_mut() {
            *word = 0;
        }
    }
}

impl SimRegisters {
    pub fn new(eos_after: u32) -> Self {
        Self {
            state: Mutex::new(SimState {
                regs: [0u32; regs::REG_WINDOW_SIZE / 4],
                running: false,
                tokens_out: 0,
                eos_after,
                record_writes: false,
                write_log: Vec::new(),
            }),
        }
    }

    /// Reads a register without triggering status progression
    pub fn peek(&self, offset: usize) -> u32 {
        let state = self.state.lock().expect("sim state lock failed");
        state.regs[offset / 4]
    }

    /// Starts or stops recording of register writes. Recording always
    /// begins with an empty log.
    pub fn set_record_writes(&self, enable: bool) {
        let mut state = self.state.lock().expect("sim state lock failed");
        state.record_writes = enable;
        state.write_log.clear();
    }

    /// Hands out the recorded writes and clears the log
    pub fn take_write_log(&self) -> Vec<(usize, u32)> {
        let mut state = self.state.lock().expect("sim state lock failed");
        std::mem::replace(&mut state.write_log, Vec::new())
    }

    /// Publishes a hardware-error status image and raises the ERROR
    /// interrupt, as a faulting device would
    pub fn inject_error(&self, error_code: u32) {
        let mut state = self.state.lock().expect("sim state lock failed");
        state.running = false;
        let status = regs::STATUS_BASE / 4;
        state.regs[status + 2] = error_code;
        state.regs[status + 3] = status_flags::VALID | status_flags::ERROR;
        state.regs[regs::STATUS_VALID / 4] = 1;
        state.regs[regs::ISR / 4] |= irq::ERROR;
    }
}

impl Registers for SimRegisters {
    fn read(&self, offset: usize) -> u32 {
        let mut state = self.state.lock().expect("sim state lock failed");
        if offset == regs::STATUS_VALID && state.running {
            state.advance();
        }
        state.regs[offset / 4]
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.state.lock().expect("sim state lock failed");
        if state.record_writes {
            state.write_log.push((offset, value));
        }
        match offset {
            regs::AP_CTRL => {
                if value & ap_ctrl::START != 0 {
                    state.start();
                } else {
                    state.regs[regs::AP_CTRL / 4] = value;
                    if value == 0 {
                        state.running = false;
                    }
                }
            }
            // write-1-to-clear
            regs::ISR => state.regs[regs::ISR / 4] &= !value,
            regs::IRQ_CLEAR => {
                if value != 0 {
                    state.regs[regs::ISR / 4] = 0;
                    state.regs[regs::STATUS_VALID / 4] = 0;
                }
            }
            _ => state.regs[offset / 4] = value,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_idle_until_started() {
        let sim = SimRegisters::new(4);
        assert_eq!(sim.read(regs::STATUS_VALID), 0);
        assert_eq!(sim.read(regs::STATUS_VALID), 0);
    }

    #[test]
    fn test_token_walk_and_eos() {
        let sim = SimRegisters::new(3);
        // task id 0: tokens a, b, c then EOS
        sim.write(regs::AP_CTRL, ap_ctrl::START);
        for expected in &[u32::from(b'a'), u32::from(b'b'), u32::from(b'c')] {
            assert_eq!(sim.read(regs::STATUS_VALID), 1);
            assert_eq!(sim.read(regs::STATUS_BASE), *expected);
        }
        assert_eq!(sim.read(regs::STATUS_VALID), 1);
        assert_eq!(sim.read(regs::STATUS_BASE), tokenizer::EOS_TOKEN);
        assert_eq!(
            sim.peek(regs::STATUS_BASE + 12),
            status_flags::VALID | status_flags::DONE
        );
        assert_ne!(sim.peek(regs::AP_CTRL) & ap_ctrl::DONE, 0);
        assert_ne!(sim.peek(regs::ISR) & irq::DONE, 0);
    }

    #[test]
    fn test_progression_seeded_by_task_id() {
        let sim = SimRegisters::new(2);
        // publish task id 1 in the configuration block before starting
        let mut config = ConfigIn::default();
        config.task_id = 1;
        for (idx, word) in config.pack().iter().enumerate() {
            sim.write(regs::CONFIG_BASE + 4 * idx, *word);
        }
        sim.write(regs::AP_CTRL, ap_ctrl::START);
        assert_eq!(sim.read(regs::STATUS_VALID), 1);
        assert_eq!(sim.read(regs::STATUS_BASE), u32::from(b'b'));
    }

    #[test]
    fn test_isr_write_one_to_clear() {
        let sim = SimRegisters::new(1);
        sim.write(regs::AP_CTRL, ap_ctrl::START);
        // run to completion to latch the DONE interrupt
        sim.read(regs::STATUS_VALID);
        sim.read(regs::STATUS_VALID);
        assert_ne!(sim.peek(regs::ISR) & irq::DONE, 0);
        sim.write(regs::ISR, irq::DONE);
        assert_eq!(sim.peek(regs::ISR) & irq::DONE, 0);
    }

    #[test]
    fn test_restart_clears_previous_status() {
        let sim = SimRegisters::new(1);
        sim.write(regs::AP_CTRL, ap_ctrl::START);
        sim.read(regs::STATUS_VALID);
        sim.read(regs::STATUS_VALID);
        sim.write(regs::AP_CTRL, ap_ctrl::START);
        assert_eq!(sim.peek(regs::STATUS_BASE + 4), 0);
        assert_eq!(sim.peek(regs::AP_CTRL), ap_ctrl::START);
    }

    #[test]
    fn test_error_injection() {
        let sim = SimRegisters::new(8);
        sim.write(regs::AP_CTRL, ap_ctrl::START);
        sim.inject_error(0xDEAD);
        assert_eq!(sim.read(regs::STATUS_VALID), 1);
        assert_eq!(sim.peek(regs::STATUS_BASE + 8), 0xDEAD);
        assert_ne!(sim.peek(regs::ISR) & irq::ERROR, 0);
    }
}

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

//! Interrupt service for the accelerator.
//!
//! A dedicated thread blocks on the UIO descriptor, reads the interrupt
//! status register on every event and dispatches the registered
//! callbacks per asserted bit before write-1-clearing exactly those
//! bits. Callbacks must not block: they only set atomics or wake the
//! engine. The driver stays the single source of truth for token data;
//! this service never interprets it.

use crate::hal::Registers;
use crate::regs::{self, irq};

use ii_logging::macros::*;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Wait timeout so the service loop can observe a stop request
const IRQ_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

pub type IrqCallback = Box<dyn Fn() + Send + Sync>;

/// Interrupt statistics, updated from the service thread
#[derive(Default)]
pub struct IrqStats {
    done: AtomicU64,
    ready: AtomicU64,
    token_ready: AtomicU64,
    error: AtomicU64,
    total: AtomicU64,
    spurious: AtomicU64,
}

impl IrqStats {
    pub fn snapshot(&self) -> IrqSnapshot {
        IrqSnapshot {
            done: self.done.load(Ordering::Relaxed),
            ready: self.ready.load(Ordering::Relaxed),
            token_ready: self.token_ready.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            spurious: self.spurious.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IrqSnapshot {
    pub done: u64,
    pub ready: u64,
    pub token_ready: u64,
    pub error: u64,
    pub total: u64,
    pub spurious: u64,
}

#[derive(Default)]
struct CallbackTable {
    done: Vec<IrqCallback>,
    ready: Vec<IrqCallback>,
    token_ready: Vec<IrqCallback>,
    error: Vec<IrqCallback>,
}

pub struct IrqService {
    uio: Option<uio::UioDevice>,
    regs: Arc<dyn Registers>,
    callbacks: Option<CallbackTable>,
    running: Arc<AtomicBool>,
    stats: Arc<IrqStats>,
    handle: Option<JoinHandle<()>>,
}

impl IrqService {
    /// Creates the service around a UIO descriptor opened for interrupt
    /// delivery and the shared register handle. Nothing runs until
    /// `start`.
    pub fn new(uio: uio::UioDevice, regs: Arc<dyn Registers>) -> Self {
        Self {
            uio: Some(uio),
            regs,
            callbacks: Some(CallbackTable::default()),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(IrqStats::default()),
            handle: None,
        }
    }

    fn table(&mut self) -> &mut CallbackTable {
        assert!(
            self.handle.is_none(),
            "callbacks must be registered before start"
        );
        self.callbacks.as_mut().expect("callback table moved")
    }

    pub fn on_done(&mut self, callback: IrqCallback) {
        self.table().done.push(callback);
    }

    pub fn on_ready(&mut self, callback: IrqCallback) {
        self.table().ready.push(callback);
    }

    pub fn on_token_ready(&mut self, callback: IrqCallback) {
        self.table().token_ready.push(callback);
    }

    pub fn on_error(&mut self, callback: IrqCallback) {
        self.table().error.push(callback);
    }

    /// Enables interrupts on the device and spawns the service thread
    pub fn start(&mut self) {
        assert!(self.handle.is_none(), "interrupt service already running");

        self.regs.write(regs::GIE, 1);
        self.regs.write(regs::IER, irq::DONE | irq::READY);
        self.running.store(true, Ordering::SeqCst);

        let uio = self.uio.take().expect("interrupt service restarted");
        let callbacks = Arc::new(self.callbacks.take().expect("callback table moved"));
        let window = self.regs.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();
        let handle = thread::Builder::new()
            .name("accel-irq".to_string())
            .spawn(move || service_loop(uio, window, callbacks, running, stats))
            .expect("cannot spawn interrupt service thread");
        self.handle = Some(handle);
    }

    /// Stops the thread and disables interrupt generation on the device
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.running.store(false, Ordering::SeqCst);
            if handle.join().is_err() {
                error!("interrupt service thread panicked");
            }
            self.regs.write(regs::IER, 0);
            self.regs.write(regs::GIE, 0);
            let stats = self.stats.snapshot();
            info!(
                "interrupt service stopped: {} interrupts ({} done, {} token, {} error, {} spurious)",
                stats.total, stats.done, stats.token_ready, stats.error, stats.spurious
            );
        }
    }

    pub fn stats(&self) -> IrqSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for IrqService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn service_loop(
    uio: uio::UioDevice,
    window: Arc<dyn Registers>,
    callbacks: Arc<CallbackTable>,
    running: Arc<AtomicBool>,
    stats: Arc<IrqStats>,
) {
    debug!("interrupt service running");
    while running.load(Ordering::SeqCst) {
        if let Err(e) = uio.irq_enable() {
            error!("interrupt re-arm failed: {}", e);
            break;
        }
        match uio.irq_wait_timeout(IRQ_WAIT_TIMEOUT) {
            // timeout, recheck the stop flag
            Ok(None) => continue,
            Ok(Some(_event_count)) => {
                stats.total.fetch_add(1, Ordering::Relaxed);
                let handled = dispatch_pending(&*window, &callbacks, &stats);
                if handled == 0 {
                    stats.spurious.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                error!("interrupt wait failed: {}", e);
                break;
            }
        }
    }
}

/// Reads the ISR, runs callbacks for every asserted bit and clears
/// exactly those bits. Returns the handled mask.
fn dispatch_pending(window: &dyn Registers, callbacks: &CallbackTable, stats: &IrqStats) -> u32 {
    let pending = window.read(regs::ISR) & irq::ALL;
    if pending == 0 {
        return 0;
    }
    if pending & irq::DONE != 0 {
        stats.done.fetch_add(1, Ordering::Relaxed);
        for callback in &callbacks.done {
            callback();
        }
    }
    if pending & irq::READY != 0 {
        stats.ready.fetch_add(1, Ordering::Relaxed);
        for callback in &callbacks.ready {
            callback();
        }
    }
    if pending & irq::TOKEN_READY != 0 {
        stats.token_ready.fetch_add(1, Ordering::Relaxed);
        for callback in &callbacks.token_ready {
            callback();
        }
    }
    if pending & irq::ERROR != 0 {
        stats.error.fetch_add(1, Ordering::Relaxed);
        error!("accelerator raised the hardware error interrupt");
        for callback in &callbacks.error {
            callback();
        }
    }
    window.write(regs::ISR, pending);
    pending
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hal::sim::SimRegisters;
    use crate::regs::ap_ctrl;

    fn run_sim_to_completion(sim: &SimRegisters) {
        sim.write(regs::AP_CTRL, ap_ctrl::START);
        while sim.peek(regs::ISR) & irq::DONE == 0 {
            sim.read(regs::STATUS_VALID);
        }
    }

    #[test]
    fn test_dispatch_counts_and_clears() {
        let sim = SimRegisters::new(2);
        run_sim_to_completion(&sim);
        // two token interrupts and the final done are pending
        assert_eq!(sim.peek(regs::ISR), irq::DONE | irq::TOKEN_READY);

        let callbacks = CallbackTable::default();
        let stats = IrqStats::default();
        let handled = dispatch_pending(&sim, &callbacks, &stats);
        assert_eq!(handled, irq::DONE | irq::TOKEN_READY);
        assert_eq!(sim.peek(regs::ISR), 0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.done, 1);
        assert_eq!(snapshot.token_ready, 1);
        assert_eq!(snapshot.error, 0);
    }

    #[test]
    fn test_dispatch_runs_registered_callbacks() {
        let sim = SimRegisters::new(1);
        run_sim_to_completion(&sim);

        let fired = Arc::new(AtomicU64::new(0));
        let fired_in_callback = fired.clone();
        let mut callbacks = CallbackTable::default();
        callbacks.done.push(Box::new(move || {
            fired_in_callback.fetch_add(1, Ordering::Relaxed);
        }));

        let stats = IrqStats::default();
        dispatch_pending(&sim, &callbacks, &stats);
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        // nothing pending on the second pass
        assert_eq!(dispatch_pending(&sim, &callbacks, &stats), 0);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dispatch_error_bit() {
        let sim = SimRegisters::new(4);
        sim.inject_error(7);

        let callbacks = CallbackTable::default();
        let stats = IrqStats::default();
        let handled = dispatch_pending(&sim, &callbacks, &stats);
        assert_eq!(handled, irq::ERROR);
        assert_eq!(stats.snapshot().error, 1);
        assert_eq!(sim.peek(regs::ISR), 0);
    }
}

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

use bosllm::config::{self, Config};
use bosllm::engine::{self, Command, Engine, TokenEvent};
use bosllm::error::{self, ErrorKind};
use bosllm::hal::sim::{self, SimRegisters};
use bosllm::hal::zynq::ZynqRegisters;
use bosllm::hal::{AcceleratorDriver, Registers};
use bosllm::irq::IrqService;
use bosllm::mem::{MemoryManager, RegionKind};
use bosllm::model::ModelWeights;
use bosllm::queue::BoundedQueue;
use bosllm::shell::Shell;
use bosllm::stage;

use ii_logging::macros::*;

use std::io;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

fn main() {
    let _log_guard = ii_logging::setup_for_app();

    let app = clap::App::new("bosllm")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            clap::Arg::with_name("config")
                .long("config")
                .value_name("PATH")
                .help("Set config file path")
                .required(false)
                .takes_value(true),
        );
    let matches = Config::add_args(app).get_matches();

    let config_path = matches
        .value_of("config")
        .unwrap_or(config::DEFAULT_CONFIG_PATH);
    let mut cfg = match Config::parse(config_path, matches.is_present("config")) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    cfg.apply_args(&matches);
    cfg.resolve();

    if let Err(e) = run(cfg) {
        error!("initialization failed: {}", e);
        process::exit(1);
    }
}

fn run(cfg: Config) -> error::Result<()> {
    info!(
        "bosllm {} starting ({} backend)",
        env!("CARGO_PKG_VERSION"),
        if cfg.simulation {
            "simulated"
        } else {
            "hardware"
        }
    );

    let registers: Arc<dyn Registers> = if cfg.simulation {
        Arc::new(SimRegisters::new(sim::DEFAULT_EOS_AFTER))
    } else {
        Arc::new(ZynqRegisters::open(&cfg.uio_name)?)
    };

    let mem = Arc::new(if cfg.simulation {
        MemoryManager::new_heap(&cfg.memory)?
    } else {
        MemoryManager::new_devmem(&cfg.memory)?
    });

    let model = match ModelWeights::load(&cfg.model_path) {
        Ok(model) => Some(model),
        Err(e) => {
            if cfg.strict_weights {
                return Err(e);
            }
            warn!(
                "weight load failed: {}; continuing without staged weights",
                e
            );
            None
        }
    };
    if let Some(model) = &model {
        let staged = stage::stage(model, mem.region(RegionKind::Weights))?;
        debug!(
            "layer 0 at 0x{:x}, lm head at 0x{:x}",
            staged.layer_address(0),
            staged.lm_head_addr
        );
    }

    let mut driver = AcceleratorDriver::new(registers.clone(), mem.clone());
    let stride = model
        .as_ref()
        .map(|model| model.config.hidden_size * 2)
        .unwrap_or(0);
    driver.configure(
        mem.region(RegionKind::InputBuffer).phys,
        mem.region(RegionKind::OutputBuffer).phys,
        mem.region(RegionKind::KvCache).phys,
        stride,
        cfg.max_tokens,
    );
    if let Some(model) = &model {
        driver.set_model_geometry(&model.config);
    }

    let tasks = Arc::new(BoundedQueue::new(engine::TASK_QUEUE_CAPACITY));
    let commands = Arc::new(BoundedQueue::new(engine::COMMAND_QUEUE_CAPACITY));

    let mut engine = Engine::new(
        tasks.clone(),
        commands.clone(),
        driver,
        Box::new(io::stdout()),
        cfg.max_tokens,
        cfg.poll_interval(),
    );

    // A second descriptor on the same UIO device delivers interrupts;
    // the first one only carries the register mapping.
    if !cfg.simulation {
        match uio::UioDevice::open_by_name(&cfg.uio_name) {
            Ok(device) => {
                let mut irq_service = IrqService::new(device, registers.clone());
                let event = Arc::new(TokenEvent::new());
                let wake = event.clone();
                irq_service.on_token_ready(Box::new(move || wake.notify()));
                let wake = event.clone();
                irq_service.on_done(Box::new(move || wake.notify()));
                let fatal = engine.fatal_error_flag();
                let wake = event.clone();
                irq_service.on_error(Box::new(move || {
                    fatal.store(true, Ordering::SeqCst);
                    wake.notify();
                }));
                irq_service.start();
                engine.set_irq_service(irq_service);
                engine.set_token_event(event);
            }
            Err(e) => warn!(
                "interrupt delivery unavailable ({}); using status polling",
                e
            ),
        }
    }

    {
        let commands = commands.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            let _ = commands.try_push(Command::Shutdown);
        }) {
            warn!("cannot install SIGINT handler: {}", e);
        }
    }

    let engine_thread = thread::Builder::new()
        .name("engine".to_string())
        .spawn(move || engine.run())?;

    let mut shell = Shell::new(tasks, commands, Box::new(io::stdout()));
    let stdin = io::stdin();
    shell.run(stdin.lock());

    engine_thread
        .join()
        .map_err(|_| ErrorKind::General("engine thread panicked".to_string()))?;
    info!("orderly shutdown complete");
    Ok(())
    // DDR reservations in `mem` are released here, after the engine joined
}

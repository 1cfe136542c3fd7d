/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{thread, time::Instant};

use env_logger::{Builder, Env};
use log::{info, warn};
use paged_vm::{
    modules::block_device::FileBlockDeviceModule, AccessType, ProcessId, Status, VMConfig,
    VMSystem, VirtualAddress, PAGE_SIZE,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};

const WORKERS: u64 = 4;
const PAGES: usize = 64;
const ROUNDS: usize = 5000;
const SHARED_NAME: &str = "mailbox";

#[derive(Default)]
struct Counters {
    hits: usize,
    faults: usize,
    traps: usize,
}

/// Runs one access the way a cpu would, resolving page faults on the way.
fn touch(system: &VMSystem, pid: ProcessId, addr: VirtualAddress, mode: AccessType, counters: &mut Counters) {
    loop {
        match Status::from(&system.access(pid, addr, mode)) {
            Status::Ok => {
                counters.hits += 1;
                return;
            }
            Status::PageFault => {
                counters.faults += 1;
                if let Err(err) = system.page_fault(pid, addr) {
                    warn!("process {}: fault at {:#x} failed: {}", pid, addr, err);
                    counters.traps += 1;
                    return;
                }
            }
            Status::Trap => {
                counters.traps += 1;
                return;
            }
        }
    }
}

fn worker(system: &VMSystem, seed: u64) -> Counters {
    let pid = system.create_process();
    let private = (16 * PAGE_SIZE) as VirtualAddress;
    let shared = (4096 * PAGE_SIZE) as VirtualAddress;
    let mut counters = Counters::default();

    if let Err(err) = system.create_segment(pid, private, PAGES, AccessType::ReadWrite) {
        warn!("process {}: {}", pid, err);
        return counters;
    }
    if let Err(err) = system.create_shared_segment(pid, shared, 8, SHARED_NAME, AccessType::ReadWrite) {
        warn!("process {}: {}", pid, err);
        return counters;
    }

    let mut rand = SmallRng::seed_from_u64(seed);
    for _ in 0..ROUNDS {
        let page = rand.gen_range(0..PAGES) as VirtualAddress;
        let addr = private + page * PAGE_SIZE as VirtualAddress + rand.gen_range(0..PAGE_SIZE as u32 / 4) * 4;
        if rand.gen_bool(0.3) {
            if system.write_virtual(pid, addr, &(seed as u32).to_le_bytes()).is_err() {
                counters.traps += 1;
            }
        } else {
            touch(system, pid, addr, AccessType::Read, &mut counters);
        }

        // an occasional message through the shared segment
        if rand.gen_bool(0.05) {
            let slot = shared + (seed as VirtualAddress % 8) * PAGE_SIZE as VirtualAddress;
            touch(system, pid, slot, AccessType::Write, &mut counters);
        }
        // and an occasional stray access
        if rand.gen_bool(0.01) {
            touch(system, pid, 0, AccessType::Read, &mut counters);
        }
    }

    match system.clone_process(pid) {
        Ok(child) => {
            let mut word = [0u8; 4];
            let _ = system.read_virtual(child, private, &mut word);
            if let Err(err) = system.destroy_process(child) {
                warn!("clone of process {}: {}", pid, err);
            }
        }
        Err(err) => warn!("process {} could not be cloned: {}", pid, err),
    }
    if let Err(err) = system.destroy_process(pid) {
        warn!("process {}: {}", pid, err);
    }
    counters
}

fn main() {
    Builder::from_env(Env::default())
        .filter_level(log::LevelFilter::Info)
        .format_module_path(false)
        .init();

    let device = match FileBlockDeviceModule::new("stress.swap".to_owned(), 4096) {
        Ok(device) => device,
        Err(err) => {
            warn!("could not create swap file: {}", err);
            return;
        }
    };
    let config = VMConfig {
        user_frames: 32,
        kernel_frames: 24,
        ..Default::default()
    };
    let system = match VMSystem::new(config, device) {
        Ok(system) => system,
        Err(err) => {
            warn!("invalid configuration: {}", err);
            return;
        }
    };

    let start = Instant::now();
    let totals = thread::scope(|scope| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|seed| {
                let system = &system;
                scope.spawn(move || worker(system, seed))
            })
            .collect();

        let mut totals = Counters::default();
        for handle in handles {
            match handle.join() {
                Ok(counters) => {
                    totals.hits += counters.hits;
                    totals.faults += counters.faults;
                    totals.traps += counters.traps;
                }
                Err(_) => warn!("worker panicked"),
            }
        }
        totals
    });

    info!(
        "{} workers done in {:?}: {} hits, {} page faults, {} traps",
        WORKERS,
        start.elapsed(),
        totals.hits,
        totals.faults,
        totals.traps
    );
    system.diag();

    // deleting needs a calling process
    let owner = system.create_process();
    if let Err(err) = system.delete_shared_segment(owner, SHARED_NAME) {
        warn!("shared segment {:?}: {}", SHARED_NAME, err);
    }
    let _ = system.destroy_process(owner);
}

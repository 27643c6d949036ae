// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process signal flags for simulator main loops.
//
// SIGINT/SIGTERM request a graceful exit, SIGUSR1 a report of the current
// virtual time, SIGUSR2 toggles the statistics window. Handlers only set
// flags; all work happens at the loop head.

use std::sync::atomic::{AtomicBool, Ordering};

static EXITING: AtomicBool = AtomicBool::new(false);
static TIME_REPORT: AtomicBool = AtomicBool::new(false);
static STATS: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_exit(_sig: libc::c_int) {
    EXITING.store(true, Ordering::Relaxed);
}

extern "C" fn handle_time_report(_sig: libc::c_int) {
    TIME_REPORT.store(true, Ordering::Relaxed);
}

extern "C" fn handle_stats(_sig: libc::c_int) {
    STATS.store(true, Ordering::Relaxed);
}

/// Install the handlers. Call once at simulator startup.
pub fn install() {
    let exit: extern "C" fn(libc::c_int) = handle_exit;
    let time_report: extern "C" fn(libc::c_int) = handle_time_report;
    let stats: extern "C" fn(libc::c_int) = handle_stats;
    unsafe {
        libc::signal(libc::SIGINT, exit as libc::sighandler_t);
        libc::signal(libc::SIGTERM, exit as libc::sighandler_t);
        libc::signal(libc::SIGUSR1, time_report as libc::sighandler_t);
        libc::signal(libc::SIGUSR2, stats as libc::sighandler_t);
    }
}

/// Whether a graceful exit was requested.
pub fn exiting() -> bool {
    EXITING.load(Ordering::Relaxed)
}

/// Consume a pending SIGUSR1 time-report request.
pub fn take_time_report() -> bool {
    TIME_REPORT.swap(false, Ordering::Relaxed)
}

/// Whether the statistics window was enabled via SIGUSR2.
pub fn stats_enabled() -> bool {
    STATS.load(Ordering::Relaxed)
}

//! Terminal lifecycle for the board.
//!
//! **Why stderr?**
//! The board renders entirely to stderr so stdout stays free for shell
//! pipelines (`pinthread | tee board.log` keeps working) and for the log
//! output of the non-interactive commands, which share this binary.

use crossterm::event::{DisableMouseCapture, EnableMouseCapture};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use signal_hook::consts::SIGTERM;
use signal_hook::flag::register;
use std::io::{stderr, BufWriter, Stderr};
use std::panic;
use std::sync::{atomic::AtomicBool, Arc};

/// Crossterm over a buffered stderr writer.
///
/// The `BufWriter` batches escape sequences from one frame into a handful of
/// `write(2)` calls, which keeps redraws on a busy board from flickering.
pub type Tui = Terminal<CrosstermBackend<BufWriter<Stderr>>>;

/// Enables raw mode and enters the alternate screen. Pair every call with
/// [`restore_tui`].
///
/// Mouse capture is switched on as well, so clicks on the pin list reach the
/// event loop instead of starting a terminal text selection.
///
/// # Errors
///
/// Returns `Err` if raw mode cannot be enabled, the screen switch cannot be
/// written, or the backend fails to query the terminal size. Raw mode may
/// already be on when the later steps fail, so callers still run
/// [`restore_tui`] on the error path.
pub fn init_tui() -> std::io::Result<Tui> {
    let mut out = BufWriter::new(stderr());
    enable_raw_mode()?;
    execute!(out, EnterAlternateScreen, EnableMouseCapture)?;
    Terminal::new(CrosstermBackend::new(out))
}

/// Leaves the alternate screen and disables raw mode. Idempotent.
///
/// ratatui does not restore the terminal on `Drop`, so this runs at the
/// single exit point of the event loop and from the panic hook.
///
/// # Errors
///
/// Returns `Err` if raw mode cannot be disabled or the escape sequences
/// cannot be written. The panic hook ignores the error; a second attempt
/// would fail the same way.
pub fn restore_tui() -> std::io::Result<()> {
    disable_raw_mode()?;
    execute!(stderr(), LeaveAlternateScreen, DisableMouseCapture)?;
    Ok(())
}

/// Chains a hook that restores the terminal before the panic message prints.
/// Must be installed before [`init_tui`].
///
/// The previous hook (the default printer, or the test harness's) still runs
/// afterwards. Without this, a panic inside the event loop leaves the shell in
/// raw mode on the alternate screen with the message out of sight.
pub fn install_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let _ = restore_tui();
        original_hook(panic_info);
    }));
}

/// Returns a flag that flips to `true` when the process receives SIGTERM.
/// The event loop polls it on every heartbeat and quits through the normal
/// exit path, so pending store writes and terminal restore both happen.
///
/// # Errors
///
/// Returns `Err` if the OS refuses to install the handler. Startup treats
/// this as fatal before the terminal is touched.
pub fn register_sigterm() -> std::io::Result<Arc<AtomicBool>> {
    let term = Arc::new(AtomicBool::new(false));
    register(SIGTERM, Arc::clone(&term))?;
    Ok(term)
}

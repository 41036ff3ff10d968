//! A small application that zwilling can spawn. Each worker answers
//! every line it receives with a JSON line describing itself.
//!
//! Environment knobs:
//! * `DEMO_LOAD_DELAY_MS`: how long loading takes.
//! * `DEMO_FAIL_LOAD`: loading fails.
//! * `DEMO_FAIL_HOOK`: the `starting_worker_process` listener fails.

use anyhow::{bail, Context, Result};
use serde_json::json;
use slog_scope::{debug, info};
use std::cell::Cell;
use std::env;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::rc::Rc;
use std::thread::sleep;
use std::time::Duration;
use zwilling::loader::{Application, Hooks, Loader};

#[derive(Default)]
struct Demo {
    /// The process that loaded the application.
    loaded_by: u32,

    /// Whether this worker was duplicated off a preloader, and how
    /// many times the startup listener ran in it.
    duplicated: Rc<Cell<Option<bool>>>,
    generation: Rc<Cell<u32>>,
}

impl Demo {
    fn answer(&self, conn: UnixStream) -> Result<()> {
        let mut writer = conn.try_clone()?;
        for line in BufReader::new(conn).lines() {
            let line = line?;
            let reply = json!({
                "pid": std::process::id(),
                "loaded_by": self.loaded_by,
                "duplicated": self.duplicated.get(),
                "generation": self.generation.get(),
                "echo": line,
            });
            writeln!(writer, "{}", reply)?;
        }
        Ok(())
    }
}

impl Application for Demo {
    fn load(&mut self, hooks: &mut Hooks) -> Result<()> {
        if let Some(delay) = env::var_os("DEMO_LOAD_DELAY_MS") {
            let delay: u64 = delay
                .to_string_lossy()
                .parse()
                .context("DEMO_LOAD_DELAY_MS is not a number")?;
            sleep(Duration::from_millis(delay));
        }
        if env::var_os("DEMO_FAIL_LOAD").is_some() {
            bail!("DEMO_FAIL_LOAD is set");
        }
        self.loaded_by = std::process::id();

        let fail_hook = env::var_os("DEMO_FAIL_HOOK").is_some();
        let duplicated = self.duplicated.clone();
        let generation = self.generation.clone();
        hooks.on_starting_worker_process(move |was_duplicated| {
            if fail_hook {
                bail!("DEMO_FAIL_HOOK is set");
            }
            duplicated.set(Some(was_duplicated));
            generation.set(generation.get() + 1);
            Ok(())
        });
        info!("loaded");
        Ok(())
    }

    fn serve(&mut self, listener: UnixListener) -> Result<()> {
        for conn in listener.incoming() {
            let conn = conn.context("Could not accept a connection")?;
            if let Err(e) = self.answer(conn) {
                debug!("connection failed"; "error" => %e);
            }
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    Loader::new(Demo::default()).run()
}

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(100);
const PHASE_TEMPLATE: &str = "{spinner:.cyan} {msg} [{elapsed}]";

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Startup phase reporting on stderr: a spinner per phase on a TTY,
/// `==> phase` lines otherwise.
#[derive(Clone, Debug)]
pub struct StartupUi {
    pretty: bool,
}

/// `console_owned` is true when the console sink redraws the terminal;
/// `Auto` then falls back to plain lines so the two do not interleave.
fn wants_spinners(mode: UiMode, stderr_is_tty: bool, console_owned: bool) -> bool {
    match (mode, stderr_is_tty) {
        (_, false) | (UiMode::Plain, _) => false,
        (UiMode::Pretty, true) => true,
        (UiMode::Auto, true) => !console_owned,
    }
}

impl StartupUi {
    pub fn new(mode: UiMode, stderr_is_tty: bool, console_owned: bool) -> Self {
        Self {
            pretty: wants_spinners(mode, stderr_is_tty, console_owned),
        }
    }

    pub fn is_pretty(&self) -> bool {
        self.pretty
    }

    /// Phase that reports failure unless `done` is called.
    pub fn phase(&self, name: &str) -> Phase {
        let spinner = self.pretty.then(|| {
            let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
            bar.set_style(
                ProgressStyle::with_template(PHASE_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_message(name.to_string());
            bar.enable_steady_tick(TICK);
            bar
        });
        if spinner.is_none() {
            eprintln!("==> {name}");
        }
        Phase {
            name: name.to_string(),
            began: Instant::now(),
            spinner,
            settled: false,
        }
    }
}

pub struct Phase {
    name: String,
    began: Instant,
    spinner: Option<ProgressBar>,
    settled: bool,
}

impl Phase {
    pub fn done(mut self) {
        self.settle(true);
    }

    fn settle(&mut self, ok: bool) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }
        let line = format!(
            "{} {} in {}",
            if ok { "✔" } else { "✘" },
            self.name,
            human_duration(self.began.elapsed())
        );
        match self.spinner.take() {
            Some(bar) if ok => bar.finish_with_message(line),
            Some(bar) => bar.abandon_with_message(line),
            None => eprintln!("{line}"),
        }
    }
}

impl Drop for Phase {
    fn drop(&mut self) {
        self.settle(false);
    }
}

fn human_duration(duration: Duration) -> String {
    match duration.as_millis() {
        0 => format!("{}us", duration.as_micros()),
        ms @ 1..=999 => format!("{ms}ms"),
        _ => format!("{:.2}s", duration.as_secs_f64()),
    }
}

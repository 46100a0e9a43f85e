//! Operator commands read from stdin on a dedicated thread.

use std::io::BufRead;
use std::path::PathBuf;

use tokio::sync::mpsc;

const USAGE: &str = "commands: job <path> <arg> | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Submit the script at `path` with a numeric argument.
    SubmitJob { path: PathBuf, arg: f64 },
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    match verb {
        "quit" | "exit" => Ok(Some(Command::Quit)),
        "job" => {
            let path = words.next().ok_or("job: missing script path")?;
            let arg = match words.next() {
                Some(a) => a
                    .parse::<f64>()
                    .map_err(|_| format!("job: argument {:?} is not a number", a))?,
                None => 0.0,
            };
            if words.next().is_some() {
                return Err("job: too many arguments".to_owned());
            }
            Ok(Some(Command::SubmitJob {
                path: PathBuf::from(path),
                arg,
            }))
        }
        other => Err(format!("unknown command {:?}; {}", other, USAGE)),
    }
}

/// Spawn the stdin reader. End of input counts as `quit`.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Command> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("p2pjs-stdin".into())
        .spawn(move || {
            println!("{}", USAGE);
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse(&line) {
                    Ok(Some(cmd)) => {
                        let quit = cmd == Command::Quit;
                        if tx.send(cmd).is_err() || quit {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => println!("{}", msg),
                }
            }
            let _ = tx.send(Command::Quit);
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "cannot start command reader");
    }
    rx
}

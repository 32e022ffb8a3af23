use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use volkey::crypto::Keyfile;
use volkey::{Error, FileMode, Interaction, Result};
use zeroize::Zeroizing;

pub const PASSWORD_ENV: &str = "VOLKEY_PASSWORD";

/// Interaction port for the command line.
///
/// Answers that were given as flags are returned without prompting; the rest
/// is asked on the terminal. Without a terminal, confirmations fall back to
/// "no" for destructive steps unless `--yes` was given.
pub struct TerminalPort {
    assume_yes: bool,
    keyfiles: Vec<PathBuf>,
    file: Option<PathBuf>,
    choice: Option<usize>,
    interrupted: Arc<AtomicBool>,
    busy: bool,
}

impl TerminalPort {
    pub fn new(assume_yes: bool, keyfiles: Vec<PathBuf>, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            assume_yes,
            keyfiles,
            file: None,
            choice: None,
            interrupted,
            busy: false,
        }
    }

    /// Preselects the answer to the next file prompt.
    pub fn with_file(mut self, file: Option<PathBuf>) -> Self {
        self.file = file;
        self
    }

    /// Preselects the answer to the next choice prompt.
    pub fn with_choice(mut self, choice: Option<usize>) -> Self {
        self.choice = choice;
        self
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.interrupted.load(Ordering::SeqCst) {
            Err(self.cancelled())
        } else {
            Ok(())
        }
    }

    fn prompt_line(&self, prompt: &str) -> Result<String> {
        self.check_interrupt()?;
        eprint!("{prompt}");
        io::stderr().flush().map_err(Error::io("cannot write prompt"))?;
        let mut line = String::new();
        let read = io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(Error::io("cannot read from terminal"))?;
        self.check_interrupt()?;
        if read == 0 {
            return Err(self.cancelled());
        }
        trim_newline(&mut line);
        Ok(line)
    }
}

impl Interaction for TerminalPort {
    fn password(&mut self, prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.check_interrupt()?;

        //  VOLKEY_PASSWORD="supersecret" volkey backup
        if let Ok(pw) = std::env::var(PASSWORD_ENV) {
            if !pw.is_empty() {
                return Ok(Zeroizing::new(pw.into_bytes()));
            }
        }

        //  echo "supersecret" | volkey backup
        if !io::stdin().is_terminal() {
            let mut buf = Zeroizing::new(String::new());
            io::stdin()
                .read_line(&mut buf)
                .map_err(Error::io("cannot read password from stdin"))?;
            trim_newline(&mut buf);
            if !buf.is_empty() {
                return Ok(Zeroizing::new(buf.as_bytes().to_vec()));
            }
            return Err(Error::InvalidParams("no password provided".into()));
        }

        let pw = Zeroizing::new(
            rpassword::prompt_password(format!("{prompt}: "))
                .map_err(Error::io("cannot read password"))?,
        );
        self.check_interrupt()?;
        if pw.is_empty() {
            return Err(self.cancelled());
        }
        Ok(Zeroizing::new(pw.as_bytes().to_vec()))
    }

    fn keyfiles(&mut self) -> Result<Vec<Keyfile>> {
        self.keyfiles.iter().map(|path| Keyfile::read(path)).collect()
    }

    fn new_credential(&mut self) -> Result<volkey::Credential> {
        if std::env::var(PASSWORD_ENV).is_ok_and(|pw| !pw.is_empty()) || !io::stdin().is_terminal() {
            return self.credential("New password");
        }

        let first = self.password("New password")?;
        let second = self.password("Confirm password")?;
        if *first != *second {
            return Err(Error::InvalidParams("passwords do not match".into()));
        }
        let keyfiles = self.keyfiles()?;
        Ok(volkey::Credential::new(first, keyfiles))
    }

    fn select_file(&mut self, title: &str, mode: FileMode) -> Result<PathBuf> {
        self.check_interrupt()?;
        let path = match self.file.take() {
            Some(path) => path,
            None if io::stdin().is_terminal() => {
                let line = self.prompt_line(&format!("{title}: "))?;
                if line.is_empty() {
                    return Err(self.cancelled());
                }
                PathBuf::from(line)
            }
            None => return Err(Error::InvalidParams(format!("{title}: no file given"))),
        };
        if mode == FileMode::Existing && !path.is_file() {
            return Err(Error::Io {
                context: format!("cannot open {}", path.display()),
                source: io::ErrorKind::NotFound.into(),
            });
        }
        Ok(path)
    }

    fn confirm(&mut self, message: &str, default: bool, warning: bool) -> Result<bool> {
        self.check_interrupt()?;
        if self.assume_yes {
            return Ok(true);
        }
        if !io::stdin().is_terminal() {
            return Ok(default && !warning);
        }

        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let lead = if warning { "WARNING: " } else { "" };
        let answer = self.prompt_line(&format!("{lead}{message} {hint} "))?;
        Ok(match answer.trim().to_ascii_lowercase().as_str() {
            "" => default,
            "y" | "yes" => true,
            _ => false,
        })
    }

    fn choose(&mut self, message: &str, options: &[&str]) -> Result<Option<usize>> {
        self.check_interrupt()?;
        if let Some(choice) = self.choice.take() {
            return Ok((choice < options.len()).then_some(choice));
        }
        if !io::stdin().is_terminal() {
            return Ok(None);
        }

        eprintln!("{message}");
        for (i, option) in options.iter().enumerate() {
            eprintln!("  {}) {option}", i + 1);
        }
        let answer = self.prompt_line("Choice: ")?;
        Ok(answer
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=options.len()).contains(n))
            .map(|n| n - 1))
    }

    fn info(&mut self, message: &str) {
        println!("{message}");
    }

    fn warning(&mut self, message: &str) {
        eprintln!("warning: {message}");
    }

    fn error(&mut self, message: &str) {
        eprintln!("error: {message}");
    }

    fn begin_busy(&mut self, message: &str) {
        if io::stderr().is_terminal() {
            eprint!("{message}... ");
            self.busy = true;
        }
    }

    fn end_busy(&mut self) {
        if std::mem::take(&mut self.busy) {
            eprintln!("done");
        }
    }
}

fn trim_newline(s: &mut String) {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
}
